//! Internet reachability tracking
//!
//! The monitor polls the ledger's liveness check and keeps the answer in an
//! `AtomicBool`, so the packet path can check it without awaiting the network.

use offline_tx::NonceLedger;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
    Unchanged,
}

pub struct ConnectivityMonitor<L: NonceLedger> {
    ledger: Arc<L>,
    online: AtomicBool,
    interval: Duration,
}

impl<L: NonceLedger + 'static> ConnectivityMonitor<L> {
    /// Starts offline until the first check says otherwise
    pub fn new(ledger: Arc<L>, interval: Duration) -> Self {
        Self {
            ledger,
            online: AtomicBool::new(false),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Check reachability once and record the result
    pub async fn check(&self) -> Transition {
        let now_online = self.ledger.is_reachable().await;
        let was_online = self.online.swap(now_online, Ordering::Relaxed);

        match (was_online, now_online) {
            (false, true) => {
                info!("Ledger reachable; node is online");
                Transition::WentOnline
            }
            (true, false) => {
                info!("Ledger unreachable; node is offline");
                Transition::WentOffline
            }
            _ => Transition::Unchanged,
        }
    }

    /// Poll every interval and run `on_online` on each offline to online transition
    pub fn spawn<F, Fut>(self: &Arc<Self>, cancel: CancellationToken, on_online: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if monitor.check().await == Transition::WentOnline {
                            on_online().await;
                        }
                    }
                }
            }
            debug!("Connectivity monitor stopped");
        })
    }
}
