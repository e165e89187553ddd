//! Mesh packet routing with TTL and deduplication

use crate::codec::{Packet, PacketType, PeerId};
use crate::manager::{BroadcastReport, ConnectionManager};
use crate::radio::RadioTransport;
use crate::session::SessionId;
use bloomfilter::Bloom;
use solana_sdk::hash::{hashv, Hash};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bloom filter capacity for packet deduplication
const BLOOM_FILTER_CAPACITY: usize = 10000;

/// Bloom filter false positive rate
const BLOOM_FILTER_FP_RATE: f64 = 0.01;

/// Queue between the manager's packet handler and the routing task
const ROUTER_QUEUE_CAPACITY: usize = 256;

/// What the router decided for one inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Seen before
    Duplicate,
    /// Addressed only to us
    Deliver,
    /// Addressed to someone else and still has hops left
    Forward,
    /// Broadcast with hops left
    DeliverAndForward,
    /// Addressed to someone else with no hops left
    Drop,
}

impl Route {
    pub fn delivers(self) -> bool {
        matches!(self, Route::Deliver | Route::DeliverAndForward)
    }

    pub fn forwards(self) -> bool {
        matches!(self, Route::Forward | Route::DeliverAndForward)
    }
}

/// Identity of a packet for duplicate suppression; TTL is excluded so relayed
/// copies of the same packet collide
pub fn packet_fingerprint(packet: &Packet) -> Hash {
    hashv(&[
        packet.sender_id.as_bytes(),
        &packet.timestamp.to_be_bytes(),
        &[packet.packet_type as u8],
        &packet.payload,
    ])
}

/// Bloom filter that starts over once it has absorbed its design capacity
struct SeenPackets {
    bloom: Bloom<[u8; 32]>,
    inserted: usize,
}

impl SeenPackets {
    fn new() -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(BLOOM_FILTER_CAPACITY, BLOOM_FILTER_FP_RATE),
            inserted: 0,
        }
    }

    /// True if the fingerprint was already present
    fn check_and_set(&mut self, fingerprint: &Hash) -> bool {
        let key = fingerprint.to_bytes();
        if self.bloom.check(&key) {
            return true;
        }

        if self.inserted >= BLOOM_FILTER_CAPACITY {
            debug!("Dedup filter full; resetting");
            self.bloom.clear();
            self.inserted = 0;
        }
        self.bloom.set(&key);
        self.inserted += 1;
        false
    }
}

/// Routes packets reassembled by the connection manager
///
/// Packets for us (directly or by broadcast) go to the delivery channel; packets
/// with hops left are re-broadcast with `ttl - 1` to every session except the one
/// they arrived on.
pub struct PacketRouter<R: RadioTransport> {
    local_id: PeerId,
    manager: Arc<ConnectionManager<R>>,
    seen: Mutex<SeenPackets>,
    deliveries: mpsc::Sender<(Packet, SessionId)>,
    application_relayed: Vec<PacketType>,
}

impl<R: RadioTransport> PacketRouter<R> {
    /// Returns the router and the receiver of packets delivered to this node
    pub fn new(
        local_id: PeerId,
        manager: Arc<ConnectionManager<R>>,
    ) -> (Self, mpsc::Receiver<(Packet, SessionId)>) {
        let (deliveries, delivered) = mpsc::channel(ROUTER_QUEUE_CAPACITY);
        info!("PacketRouter initialized for local peer {}", local_id);

        (
            Self {
                local_id,
                manager,
                seen: Mutex::new(SeenPackets::new()),
                deliveries,
                application_relayed: Vec::new(),
            },
            delivered,
        )
    }

    /// Deliver broadcasts of `packet_type` without re-broadcasting them
    ///
    /// The application relays these itself once it has updated their contents.
    pub fn relay_in_application(mut self, packet_type: PacketType) -> Self {
        if !self.application_relayed.contains(&packet_type) {
            self.application_relayed.push(packet_type);
        }
        self
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Decide what to do with a packet, recording it as seen
    pub fn route(&self, packet: &Packet) -> Route {
        let duplicate = match self.seen.lock() {
            Ok(mut seen) => seen.check_and_set(&packet_fingerprint(packet)),
            Err(_) => false,
        };
        if duplicate {
            return Route::Duplicate;
        }

        match packet.recipient_id {
            Some(recipient) if recipient == self.local_id => Route::Deliver,
            Some(_) if packet.ttl > 0 => Route::Forward,
            Some(_) => Route::Drop,
            None if packet.ttl > 0 && !self.application_relayed.contains(&packet.packet_type) => {
                Route::DeliverAndForward
            }
            None => Route::Deliver,
        }
    }

    /// Mark a locally originated packet as seen so echoes are not re-delivered
    pub fn mark_seen(&self, packet: &Packet) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.check_and_set(&packet_fingerprint(packet));
        }
    }

    /// Route one packet: forward it if it has hops left, then deliver it locally if it is ours
    pub async fn handle(&self, packet: Packet, from: SessionId) -> Route {
        let route = self.route(&packet);

        match route {
            Route::Duplicate => {
                debug!("Duplicate packet from {} discarded", packet.sender_id);
            }
            Route::Drop => {
                debug!(
                    "Packet from {} for {:?} has no hops left; discarding",
                    packet.sender_id, packet.recipient_id
                );
            }
            _ => {}
        }

        if route.forwards() {
            let report = self.forward(&packet, &from).await;
            debug!(
                "Forwarded packet from {} to {}/{} sessions",
                packet.sender_id,
                report.delivered(),
                report.outcomes.len()
            );
        }

        if route.delivers() && self.deliveries.send((packet, from)).await.is_err() {
            warn!("Delivery receiver dropped; packet discarded");
        }

        route
    }

    async fn forward(&self, packet: &Packet, from: &SessionId) -> BroadcastReport {
        let mut relayed = packet.clone();
        relayed.ttl = packet.ttl.saturating_sub(1);
        self.manager.broadcast_except(&relayed, Some(from)).await
    }

    /// Install this router as the manager's packet handler and start routing
    ///
    /// The returned task ends when `cancel` fires.
    pub fn attach(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<(Packet, SessionId)>(ROUTER_QUEUE_CAPACITY);

        self.manager.set_packet_handler(move |packet, from| {
            if let Err(e) = tx.try_send((packet, from)) {
                warn!("Router queue rejected packet: {}", e);
            }
        });

        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some((packet, from)) => {
                            router.handle(packet, from).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("Router task stopped");
        })
    }
}
