//! The relay service wiring the mesh to the ledger
//!
//! Transaction packets that arrive while the ledger is reachable are submitted
//! and their relayers paid. Otherwise the payload waits in the outbox and, while
//! the relay policy allows, travels on with this node's hop recorded. Detached
//! co-signatures are merged into queued payloads.

use crate::connectivity::ConnectivityMonitor;
use anyhow::anyhow;
use ble_mesh::{
    BroadcastReport, ConnectionManager, DeviceId, DiscoveredDevice, LocalIdentity, Packet,
    PacketRouter, PacketType, PeerId, PeerInfo, RadioTransport, SessionId,
};
use chrono::Utc;
use offline_tx::{
    add_detached_signature, is_fully_signed, merge_signatures, settle_relayer_fees,
    submit_payload, DetachedSignature, LedgerError, MeshRelayForwarder, NonceError, NonceLedger,
    OfflineTransactionPayload, Outbox, SettlementPlan, SettlementReport, SubmissionOutcome,
    TransferRequest, TxError, TxResult,
};
use shared::{Config, RelayConfig};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the node did with one delivered packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Submitted(SubmissionOutcome),
    /// Held for later submission; `relayed` if it went back out with our hop recorded
    Queued { payload_id: Uuid, relayed: bool },
    /// A co-signature was merged into a queued payload
    SignatureApplied { payload_id: Uuid, complete: bool },
    Rejected(String),
    Ignored,
}

/// Confirmation checks before an unconfirmed submission's relayers are given up on
const MAX_SETTLEMENT_CHECKS: u32 = 20;

/// Failures that say nothing about the payload itself; it is kept for a later attempt
fn is_transient(error: &TxError) -> bool {
    matches!(
        error,
        TxError::Ledger(LedgerError::Rpc(_)) | TxError::Nonce(NonceError::Rpc(_))
    )
}

/// A submitted payload whose relayers are paid once it confirms
#[derive(Debug, Clone)]
struct PendingSettlement {
    payload: OfflineTransactionPayload,
    signature: Signature,
    checks: u32,
}

pub struct RelayNode<R: RadioTransport, L: NonceLedger> {
    manager: Arc<ConnectionManager<R>>,
    router: Arc<PacketRouter<R>>,
    ledger: Arc<L>,
    connectivity: Arc<ConnectivityMonitor<L>>,
    relayer: Arc<Keypair>,
    forwarder: MeshRelayForwarder,
    outbox: Mutex<Outbox>,
    /// Queued payloads a flush is currently submitting
    in_flight: Mutex<HashSet<Uuid>>,
    unsettled: Mutex<Vec<PendingSettlement>>,
    relay: RelayConfig,
    identity: LocalIdentity,
    packet_ttl: u8,
    window: chrono::Duration,
    dialed: Mutex<HashMap<DeviceId, SessionId>>,
    deliveries: Mutex<Option<mpsc::Receiver<(Packet, SessionId)>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<R, L> RelayNode<R, L>
where
    R: RadioTransport + 'static,
    L: NonceLedger + 'static,
{
    pub fn new(
        manager: Arc<ConnectionManager<R>>,
        ledger: Arc<L>,
        relayer: Keypair,
        config: &Config,
    ) -> Self {
        let local_id = PeerId::random();
        let (router, deliveries) = PacketRouter::new(local_id, Arc::clone(&manager));
        let router = router.relay_in_application(PacketType::Transaction);
        let window = config.relay.non_durable_window();
        let identity = LocalIdentity::new(PeerInfo::new(
            local_id,
            config.mesh.device_name.clone(),
            relayer.pubkey(),
        ));

        info!(
            "Relay node {} using relayer key {} ({} hops at {} lamports)",
            local_id,
            relayer.pubkey(),
            config.relay.max_relay_hops,
            config.relay.relayer_fee_per_hop
        );

        Self {
            connectivity: Arc::new(ConnectivityMonitor::new(
                Arc::clone(&ledger),
                config.relay.connectivity_check_interval(),
            )),
            forwarder: MeshRelayForwarder::new(relayer.pubkey(), window)
                .with_hop_limit(config.relay.max_relay_hops),
            outbox: Mutex::new(Outbox::new(config.relay.outbox_capacity)),
            in_flight: Mutex::new(HashSet::new()),
            unsettled: Mutex::new(Vec::new()),
            relay: config.relay.clone(),
            manager,
            router: Arc::new(router),
            ledger,
            relayer: Arc::new(relayer),
            identity,
            packet_ttl: config.mesh.packet_ttl,
            window,
            dialed: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(Some(deliveries)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.router.local_id()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn relayer(&self) -> Pubkey {
        self.relayer.pubkey()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<R>> {
        &self.manager
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor<L>> {
        &self.connectivity
    }

    pub async fn outbox_len(&self) -> usize {
        self.outbox.lock().await.len()
    }

    pub async fn is_queued(&self, id: &Uuid) -> bool {
        self.outbox.lock().await.contains(id)
    }

    pub async fn queued_payload(&self, id: &Uuid) -> Option<OfflineTransactionPayload> {
        self.outbox.lock().await.get(id).cloned()
    }

    /// Submitted payloads whose relayers are not yet paid
    pub async fn unsettled_len(&self) -> usize {
        self.unsettled.lock().await.len()
    }

    /// A transfer carrying this node's relay policy
    pub fn transfer_request(&self, recipient: Pubkey, amount: u64) -> TransferRequest {
        TransferRequest::new(recipient, amount).with_relay_config(&self.relay)
    }

    /// Bring up the radio in both roles and start the background tasks
    ///
    /// A node runs once; after `shutdown` build a new one.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let deliveries = self
            .deliveries
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("relay node {} already started", self.local_id()))?;

        self.manager.initialize().await?;
        self.manager.start_scanning().await?;
        self.manager.start_advertising(&self.identity).await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.router.attach(self.cancel.child_token()));
        tasks.push(self.spawn_delivery_loop(deliveries));
        tasks.push(self.spawn_dialer(self.manager.subscribe_discoveries()));

        let node = Arc::downgrade(self);
        tasks.push(self.connectivity.spawn(self.cancel.child_token(), move || {
            let node = node.clone();
            async move {
                if let Some(node) = node.upgrade() {
                    node.flush_outbox().await;
                }
            }
        }));
        tasks.push(self.spawn_settlement_loop());

        info!("Relay node {} started", self.local_id());
        Ok(())
    }

    fn spawn_delivery_loop(
        self: &Arc<Self>,
        mut deliveries: mpsc::Receiver<(Packet, SessionId)>,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = deliveries.recv() => match next {
                        Some((packet, from)) => {
                            let disposition = node.handle_packet(packet, from).await;
                            debug!("Packet handled: {:?}", disposition);
                        }
                        None => break,
                    },
                }
            }
            debug!("Delivery loop stopped");
        })
    }

    /// Retry relayer payouts for submissions that had not confirmed yet
    fn spawn_settlement_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let cancel = self.cancel.child_token();
        let period = self.connectivity.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if node.connectivity.is_online() {
                            node.settle_pending().await;
                        }
                    }
                }
            }
            debug!("Settlement loop stopped");
        })
    }

    /// Open a central session to every mesh device the scan turns up
    fn spawn_dialer(
        self: &Arc<Self>,
        mut discoveries: broadcast::Receiver<DiscoveredDevice>,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                let device = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = discoveries.recv() => match next {
                        Ok(device) => device,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!("Dialer skipped {} discoveries", missed);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                node.dial(&device.device_id).await;
            }
            debug!("Dialer stopped");
        })
    }

    /// Connect unless a live session to `device` already exists
    pub async fn dial(&self, device: &DeviceId) -> Option<SessionId> {
        let mut dialed = self.dialed.lock().await;
        if let Some(existing) = dialed.get(device) {
            if self.manager.session_info(existing).is_some() {
                return Some(existing.clone());
            }
        }

        match self.manager.connect(device).await {
            Ok(session) => {
                dialed.insert(device.clone(), session.clone());
                Some(session)
            }
            Err(e) => {
                debug!("Not connecting to {}: {}", device, e);
                None
            }
        }
    }

    pub async fn handle_packet(&self, packet: Packet, from: SessionId) -> Disposition {
        match packet.packet_type {
            PacketType::Transaction => self.handle_transaction(&packet, &from).await,
            PacketType::Signature => self.handle_signature(&packet).await,
            other => {
                debug!("Ignoring {:?} packet from {}", other, packet.sender_id);
                Disposition::Ignored
            }
        }
    }

    async fn handle_transaction(&self, packet: &Packet, from: &SessionId) -> Disposition {
        let mut payload = match OfflineTransactionPayload::from_packet(packet) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Undecodable transaction from {}: {}", packet.sender_id, e);
                return Disposition::Rejected(e.to_string());
            }
        };
        debug!(
            "Payload {} from {} (hop {}/{})",
            payload.id,
            from,
            payload.relay_metadata.hop_count,
            payload.relay_metadata.max_hops
        );
        self.forwarder.cap_hops(&mut payload);

        if let Some(result) = self.try_submit(&payload).await {
            match result {
                Ok(outcome) => return Disposition::Submitted(outcome),
                Err(e) if is_transient(&e) => {
                    warn!("Ledger unavailable for payload {}; relaying instead: {}", payload.id, e);
                }
                Err(e) => {
                    warn!("Payload {} rejected: {}", payload.id, e);
                    return Disposition::Rejected(e.to_string());
                }
            }
        }

        self.hold_and_relay(payload, Some(from)).await
    }

    /// Submit now unless offline, still unsigned, or already being submitted
    async fn try_submit(&self, payload: &OfflineTransactionPayload) -> Option<TxResult<SubmissionOutcome>> {
        if !self.connectivity.is_online() || !is_fully_signed(payload) {
            return None;
        }
        if !self.in_flight.lock().await.insert(payload.id) {
            debug!("Payload {} is already being submitted", payload.id);
            return None;
        }
        let result = self.submit_and_settle(payload).await;
        self.in_flight.lock().await.remove(&payload.id);
        Some(result)
    }

    /// Queue the payload and pass it on with our hop recorded
    ///
    /// A payload already queued only contributes signatures the queued copy lacks;
    /// it was relayed when first seen.
    async fn hold_and_relay(
        &self,
        payload: OfflineTransactionPayload,
        from: Option<&SessionId>,
    ) -> Disposition {
        let payload_id = payload.id;
        {
            let mut outbox = self.outbox.lock().await;
            if let Some(queued) = outbox.get(&payload_id) {
                let merged = merge_signatures(queued, &payload);
                if merged.signatures.len() > queued.signatures.len() {
                    debug!("Payload {} gained signatures from another copy", payload_id);
                    outbox.replace(merged);
                }
                return Disposition::Queued {
                    payload_id,
                    relayed: false,
                };
            }
            if let Err(e) = outbox.push(payload.clone()) {
                return Disposition::Rejected(e.to_string());
            }
        }

        let Some(next) = self.forwarder.forward(&payload, Utc::now()) else {
            return Disposition::Queued {
                payload_id,
                relayed: false,
            };
        };

        let relayed = match self.send_payload(&next, from).await {
            Ok(report) => report.delivered() > 0,
            Err(e) => {
                warn!("Could not relay payload {}: {}", payload_id, e);
                false
            }
        };
        Disposition::Queued {
            payload_id,
            relayed,
        }
    }

    async fn send_payload(
        &self,
        payload: &OfflineTransactionPayload,
        except: Option<&SessionId>,
    ) -> TxResult<BroadcastReport> {
        let packet = payload.to_packet(self.local_id(), self.packet_ttl)?;
        self.router.mark_seen(&packet);

        let report = self.manager.broadcast_except(&packet, except).await;
        info!(
            "Payload {} sent to {}/{} sessions (hop {}/{})",
            payload.id,
            report.delivered(),
            report.outcomes.len(),
            payload.relay_metadata.hop_count,
            payload.relay_metadata.max_hops
        );
        Ok(report)
    }

    async fn handle_signature(&self, packet: &Packet) -> Disposition {
        let detached = match DetachedSignature::from_packet(packet) {
            Ok(detached) => detached,
            Err(e) => {
                warn!("Undecodable signature from {}: {}", packet.sender_id, e);
                return Disposition::Rejected(e.to_string());
            }
        };

        let complete = {
            let mut outbox = self.outbox.lock().await;
            let Some(queued) = outbox.get(&detached.payload_id) else {
                debug!("No queued payload {} for signature", detached.payload_id);
                return Disposition::Ignored;
            };

            let updated = match add_detached_signature(
                queued,
                detached.entry.public_key,
                detached.entry.signature,
            ) {
                Ok(updated) => updated,
                Err(e) => {
                    warn!("Signature for payload {} rejected: {}", detached.payload_id, e);
                    return Disposition::Rejected(e.to_string());
                }
            };
            let complete = is_fully_signed(&updated);
            outbox.replace(updated);
            complete
        };

        info!(
            "Applied signature from {} to payload {} (complete: {})",
            detached.entry.public_key, detached.payload_id, complete
        );
        if complete && self.connectivity.is_online() {
            self.flush_outbox().await;
        }

        Disposition::SignatureApplied {
            payload_id: detached.payload_id,
            complete,
        }
    }

    /// Hand a locally built payload to the network
    ///
    /// It is submitted directly when possible. Otherwise it is queued and broadcast
    /// unchanged, since the originator is not a relayer.
    pub async fn originate(&self, mut payload: OfflineTransactionPayload) -> Disposition {
        self.forwarder.cap_hops(&mut payload);
        if let Some(result) = self.try_submit(&payload).await {
            match result {
                Ok(outcome) => return Disposition::Submitted(outcome),
                Err(e) if is_transient(&e) => {
                    warn!("Ledger unavailable for payload {}; using the mesh: {}", payload.id, e);
                }
                Err(e) => return Disposition::Rejected(e.to_string()),
            }
        }

        let payload_id = payload.id;
        if let Err(e) = self.outbox.lock().await.push(payload.clone()) {
            return Disposition::Rejected(e.to_string());
        }
        let relayed = match self.send_payload(&payload, None).await {
            Ok(report) => report.delivered() > 0,
            Err(e) => return Disposition::Rejected(e.to_string()),
        };
        Disposition::Queued {
            payload_id,
            relayed,
        }
    }

    /// Broadcast a co-signature for a payload held elsewhere in the mesh
    pub async fn send_signature(&self, signature: &DetachedSignature) -> TxResult<BroadcastReport> {
        let packet = signature.to_packet(self.local_id(), self.packet_ttl)?;
        self.router.mark_seen(&packet);
        Ok(self.manager.broadcast(&packet).await)
    }

    /// Submit every fully signed queued payload
    ///
    /// Payloads stay queued while they are submitted, so signatures and copies that
    /// arrive meanwhile land on the queued entry. An entry leaves the outbox once
    /// submitted or finally rejected; transient ledger failures leave it for the
    /// next flush. Expired blockhash payloads are dropped first.
    pub async fn flush_outbox(&self) -> Vec<SubmissionOutcome> {
        let ready: Vec<_> = {
            let mut outbox = self.outbox.lock().await;
            outbox.prune_expired(Utc::now(), self.window);
            let mut in_flight = self.in_flight.lock().await;
            let ready: Vec<_> = outbox
                .iter()
                .filter(|payload| is_fully_signed(*payload) && !in_flight.contains(&payload.id))
                .cloned()
                .collect();
            in_flight.extend(ready.iter().map(|payload| payload.id));
            ready
        };

        let mut outcomes = Vec::new();
        for payload in &ready {
            match self.submit_and_settle(payload).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if is_transient(&e) => {
                    warn!("Payload {} kept for retry: {}", payload.id, e);
                }
                Err(e) => {
                    warn!("Dropping payload {}: {}", payload.id, e);
                    self.outbox.lock().await.remove(&payload.id);
                }
            }
            self.in_flight.lock().await.remove(&payload.id);
        }

        if !ready.is_empty() {
            info!(
                "Outbox flushed: {} submitted, {} still queued",
                outcomes.len(),
                self.outbox_len().await
            );
        }
        self.settle_pending().await;
        outcomes
    }

    async fn submit_and_settle(&self, payload: &OfflineTransactionPayload) -> TxResult<SubmissionOutcome> {
        let outcome = submit_payload(self.ledger.as_ref(), payload).await?;
        self.outbox.lock().await.remove(&payload.id);

        if SettlementPlan::for_payload(payload).total() == 0 {
            return Ok(outcome);
        }
        if !outcome.confirmed {
            info!(
                "Payload {} submitted as {} but not yet confirmed; relayers paid later",
                payload.id, outcome.signature
            );
            self.unsettled.lock().await.push(PendingSettlement {
                payload: payload.clone(),
                signature: outcome.signature,
                checks: 1,
            });
            return Ok(outcome);
        }

        match settle_relayer_fees(
            self.ledger.as_ref(),
            self.relayer.as_ref(),
            payload,
            &outcome.signature,
        )
        .await
        {
            Ok(report) => log_settlement(&report),
            Err(e) => warn!("Relayer settlement for payload {} failed: {}", payload.id, e),
        }
        Ok(outcome)
    }

    /// Pay the relayers of every earlier submission that has since confirmed
    ///
    /// Submissions still unconfirmed, or whose check hit a transient ledger failure,
    /// wait for the next round. A submission that failed on-chain owes nothing.
    pub async fn settle_pending(&self) -> Vec<SettlementReport> {
        let pending = std::mem::take(&mut *self.unsettled.lock().await);
        if pending.is_empty() {
            return Vec::new();
        }

        let mut reports = Vec::new();
        let mut waiting = Vec::new();
        for mut entry in pending {
            match settle_relayer_fees(
                self.ledger.as_ref(),
                self.relayer.as_ref(),
                &entry.payload,
                &entry.signature,
            )
            .await
            {
                Ok(report) => {
                    log_settlement(&report);
                    reports.push(report);
                }
                Err(TxError::Ledger(LedgerError::NotConfirmed(_))) => {
                    entry.checks += 1;
                    if entry.checks >= MAX_SETTLEMENT_CHECKS {
                        warn!(
                            "Payload {} ({}) never confirmed; relayers not paid",
                            entry.payload.id, entry.signature
                        );
                    } else {
                        waiting.push(entry);
                    }
                }
                Err(e) if is_transient(&e) => waiting.push(entry),
                Err(e) => warn!(
                    "Abandoning settlement for payload {}: {}",
                    entry.payload.id, e
                ),
            }
        }

        if !waiting.is_empty() {
            debug!("{} submissions still awaiting settlement", waiting.len());
            self.unsettled.lock().await.extend(waiting);
        }
        reports
    }

    /// Stop the background tasks and the radio
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Shutting down relay node {}", self.local_id());
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Relay task ended abnormally: {}", e);
            }
        }

        self.manager.shutdown().await?;
        Ok(())
    }
}

fn log_settlement(report: &SettlementReport) {
    info!(
        "Settled payload {}: {} lamports to {} relayers, {} failed",
        report.payload_id,
        report.total_paid(),
        report.paid().count(),
        report.failures().count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_failures_are_transient() {
        assert!(is_transient(&TxError::Ledger(LedgerError::Rpc("timeout".into()))));
        assert!(is_transient(&TxError::Nonce(NonceError::Rpc("timeout".into()))));
        assert!(!is_transient(&TxError::Ledger(LedgerError::SubmitFailed(
            "preflight".into()
        ))));
        assert!(!is_transient(&TxError::InvalidAmount));
    }
}
