//! Dual-mode (central + peripheral) connection manager
//!
//! Owns the session table and the background tasks: one dispatch loop consuming
//! radio events, one health-check loop and, while scanning, one scan refresh loop.

use crate::codec::{self, Packet};
use crate::error::{MeshError, MeshResult};
use crate::radio::{DeviceId, DiscoveredDevice, InboundChunk, LocalIdentity, RadioEvents, RadioPower, RadioTransport};
use crate::session::{SessionId, SessionInfo, SessionRole, TransportSession};
use dashmap::DashMap;
use futures::future::join_all;
use shared::MeshNetworkConfig;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the discovered-device broadcast channel
const DISCOVERY_CHANNEL_CAPACITY: usize = 64;

/// Callback receiving every reassembled packet with the session it arrived on
pub type PacketHandler = Arc<dyn Fn(Packet, SessionId) + Send + Sync>;

/// Lifecycle of the physical radio as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Ready,
    Scanning,
    Advertising,
    ScanningAndAdvertising,
    ShuttingDown,
}

impl ManagerState {
    pub fn is_scanning(self) -> bool {
        matches!(self, ManagerState::Scanning | ManagerState::ScanningAndAdvertising)
    }

    pub fn is_advertising(self) -> bool {
        matches!(self, ManagerState::Advertising | ManagerState::ScanningAndAdvertising)
    }

    /// Initialized and not shutting down
    pub fn is_running(self) -> bool {
        !matches!(self, ManagerState::Uninitialized | ManagerState::ShuttingDown)
    }

    /// State after turning scanning on or off
    pub fn with_scanning(self, on: bool) -> MeshResult<Self> {
        use ManagerState::*;
        match (self, on) {
            (Uninitialized | ShuttingDown, true) => Err(MeshError::InvalidState {
                state: self,
                operation: "start scanning",
            }),
            (Uninitialized | ShuttingDown, false) => Ok(self),
            (Ready, true) => Ok(Scanning),
            (Advertising, true) => Ok(ScanningAndAdvertising),
            (Scanning | ScanningAndAdvertising, true) => Ok(self),
            (Scanning, false) => Ok(Ready),
            (ScanningAndAdvertising, false) => Ok(Advertising),
            (Ready | Advertising, false) => Ok(self),
        }
    }

    /// State after turning advertising on or off
    pub fn with_advertising(self, on: bool) -> MeshResult<Self> {
        use ManagerState::*;
        match (self, on) {
            (Uninitialized | ShuttingDown, true) => Err(MeshError::InvalidState {
                state: self,
                operation: "start advertising",
            }),
            (Uninitialized | ShuttingDown, false) => Ok(self),
            (Ready, true) => Ok(Advertising),
            (Scanning, true) => Ok(ScanningAndAdvertising),
            (Advertising | ScanningAndAdvertising, true) => Ok(self),
            (Advertising, false) => Ok(Ready),
            (ScanningAndAdvertising, false) => Ok(Scanning),
            (Ready | Scanning, false) => Ok(self),
        }
    }
}

/// Result of sending to one session
#[derive(Debug)]
pub struct SendOutcome {
    pub session: SessionId,
    pub result: MeshResult<()>,
}

/// Per-session results of a broadcast
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub outcomes: Vec<SendOutcome>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SendOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// State reachable from the background tasks
struct Shared<R> {
    radio: Arc<R>,
    config: MeshNetworkConfig,
    state: RwLock<ManagerState>,
    sessions: DashMap<SessionId, TransportSession>,
    /// Central session opened for each dialed device
    dialed: DashMap<DeviceId, SessionId>,
    /// Central connects in progress, each holding a slot under `max_connections`
    pending_connects: std::sync::Mutex<usize>,
    /// Serializes whole transmissions when peripheral writes share one channel
    peripheral_write: Mutex<()>,
    handler: std::sync::RwLock<Option<PacketHandler>>,
    discoveries: broadcast::Sender<DiscoveredDevice>,
}

/// A connection slot held for the duration of one central connect
struct SlotReservation<'a> {
    pending: &'a std::sync::Mutex<usize>,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = pending.saturating_sub(1);
        }
    }
}

/// Owned BLE connection manager; nothing here is global
pub struct ConnectionManager<R: RadioTransport> {
    shared: Arc<Shared<R>>,
    /// Radio events parked between a shutdown and the next initialize
    events: Mutex<Option<RadioEvents>>,
    shutdown: std::sync::Mutex<CancellationToken>,
    dispatch_task: Mutex<Option<JoinHandle<RadioEvents>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    scan_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<R: RadioTransport> ConnectionManager<R> {
    pub fn new(radio: Arc<R>, config: MeshNetworkConfig) -> Self {
        let (discoveries, _) = broadcast::channel(DISCOVERY_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                radio,
                config,
                state: RwLock::new(ManagerState::Uninitialized),
                sessions: DashMap::new(),
                dialed: DashMap::new(),
                pending_connects: std::sync::Mutex::new(0),
                peripheral_write: Mutex::new(()),
                handler: std::sync::RwLock::new(None),
                discoveries,
            }),
            events: Mutex::new(None),
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
            dispatch_task: Mutex::new(None),
            health_task: Mutex::new(None),
            scan_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MeshNetworkConfig {
        &self.shared.config
    }

    pub async fn state(&self) -> ManagerState {
        *self.shared.state.read().await
    }

    /// Wait for the radio to power on and start the dispatch and health-check loops
    pub async fn initialize(&self) -> MeshResult<()> {
        let mut state = self.shared.state.write().await;
        if *state != ManagerState::Uninitialized {
            return Err(MeshError::InvalidState {
                state: *state,
                operation: "initialize",
            });
        }

        info!("Initializing dual-mode BLE connection manager");

        let parked = self.events.lock().await.take();
        let events = match parked.or_else(|| self.shared.radio.take_events()) {
            Some(events) => events,
            None => {
                return Err(MeshError::RadioUnavailable(
                    "Radio event channels already claimed".to_string(),
                ))
            }
        };

        if let Err(e) = self.wait_powered_on(&events).await {
            *self.events.lock().await = Some(events);
            return Err(e);
        }

        let token = CancellationToken::new();
        if let Ok(mut shutdown) = self.shutdown.lock() {
            *shutdown = token.clone();
        }

        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            events,
            token.child_token(),
        ));
        let health = tokio::spawn(health_loop(Arc::clone(&self.shared), token.child_token()));

        *self.dispatch_task.lock().await = Some(dispatch);
        *self.health_task.lock().await = Some(health);
        *state = ManagerState::Ready;

        info!("Connection manager ready");
        Ok(())
    }

    async fn wait_powered_on(&self, events: &RadioEvents) -> MeshResult<()> {
        let wait = self.shared.config.power_on_timeout();
        let mut power = events.power.clone();

        if *power.borrow() != RadioPower::PoweredOn {
            info!("Waiting up to {:?} for the radio to power on", wait);
        }

        let waited = timeout(wait, power.wait_for(|p| *p == RadioPower::PoweredOn))
            .await
            .map(|result| result.map(|_| ()));

        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MeshError::RadioUnavailable(
                "Radio power channel closed".to_string(),
            )),
            Err(_) => {
                error!("Radio did not power on within {:?}", wait);
                Err(MeshError::RadioUnavailable(format!(
                    "Radio not powered on within {:?}",
                    wait
                )))
            }
        }
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .map(|token| token.clone())
            .unwrap_or_default()
    }

    async fn ensure_running(&self, operation: &'static str) -> MeshResult<()> {
        let state = *self.shared.state.read().await;
        if state.is_running() {
            Ok(())
        } else {
            Err(MeshError::InvalidState { state, operation })
        }
    }

    /// Start the central role; discovered devices are published to `subscribe_discoveries`
    pub async fn start_scanning(&self) -> MeshResult<()> {
        let mut state = self.shared.state.write().await;
        let next = state.with_scanning(true)?;
        if state.is_scanning() {
            warn!("Scanning already active");
            return Ok(());
        }

        let wait = self.shared.config.connection_timeout();
        timeout(wait, self.shared.radio.start_scanning())
            .await
            .map_err(|_| MeshError::AdapterError(format!("Start scan timed out after {:?}", wait)))??;

        let token = self.shutdown_token().child_token();
        let handle = tokio::spawn(scan_loop(Arc::clone(&self.shared), token.clone()));
        *self.scan_task.lock().await = Some((token, handle));

        *state = next;
        info!("Scanning started ({:?})", next);
        Ok(())
    }

    /// Idempotent; safe to call when scanning never started
    pub async fn stop_scanning(&self) -> MeshResult<()> {
        let mut state = self.shared.state.write().await;
        if !state.is_scanning() {
            debug!("Scanning not active");
            return Ok(());
        }

        self.cancel_scan_loop().await;
        self.shared.radio.stop_scanning().await?;

        *state = state.with_scanning(false)?;
        info!("Scanning stopped ({:?})", *state);
        Ok(())
    }

    async fn cancel_scan_loop(&self) {
        if let Some((token, handle)) = self.scan_task.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Scan loop ended abnormally: {}", e);
            }
        }
    }

    /// Start the peripheral role, publishing the mesh service as `identity`
    pub async fn start_advertising(&self, identity: &LocalIdentity) -> MeshResult<()> {
        let mut state = self.shared.state.write().await;
        let next = state.with_advertising(true)?;
        if state.is_advertising() {
            warn!("Advertising already active");
            return Ok(());
        }

        let wait = self.shared.config.connection_timeout();
        timeout(wait, self.shared.radio.start_advertising(identity))
            .await
            .map_err(|_| MeshError::AdapterError(format!("Start advertising timed out after {:?}", wait)))??;

        *state = next;
        info!("Advertising started as '{}' ({:?})", identity.local_name(), next);
        Ok(())
    }

    /// Idempotent; safe to call when advertising never started
    pub async fn stop_advertising(&self) -> MeshResult<()> {
        let mut state = self.shared.state.write().await;
        if !state.is_advertising() {
            debug!("Advertising not active");
            return Ok(());
        }

        self.shared.radio.stop_advertising().await?;

        *state = state.with_advertising(false)?;
        info!("Advertising stopped ({:?})", *state);
        Ok(())
    }

    pub fn subscribe_discoveries(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.shared.discoveries.subscribe()
    }

    /// Register the single handler for reassembled packets, replacing any previous one
    pub fn set_packet_handler<F>(&self, handler: F)
    where
        F: Fn(Packet, SessionId) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.shared.handler.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    /// Open an outgoing central session; failures are returned, never retried here
    ///
    /// A device with a live session gets that session back without a new connect,
    /// even at the connection limit.
    pub async fn connect(&self, device: &DeviceId) -> MeshResult<SessionId> {
        self.ensure_running("connect").await?;

        if let Some(existing) = self.shared.live_session_for(device) {
            debug!("Reusing existing session {} for {}", existing, device);
            return Ok(existing);
        }

        let _slot = self.shared.reserve_slot().map_err(|e| {
            warn!("Refusing connection to {}: {}", device, e);
            e
        })?;

        let wait = self.shared.config.connection_timeout();
        let peer = match timeout(wait, self.shared.radio.connect(device)).await {
            Ok(Ok(peer)) => peer,
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", device, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Connection to {} timed out after {:?}", device, wait);
                return Err(MeshError::ConnectionTimeout(wait));
            }
        };

        let id = SessionId::central(peer.handle);
        self.shared.dialed.insert(device.clone(), id.clone());
        if self.shared.sessions.contains_key(&id) {
            debug!("Reusing existing session {}", id);
            return Ok(id);
        }

        self.shared
            .sessions
            .insert(id.clone(), TransportSession::new(id.clone(), peer.mtu));
        info!("Session {} established (mtu {})", id, peer.mtu);
        Ok(id)
    }

    /// Explicitly close a session of either role
    pub async fn disconnect(&self, id: &SessionId) -> MeshResult<()> {
        if self.shared.teardown(id, "explicit disconnect").await {
            Ok(())
        } else {
            Err(MeshError::SessionNotFound(id.to_string()))
        }
    }

    /// Encode and write a packet to one session
    pub async fn send(&self, id: &SessionId, packet: &Packet) -> MeshResult<()> {
        self.shared.send(id, packet).await
    }

    /// Send to every session of both roles concurrently
    pub async fn broadcast(&self, packet: &Packet) -> BroadcastReport {
        self.broadcast_except(packet, None).await
    }

    /// Broadcast, skipping `exclude` (usually the session a relayed packet arrived on)
    pub async fn broadcast_except(
        &self,
        packet: &Packet,
        exclude: Option<&SessionId>,
    ) -> BroadcastReport {
        let targets: Vec<SessionId> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| Some(id) != exclude)
            .collect();

        if targets.is_empty() {
            warn!("No sessions available for broadcast");
            return BroadcastReport::default();
        }

        let shared = &self.shared;
        let shares_channel = shared.radio.notifies_all_subscribers();
        let (peripheral, direct): (Vec<_>, Vec<_>) = targets
            .into_iter()
            .partition(|id| shares_channel && id.role == SessionRole::IncomingPeripheral);

        let sends = direct.into_iter().map(|id| async move {
            let result = shared.send(&id, packet).await;
            SendOutcome { session: id, result }
        });
        // one notification sequence reaches every subscribed central
        let notify = async {
            if peripheral.is_empty() {
                return Vec::new();
            }
            let result = shared.send_shared_peripheral(&peripheral, packet).await;
            shared_outcomes(peripheral, result)
        };

        let (mut outcomes, notified) = tokio::join!(join_all(sends), notify);
        outcomes.extend(notified);
        let report = BroadcastReport { outcomes };

        debug!(
            "Broadcast delivered to {}/{} sessions",
            report.delivered(),
            report.outcomes.len()
        );
        report
    }

    /// Run one health-check pass now; returns the sessions torn down
    pub async fn run_health_check(&self) -> Vec<SessionId> {
        self.shared.health_check().await
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    pub fn session_info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.shared.sessions.get(id).map(|session| session.info())
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Stop both roles, close every session and end all background tasks
    ///
    /// Safe to call at any point, including before `initialize`.
    pub async fn shutdown(&self) -> MeshResult<()> {
        let previous = {
            let mut state = self.shared.state.write().await;
            if *state == ManagerState::Uninitialized {
                debug!("Shutdown requested while uninitialized");
                return Ok(());
            }
            std::mem::replace(&mut *state, ManagerState::ShuttingDown)
        };
        info!("Shutting down connection manager (was {:?})", previous);

        self.cancel_scan_loop().await;
        if let Err(e) = self.shared.radio.stop_scanning().await {
            warn!("Failed to stop scanning during shutdown: {}", e);
        }
        if let Err(e) = self.shared.radio.stop_advertising().await {
            warn!("Failed to stop advertising during shutdown: {}", e);
        }

        let ids: Vec<SessionId> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.shared.teardown(&id, "shutdown").await;
        }

        self.shutdown_token().cancel();

        if let Some(health) = self.health_task.lock().await.take() {
            if let Err(e) = health.await {
                warn!("Health-check loop ended abnormally: {}", e);
            }
        }
        if let Some(dispatch) = self.dispatch_task.lock().await.take() {
            match dispatch.await {
                Ok(events) => *self.events.lock().await = Some(events),
                Err(e) => warn!("Dispatch loop ended abnormally: {}", e),
            }
        }

        *self.shared.state.write().await = ManagerState::Uninitialized;
        info!("Connection manager shut down");
        Ok(())
    }
}

impl<R: RadioTransport> Shared<R> {
    async fn send(&self, id: &SessionId, packet: &Packet) -> MeshResult<()> {
        if id.role == SessionRole::IncomingPeripheral && self.radio.notifies_all_subscribers() {
            return self
                .send_shared_peripheral(std::slice::from_ref(id), packet)
                .await;
        }

        let chunks = {
            let session = self
                .sessions
                .get(id)
                .ok_or_else(|| MeshError::SessionNotFound(id.to_string()))?;
            session.encode(packet)?
        };

        let result = self.write_chunks(id, &chunks).await;
        self.record_outcome(id, &result).await;
        result
    }

    /// One transmission through the notify channel every subscribed central shares
    ///
    /// Chunks are sized for the smallest peripheral-role link, since every subscriber
    /// receives them, and whole transmissions never interleave.
    async fn send_shared_peripheral(&self, targets: &[SessionId], packet: &Packet) -> MeshResult<()> {
        let Some(first) = targets.first() else {
            return Ok(());
        };
        let mtu = self
            .sessions
            .iter()
            .filter(|entry| entry.key().role == SessionRole::IncomingPeripheral)
            .map(|entry| entry.value().mtu())
            .min()
            .ok_or_else(|| MeshError::SessionNotFound(first.to_string()))?;
        let chunks = codec::encode(packet, mtu)?;

        let result = {
            let _serial = self.peripheral_write.lock().await;
            self.write_chunks(first, &chunks).await
        };
        for id in targets {
            self.record_outcome(id, &result).await;
        }
        result
    }

    async fn write_chunks(&self, id: &SessionId, chunks: &[Vec<u8>]) -> MeshResult<()> {
        let wait = self.config.write_timeout();
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            let result = match timeout(wait, self.radio.write_chunk(&id.handle, id.role, chunk)).await {
                Ok(result) => result,
                Err(_) => Err(MeshError::WriteTimeout(wait)),
            };

            if let Err(e) = result {
                warn!("Write of chunk {}/{} to {} failed: {}", index + 1, total, id, e);
                return Err(e);
            }
        }
        debug!("Sent {} chunk(s) to {}", total, id);
        Ok(())
    }

    async fn record_outcome(&self, id: &SessionId, result: &MeshResult<()>) {
        match result {
            Ok(()) => {
                if let Some(mut session) = self.sessions.get_mut(id) {
                    session.record_success();
                }
            }
            Err(_) => self.record_failure(id).await,
        }
    }

    /// The live central session already opened for `device`
    fn live_session_for(&self, device: &DeviceId) -> Option<SessionId> {
        let id = self.dialed.get(device).map(|entry| entry.value().clone())?;
        if self.sessions.contains_key(&id) {
            Some(id)
        } else {
            self.dialed.remove(device);
            None
        }
    }

    /// Claim a slot for a new central session, counting connects still in progress
    fn reserve_slot(&self) -> MeshResult<SlotReservation<'_>> {
        let max = self.config.max_connections;
        let mut pending = self
            .pending_connects
            .lock()
            .map_err(|_| MeshError::AdapterError("connection admission lock poisoned".to_string()))?;
        if self.sessions.len() + *pending >= max {
            return Err(MeshError::ConnectionLimit(max));
        }
        *pending += 1;
        Ok(SlotReservation {
            pending: &self.pending_connects,
        })
    }

    /// Room for an unsolicited peripheral-role session
    fn has_free_slot(&self) -> bool {
        let pending = self.pending_connects.lock().map(|p| *p).unwrap_or(0);
        self.sessions.len() + pending < self.config.max_connections
    }

    async fn record_failure(&self, id: &SessionId) {
        let threshold = self.config.failure_threshold;
        let crossed = match self.sessions.get_mut(id) {
            Some(mut session) => session.record_failure(threshold),
            None => false,
        };

        if crossed {
            warn!("Session {} reached {} consecutive failures", id, threshold);
            self.teardown(id, "failure threshold reached").await;
        }
    }

    /// Remove a session from the live table, then clear its reassembly state
    fn drop_session(&self, id: &SessionId, reason: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, mut session)) => {
                session.clear_reassembly();
                info!(
                    "Session {} closed after {:?}: {}",
                    id,
                    session.connected_for(),
                    reason
                );
                true
            }
            None => false,
        }
    }

    /// Drop the session and close the native link
    async fn teardown(&self, id: &SessionId, reason: &str) -> bool {
        if !self.drop_session(id, reason) {
            return false;
        }

        let wait = self.config.connection_timeout();
        match timeout(wait, self.radio.disconnect(&id.handle, id.role)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Native disconnect of {} failed: {}", id, e),
            Err(_) => warn!("Native disconnect of {} timed out after {:?}", id, wait),
        }
        true
    }

    fn handle_inbound(&self, chunk: InboundChunk) {
        let id = SessionId::new(chunk.role, chunk.handle);

        let result = match chunk.role {
            SessionRole::IncomingPeripheral => {
                if !self.sessions.contains_key(&id) && !self.has_free_slot() {
                    warn!("Ignoring write from {}: connection limit reached", id);
                    return;
                }

                let mtu = if chunk.mtu > crate::codec::CHUNK_HEADER_LEN {
                    chunk.mtu
                } else {
                    self.config.default_mtu
                };
                let mut session = self.sessions.entry(id.clone()).or_insert_with(|| {
                    info!("Session {} established on first write (mtu {})", id, mtu);
                    TransportSession::new(id.clone(), mtu)
                });
                session.ingest(&chunk.data)
            }
            SessionRole::OutgoingCentral => match self.sessions.get_mut(&id) {
                Some(mut session) => session.ingest(&chunk.data),
                None => {
                    debug!("Dropping chunk for unknown session {}", id);
                    return;
                }
            },
        };

        match result {
            Ok(Some(packet)) => self.deliver(packet, id),
            Ok(None) => {}
            Err(e) => warn!("Dropping malformed chunk from {}: {}", id, e),
        }
    }

    fn deliver(&self, packet: Packet, from: SessionId) {
        let handler = self
            .handler
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(Arc::clone));

        match handler {
            Some(handler) => handler(packet, from),
            None => debug!("No packet handler registered; dropping packet from {}", from),
        }
    }

    async fn health_check(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let window = self.config.stale_session_timeout();

        let (stale, live): (Vec<_>, Vec<_>) = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().is_stale(now, window)))
            .partition(|(_, is_stale)| *is_stale);

        let mut removed = Vec::new();
        for (id, _) in stale {
            if self.teardown(&id, "idle beyond staleness window").await {
                removed.push(id);
            }
        }

        let wait = self.config.write_timeout();
        for (id, _) in live {
            let alive = timeout(wait, self.radio.is_connected(&id.handle, id.role))
                .await
                .unwrap_or(false);
            if !alive && self.teardown(&id, "radio reports link down").await {
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            info!("Health check removed {} session(s)", removed.len());
        }
        removed
    }
}

/// The same shared-channel result for every peripheral session it covered
fn shared_outcomes(targets: Vec<SessionId>, result: MeshResult<()>) -> Vec<SendOutcome> {
    let failure = result.as_ref().err().map(|e| e.to_string());
    let mut first = Some(result);
    targets
        .into_iter()
        .map(|session| {
            let result = match first.take() {
                Some(result) => result,
                None => match &failure {
                    Some(reason) => Err(MeshError::WriteFailed(reason.clone())),
                    None => Ok(()),
                },
            };
            SendOutcome { session, result }
        })
        .collect()
}

async fn dispatch_loop<R: RadioTransport>(
    shared: Arc<Shared<R>>,
    mut events: RadioEvents,
    cancel: CancellationToken,
) -> RadioEvents {
    debug!("Dispatch loop started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(chunk) = events.inbound.recv() => shared.handle_inbound(chunk),
            Some(id) = events.disconnected.recv() => {
                shared.drop_session(&id, "native disconnect");
            }
            Some(device) = events.discovered.recv() => {
                if shared.discoveries.send(device).is_err() {
                    debug!("No discovery subscribers");
                }
            }
            Ok(()) = events.power.changed() => {
                let power = *events.power.borrow();
                if power != RadioPower::PoweredOn {
                    warn!("Radio power changed to {:?}; sessions will be reclaimed by the health check", power);
                }
            }
            else => break,
        }
    }

    debug!("Dispatch loop stopped");
    events
}

async fn health_loop<R: RadioTransport>(shared: Arc<Shared<R>>, cancel: CancellationToken) {
    let mut ticker = interval(shared.config.health_check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                shared.health_check().await;
            }
        }
    }
}

async fn scan_loop<R: RadioTransport>(shared: Arc<Shared<R>>, cancel: CancellationToken) {
    let mut ticker = interval(shared.config.scan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // restart so stacks that filter duplicate advertisements report peers again
                if let Err(e) = shared.radio.stop_scanning().await {
                    warn!("Scan refresh stop failed: {}", e);
                }
                if let Err(e) = shared.radio.start_scanning().await {
                    warn!("Scan refresh start failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ManagerState::*;

        assert_eq!(Ready.with_scanning(true).unwrap(), Scanning);
        assert_eq!(Scanning.with_advertising(true).unwrap(), ScanningAndAdvertising);
        assert_eq!(ScanningAndAdvertising.with_scanning(false).unwrap(), Advertising);
        assert_eq!(Advertising.with_advertising(false).unwrap(), Ready);
        assert_eq!(ScanningAndAdvertising.with_advertising(false).unwrap(), Scanning);
    }

    #[test]
    fn test_starting_roles_requires_initialization() {
        use ManagerState::*;

        assert!(matches!(
            Uninitialized.with_scanning(true),
            Err(MeshError::InvalidState { operation: "start scanning", .. })
        ));
        assert!(ShuttingDown.with_advertising(true).is_err());

        // stopping is always allowed
        assert_eq!(Uninitialized.with_scanning(false).unwrap(), Uninitialized);
        assert_eq!(ShuttingDown.with_advertising(false).unwrap(), ShuttingDown);
    }

    #[test]
    fn test_idempotent_transitions() {
        use ManagerState::*;

        assert_eq!(Scanning.with_scanning(true).unwrap(), Scanning);
        assert_eq!(Ready.with_scanning(false).unwrap(), Ready);
        assert_eq!(Advertising.with_advertising(true).unwrap(), Advertising);
    }

    #[test]
    fn test_broadcast_report_counts() {
        let ok = SendOutcome {
            session: SessionId::central(crate::session::PeerHandle::new("a")),
            result: Ok(()),
        };
        let failed = SendOutcome {
            session: SessionId::peripheral(crate::session::PeerHandle::new("b")),
            result: Err(MeshError::WriteFailed("gone".to_string())),
        };
        let report = BroadcastReport {
            outcomes: vec![ok, failed],
        };

        assert_eq!(report.delivered(), 1);
        assert_eq!(report.failures().count(), 1);
        assert!(!report.is_empty());
    }
}
