//! In-memory radio used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ble_mesh::radio::{event_channels, ConnectedPeer, EventSink, InboundChunk};
use ble_mesh::{
    DeviceId, LocalIdentity, MeshError, MeshResult, PeerHandle, RadioEvents, RadioPower,
    RadioTransport, SessionId, SessionRole,
};
use shared::MeshNetworkConfig;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Mock radio recording every write and disconnect
pub struct MockRadio {
    sink: EventSink,
    events: Mutex<Option<RadioEvents>>,
    mtu: usize,
    devices: Mutex<HashMap<DeviceId, PeerHandle>>,
    links: Mutex<HashSet<(PeerHandle, SessionRole)>>,
    failing: Mutex<HashSet<PeerHandle>>,
    stalled: Mutex<HashSet<PeerHandle>>,
    writes: Mutex<Vec<(PeerHandle, SessionRole, Vec<u8>)>>,
    write_times: Mutex<HashMap<PeerHandle, Instant>>,
    disconnects: Mutex<Vec<(PeerHandle, SessionRole)>>,
    connect_delay: Mutex<Option<Duration>>,
    pub scanning: AtomicBool,
    pub advertising: AtomicBool,
    /// Peripheral-role writes reach every subscribed central, as with BlueZ
    pub shared_notify: AtomicBool,
}

impl MockRadio {
    /// A powered-on radio
    pub fn new(mtu: usize) -> Self {
        let radio = Self::unpowered(mtu);
        radio.sink.set_power(RadioPower::PoweredOn);
        radio
    }

    pub fn unpowered(mtu: usize) -> Self {
        let (sink, events) = event_channels(64);
        Self {
            sink,
            events: Mutex::new(Some(events)),
            mtu,
            devices: Mutex::new(HashMap::new()),
            links: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            stalled: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
            write_times: Mutex::new(HashMap::new()),
            disconnects: Mutex::new(Vec::new()),
            connect_delay: Mutex::new(None),
            scanning: AtomicBool::new(false),
            advertising: AtomicBool::new(false),
            shared_notify: AtomicBool::new(false),
        }
    }

    pub fn set_power(&self, power: RadioPower) {
        self.sink.set_power(power);
    }

    /// Make a device connectable; its session handle equals its name
    pub fn add_device(&self, name: &str) -> DeviceId {
        let device = DeviceId::new(name);
        self.devices
            .lock()
            .unwrap()
            .insert(device.clone(), PeerHandle::new(name));
        device
    }

    /// Every write to `handle` fails from now on
    pub fn fail_writes(&self, handle: &PeerHandle) {
        self.failing.lock().unwrap().insert(handle.clone());
    }

    pub fn restore_writes(&self, handle: &PeerHandle) {
        self.failing.lock().unwrap().remove(handle);
    }

    /// Writes to `handle` never complete
    pub fn stall_writes(&self, handle: &PeerHandle) {
        self.stalled.lock().unwrap().insert(handle.clone());
    }

    /// Every connect takes `delay` before the link is up
    pub fn slow_connects(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// When the last chunk to `handle` was written
    pub fn last_write_at(&self, handle: &PeerHandle) -> Option<Instant> {
        self.write_times.lock().unwrap().get(handle).copied()
    }

    /// Pretend a central connected to our GATT server
    pub fn accept_central(&self, name: &str) -> PeerHandle {
        let handle = PeerHandle::new(name);
        self.links
            .lock()
            .unwrap()
            .insert((handle.clone(), SessionRole::IncomingPeripheral));
        handle
    }

    /// The link silently goes away; only `is_connected` notices
    pub fn drop_link(&self, handle: &PeerHandle, role: SessionRole) {
        self.links.lock().unwrap().remove(&(handle.clone(), role));
    }

    /// The native stack reports a disconnect
    pub async fn report_disconnect(&self, id: SessionId) {
        self.links
            .lock()
            .unwrap()
            .remove(&(id.handle.clone(), id.role));
        self.sink.disconnected(id).await;
    }

    pub async fn inject(&self, handle: &PeerHandle, role: SessionRole, data: Vec<u8>) {
        self.inject_with_mtu(handle, role, data, self.mtu).await;
    }

    /// A chunk arriving over a link with its own negotiated MTU
    pub async fn inject_with_mtu(
        &self,
        handle: &PeerHandle,
        role: SessionRole,
        data: Vec<u8>,
        mtu: usize,
    ) {
        let delivered = self
            .sink
            .inbound(InboundChunk {
                handle: handle.clone(),
                role,
                data,
                mtu,
            })
            .await;
        assert!(delivered, "dispatch loop not consuming chunks");
    }

    pub fn writes_to(&self, handle: &PeerHandle) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _, _)| h == handle)
            .map(|(_, _, data)| data.clone())
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn disconnected(&self, handle: &PeerHandle) -> bool {
        self.disconnects
            .lock()
            .unwrap()
            .iter()
            .any(|(h, _)| h == handle)
    }
}

#[async_trait]
impl RadioTransport for MockRadio {
    async fn start_scanning(&self) -> MeshResult<()> {
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scanning(&self) -> MeshResult<()> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn start_advertising(&self, _identity: &LocalIdentity) -> MeshResult<()> {
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_advertising(&self) -> MeshResult<()> {
        self.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> MeshResult<ConnectedPeer> {
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handle = self
            .devices
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .ok_or_else(|| MeshError::DeviceNotFound(device.to_string()))?;

        self.links
            .lock()
            .unwrap()
            .insert((handle.clone(), SessionRole::OutgoingCentral));

        Ok(ConnectedPeer {
            handle,
            mtu: self.mtu,
        })
    }

    async fn disconnect(&self, handle: &PeerHandle, role: SessionRole) -> MeshResult<()> {
        self.links.lock().unwrap().remove(&(handle.clone(), role));
        self.disconnects.lock().unwrap().push((handle.clone(), role));
        Ok(())
    }

    async fn write_chunk(
        &self,
        handle: &PeerHandle,
        role: SessionRole,
        chunk: &[u8],
    ) -> MeshResult<()> {
        if self.failing.lock().unwrap().contains(handle) {
            return Err(MeshError::WriteFailed(format!("{}: link lost", handle)));
        }
        let stalled = self.stalled.lock().unwrap().contains(handle);
        if stalled {
            std::future::pending::<()>().await;
        }
        self.writes
            .lock()
            .unwrap()
            .push((handle.clone(), role, chunk.to_vec()));
        self.write_times
            .lock()
            .unwrap()
            .insert(handle.clone(), Instant::now());
        Ok(())
    }

    async fn is_connected(&self, handle: &PeerHandle, role: SessionRole) -> bool {
        self.links.lock().unwrap().contains(&(handle.clone(), role))
    }

    fn take_events(&self) -> Option<RadioEvents> {
        self.events.lock().unwrap().take()
    }

    fn notifies_all_subscribers(&self) -> bool {
        self.shared_notify.load(Ordering::SeqCst)
    }
}

/// Short timeouts so paused-clock tests finish quickly
pub fn test_config() -> MeshNetworkConfig {
    MeshNetworkConfig {
        scan_interval_ms: 1_000,
        connection_timeout_ms: 1_000,
        write_timeout_ms: 500,
        health_check_interval_ms: 60_000,
        stale_session_timeout_ms: 30_000,
        max_connections: 4,
        failure_threshold: 2,
        default_mtu: 64,
        power_on_timeout_ms: 2_000,
        packet_ttl: 7,
        device_name: "test-node".to_string(),
    }
}
