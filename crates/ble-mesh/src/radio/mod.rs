//! Radio capability abstraction for cross-platform support
//!
//! Native BLE callbacks are turned into one channel per event category; the
//! connection manager consumes them from a single dispatch loop.

pub mod central;
pub mod peripheral;

use crate::error::MeshResult;
use crate::protocol::PeerInfo;
use crate::session::{PeerHandle, SessionId, SessionRole};
use async_trait::async_trait;
use shared::MeshNetworkConfig;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub use central::BtleplugCentral;
pub use peripheral::PlatformPeripheral;

/// Buffer size of each radio event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Identifier of a device seen while scanning, used to connect to it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub device_id: DeviceId,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

/// Result of a successful central connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub handle: PeerHandle,
    pub mtu: usize,
}

/// Raw bytes written to us by a peer, in either role
#[derive(Debug, Clone)]
pub struct InboundChunk {
    pub handle: PeerHandle,
    pub role: SessionRole,
    pub data: Vec<u8>,
    /// Usable write size reported by the stack for this link
    pub mtu: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioPower {
    Unknown,
    PoweredOn,
    PoweredOff,
}

/// What we advertise in the peripheral role
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub peer_info: PeerInfo,
}

impl LocalIdentity {
    pub fn new(peer_info: PeerInfo) -> Self {
        Self { peer_info }
    }

    pub fn local_name(&self) -> &str {
        &self.peer_info.display_name
    }
}

/// Receiving side of the radio's event channels
#[derive(Debug)]
pub struct RadioEvents {
    pub discovered: mpsc::Receiver<DiscoveredDevice>,
    pub inbound: mpsc::Receiver<InboundChunk>,
    pub disconnected: mpsc::Receiver<SessionId>,
    pub power: watch::Receiver<RadioPower>,
}

/// Sending side of the radio's event channels, cloned into every native callback
#[derive(Debug, Clone)]
pub struct EventSink {
    discovered: mpsc::Sender<DiscoveredDevice>,
    inbound: mpsc::Sender<InboundChunk>,
    disconnected: mpsc::Sender<SessionId>,
    power: Arc<watch::Sender<RadioPower>>,
}

/// Create a connected sink/receiver pair
pub fn event_channels(capacity: usize) -> (EventSink, RadioEvents) {
    let (discovered_tx, discovered_rx) = mpsc::channel(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (disconnected_tx, disconnected_rx) = mpsc::channel(capacity);
    let (power_tx, power_rx) = watch::channel(RadioPower::Unknown);

    (
        EventSink {
            discovered: discovered_tx,
            inbound: inbound_tx,
            disconnected: disconnected_tx,
            power: Arc::new(power_tx),
        },
        RadioEvents {
            discovered: discovered_rx,
            inbound: inbound_rx,
            disconnected: disconnected_rx,
            power: power_rx,
        },
    )
}

impl EventSink {
    pub async fn discovered(&self, device: DiscoveredDevice) {
        if self.discovered.send(device).await.is_err() {
            debug!("Discovery receiver dropped");
        }
    }

    pub async fn inbound(&self, chunk: InboundChunk) -> bool {
        self.inbound.send(chunk).await.is_ok()
    }

    pub async fn disconnected(&self, session: SessionId) {
        if self.disconnected.send(session).await.is_err() {
            debug!("Disconnect receiver dropped");
        }
    }

    pub fn set_power(&self, power: RadioPower) {
        self.power.send_replace(power);
    }
}

/// Platform-agnostic BLE capability
///
/// Implementations do not apply timeouts themselves; the connection manager bounds
/// every call.
#[async_trait]
pub trait RadioTransport: Send + Sync + 'static {
    /// Start scanning for peers advertising the mesh service
    async fn start_scanning(&self) -> MeshResult<()>;

    /// Stop scanning; a no-op if not scanning
    async fn stop_scanning(&self) -> MeshResult<()>;

    /// Publish the mesh GATT service and advertise it
    async fn start_advertising(&self, identity: &LocalIdentity) -> MeshResult<()>;

    /// Withdraw the advertisement and GATT service; a no-op if not advertising
    async fn stop_advertising(&self) -> MeshResult<()>;

    /// Connect, discover the mesh characteristics and subscribe to notifications
    async fn connect(&self, device: &DeviceId) -> MeshResult<ConnectedPeer>;

    async fn disconnect(&self, handle: &PeerHandle, role: SessionRole) -> MeshResult<()>;

    /// Write one chunk to the peer over the channel matching `role`
    async fn write_chunk(&self, handle: &PeerHandle, role: SessionRole, chunk: &[u8])
        -> MeshResult<()>;

    async fn is_connected(&self, handle: &PeerHandle, role: SessionRole) -> bool;

    /// Hand over the event receivers; only the first call returns them
    fn take_events(&self) -> Option<RadioEvents>;

    /// Whether a peripheral-role write reaches every subscribed central, not only `handle`
    fn notifies_all_subscribers(&self) -> bool {
        false
    }
}

/// Central role via btleplug plus the platform's peripheral role
pub struct PlatformRadio {
    central: BtleplugCentral,
    peripheral: PlatformPeripheral,
    events: Mutex<Option<RadioEvents>>,
}

impl PlatformRadio {
    /// Probe the host for a usable adapter
    ///
    /// Fails with `MeshError::RadioUnavailable` when there is no adapter at all; a
    /// present but powered-off adapter is reported through the power channel instead.
    pub async fn detect(config: &MeshNetworkConfig) -> MeshResult<Self> {
        info!("Detecting BLE radio");

        let (sink, events) = event_channels(EVENT_CHANNEL_CAPACITY);
        let central = BtleplugCentral::new(sink.clone(), config.default_mtu).await?;
        let peripheral = PlatformPeripheral::new(sink).await?;

        Ok(Self {
            central,
            peripheral,
            events: Mutex::new(Some(events)),
        })
    }
}

#[async_trait]
impl RadioTransport for PlatformRadio {
    async fn start_scanning(&self) -> MeshResult<()> {
        self.central.start_scanning().await
    }

    async fn stop_scanning(&self) -> MeshResult<()> {
        self.central.stop_scanning().await
    }

    async fn start_advertising(&self, identity: &LocalIdentity) -> MeshResult<()> {
        self.peripheral.start_advertising(identity).await
    }

    async fn stop_advertising(&self) -> MeshResult<()> {
        self.peripheral.stop_advertising().await
    }

    async fn connect(&self, device: &DeviceId) -> MeshResult<ConnectedPeer> {
        self.central.connect(device).await
    }

    async fn disconnect(&self, handle: &PeerHandle, role: SessionRole) -> MeshResult<()> {
        match role {
            SessionRole::OutgoingCentral => self.central.disconnect(handle).await,
            SessionRole::IncomingPeripheral => self.peripheral.disconnect(handle).await,
        }
    }

    async fn write_chunk(
        &self,
        handle: &PeerHandle,
        role: SessionRole,
        chunk: &[u8],
    ) -> MeshResult<()> {
        match role {
            SessionRole::OutgoingCentral => self.central.write_chunk(handle, chunk).await,
            SessionRole::IncomingPeripheral => self.peripheral.notify_chunk(handle, chunk).await,
        }
    }

    async fn is_connected(&self, handle: &PeerHandle, role: SessionRole) -> bool {
        match role {
            SessionRole::OutgoingCentral => self.central.is_connected(handle).await,
            SessionRole::IncomingPeripheral => self.peripheral.is_connected(handle).await,
        }
    }

    fn take_events(&self) -> Option<RadioEvents> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    fn notifies_all_subscribers(&self) -> bool {
        PlatformPeripheral::NOTIFIES_ALL_SUBSCRIBERS
    }
}
