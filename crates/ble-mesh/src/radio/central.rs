//! Central role over btleplug: scan, connect, write, receive notifications

use super::{ConnectedPeer, DeviceId, DiscoveredDevice, EventSink, InboundChunk, RadioPower};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    usable_link_mtu, LINK_MTU_CHARACTERISTIC_UUID, MESH_SERVICE_UUID, NOTIFY_CHARACTERISTIC_UUID,
    WRITE_CHARACTERISTIC_UUID,
};
use crate::session::{PeerHandle, SessionId, SessionRole};
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A connected peripheral and the task draining its notifications
struct CentralLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    mtu: usize,
    notifications: JoinHandle<()>,
}

/// Cross-platform central role using btleplug
pub struct BtleplugCentral {
    adapter: Adapter,
    sink: EventSink,
    default_mtu: usize,

    /// Devices seen while scanning, so `connect` can resolve them
    discovered: Arc<DashMap<DeviceId, PeripheralId>>,

    /// Connected peripherals keyed by session handle
    links: Arc<DashMap<PeerHandle, CentralLink>>,

    scanning: Arc<RwLock<bool>>,
    event_pump: JoinHandle<()>,
}

fn handle_for(id: &PeripheralId) -> PeerHandle {
    PeerHandle::new(format!("{:?}", id))
}

fn device_for(id: &PeripheralId) -> DeviceId {
    DeviceId::new(format!("{:?}", id))
}

fn power_from(state: CentralState) -> RadioPower {
    match state {
        CentralState::PoweredOn => RadioPower::PoweredOn,
        CentralState::PoweredOff => RadioPower::PoweredOff,
        _ => RadioPower::Unknown,
    }
}

impl BtleplugCentral {
    /// Open the first adapter and start forwarding its events into `sink`
    pub async fn new(sink: EventSink, default_mtu: usize) -> MeshResult<Self> {
        debug!("Creating BLE manager and adapter");

        let manager = Manager::new()
            .await
            .map_err(|e| MeshError::RadioUnavailable(format!("Failed to create BLE manager: {}", e)))?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| MeshError::RadioUnavailable(format!("Failed to get adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| MeshError::RadioUnavailable("No BLE adapter found".to_string()))?;

        info!("BLE adapter initialized: {:?}", adapter.adapter_info().await);

        match adapter.adapter_state().await {
            Ok(state) => sink.set_power(power_from(state)),
            Err(e) => warn!("Could not read adapter state: {}", e),
        }

        let events = adapter
            .events()
            .await
            .map_err(|e| MeshError::RadioUnavailable(format!("Failed to subscribe to adapter events: {}", e)))?;

        let discovered = Arc::new(DashMap::new());
        let links = Arc::new(DashMap::new());
        let scanning = Arc::new(RwLock::new(false));

        let event_pump = tokio::spawn(pump_events(
            events,
            adapter.clone(),
            sink.clone(),
            Arc::clone(&discovered),
            Arc::clone(&links),
            Arc::clone(&scanning),
        ));

        Ok(Self {
            adapter,
            sink,
            default_mtu,
            discovered,
            links,
            scanning,
            event_pump,
        })
    }

    pub async fn start_scanning(&self) -> MeshResult<()> {
        let mut scanning = self.scanning.write().await;
        if *scanning {
            warn!("BLE scanning already active");
            return Ok(());
        }

        self.adapter
            .start_scan(ScanFilter {
                services: vec![MESH_SERVICE_UUID],
            })
            .await
            .map_err(|e| MeshError::AdapterError(format!("Failed to start scanning: {}", e)))?;

        *scanning = true;
        info!("BLE scanning started");
        Ok(())
    }

    pub async fn stop_scanning(&self) -> MeshResult<()> {
        let mut scanning = self.scanning.write().await;
        if !*scanning {
            debug!("BLE scanning not active");
            return Ok(());
        }

        self.adapter
            .stop_scan()
            .await
            .map_err(|e| MeshError::AdapterError(format!("Failed to stop scanning: {}", e)))?;

        *scanning = false;
        info!("BLE scanning stopped");
        Ok(())
    }

    pub async fn connect(&self, device: &DeviceId) -> MeshResult<ConnectedPeer> {
        info!("Connecting to device: {}", device);

        let peripheral_id = self
            .discovered
            .get(device)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::DeviceNotFound(device.to_string()))?;

        let peripheral = self
            .adapter
            .peripheral(&peripheral_id)
            .await
            .map_err(|e| MeshError::DeviceNotFound(format!("{}: {}", device, e)))?;

        let handle = handle_for(&peripheral_id);

        match self.open_link(&peripheral, handle.clone()).await {
            Ok(link) => {
                let mtu = link.mtu;
                if let Some(previous) = self.links.insert(handle.clone(), link) {
                    previous.notifications.abort();
                }
                info!("Connected to {} as {} (mtu {})", device, handle, mtu);
                Ok(ConnectedPeer { handle, mtu })
            }
            Err(e) => {
                // leave no half-open link behind
                if let Err(disconnect_err) = peripheral.disconnect().await {
                    debug!("Cleanup disconnect of {} failed: {}", device, disconnect_err);
                }
                Err(e)
            }
        }
    }

    async fn open_link(&self, peripheral: &Peripheral, handle: PeerHandle) -> MeshResult<CentralLink> {
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral
                .connect()
                .await
                .map_err(|e| MeshError::ConnectionFailed(format!("Connect failed: {}", e)))?;
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("Service discovery failed: {}", e)))?;

        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == WRITE_CHARACTERISTIC_UUID)
            .cloned()
            .ok_or_else(|| MeshError::ConnectionFailed("Mesh write characteristic not found".to_string()))?;
        let notify_char = characteristics
            .iter()
            .find(|c| c.uuid == NOTIFY_CHARACTERISTIC_UUID)
            .cloned()
            .ok_or_else(|| MeshError::ConnectionFailed("Mesh notify characteristic not found".to_string()))?;

        let mtu = self
            .read_link_mtu(
                peripheral,
                characteristics
                    .iter()
                    .find(|c| c.uuid == LINK_MTU_CHARACTERISTIC_UUID),
            )
            .await;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("Subscribe failed: {}", e)))?;

        let mut stream = peripheral
            .notifications()
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("Notification stream failed: {}", e)))?;

        let sink = self.sink.clone();
        let notifications = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != NOTIFY_CHARACTERISTIC_UUID {
                    continue;
                }
                let chunk = InboundChunk {
                    handle: handle.clone(),
                    role: SessionRole::OutgoingCentral,
                    data: notification.value,
                    mtu,
                };
                if !sink.inbound(chunk).await {
                    break;
                }
            }
            debug!("Notification stream for {} ended", handle);
        });

        Ok(CentralLink {
            peripheral: peripheral.clone(),
            write_char,
            mtu,
            notifications,
        })
    }

    /// Chunk size the peer reports for this link, or the configured default
    async fn read_link_mtu(&self, peripheral: &Peripheral, characteristic: Option<&Characteristic>) -> usize {
        let Some(characteristic) = characteristic else {
            debug!("Peer has no link MTU characteristic; using {}", self.default_mtu);
            return self.default_mtu;
        };

        match peripheral.read(characteristic).await {
            Ok(value) => usable_link_mtu(&value).unwrap_or_else(|| {
                warn!("Unusable link MTU value {:?}; using {}", value, self.default_mtu);
                self.default_mtu
            }),
            Err(e) => {
                warn!("Reading link MTU failed: {}; using {}", e, self.default_mtu);
                self.default_mtu
            }
        }
    }

    pub async fn disconnect(&self, handle: &PeerHandle) -> MeshResult<()> {
        let Some((_, link)) = self.links.remove(handle) else {
            debug!("No central link for {}", handle);
            return Ok(());
        };

        link.notifications.abort();
        link.peripheral
            .disconnect()
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("Disconnect failed: {}", e)))?;

        info!("Disconnected from {}", handle);
        Ok(())
    }

    pub async fn write_chunk(&self, handle: &PeerHandle, chunk: &[u8]) -> MeshResult<()> {
        let (peripheral, write_char) = self
            .links
            .get(handle)
            .map(|link| (link.peripheral.clone(), link.write_char.clone()))
            .ok_or_else(|| MeshError::SessionNotFound(handle.to_string()))?;

        peripheral
            .write(&write_char, chunk, WriteType::WithoutResponse)
            .await
            .map_err(|e| MeshError::WriteFailed(format!("{}: {}", handle, e)))
    }

    pub async fn is_connected(&self, handle: &PeerHandle) -> bool {
        let Some(peripheral) = self.links.get(handle).map(|link| link.peripheral.clone()) else {
            return false;
        };
        peripheral.is_connected().await.unwrap_or(false)
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.event_pump.abort();
        for link in self.links.iter() {
            link.notifications.abort();
        }
    }
}

async fn pump_events(
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    adapter: Adapter,
    sink: EventSink,
    discovered: Arc<DashMap<DeviceId, PeripheralId>>,
    links: Arc<DashMap<PeerHandle, CentralLink>>,
    scanning: Arc<RwLock<bool>>,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) => {
                if !*scanning.read().await {
                    continue;
                }

                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let properties = peripheral.properties().await.ok().flatten();

                let (local_name, rssi, advertises_mesh) = match &properties {
                    Some(props) => (
                        props.local_name.clone(),
                        props.rssi,
                        props.services.is_empty() || props.services.contains(&MESH_SERVICE_UUID),
                    ),
                    None => (None, None, true),
                };
                if !advertises_mesh {
                    continue;
                }

                let device_id = device_for(&id);
                discovered.insert(device_id.clone(), id);
                debug!("Discovered mesh device {} ({:?})", device_id, local_name);

                sink.discovered(DiscoveredDevice {
                    device_id,
                    local_name,
                    rssi,
                })
                .await;
            }
            CentralEvent::DeviceDisconnected(id) => {
                let handle = handle_for(&id);
                if let Some((_, link)) = links.remove(&handle) {
                    link.notifications.abort();
                    info!("Peripheral {} disconnected", handle);
                    sink.disconnected(SessionId::central(handle)).await;
                }
            }
            CentralEvent::StateUpdate(state) => {
                info!("BLE adapter state changed: {:?}", state);
                sink.set_power(power_from(state));
            }
            _ => {}
        }
    }

    warn!("BLE adapter event stream ended");
}
