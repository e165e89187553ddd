//! Peripheral role: GATT server with write, notify and peer-info characteristics
//!
//! btleplug has no peripheral support, so Linux serves the mesh service through
//! BlueZ via bluer. Other targets report `MeshError::PeripheralUnsupported`.

#[cfg(target_os = "linux")]
pub use bluez::BluezPeripheral as PlatformPeripheral;

#[cfg(not(target_os = "linux"))]
pub use unsupported::UnsupportedPeripheral as PlatformPeripheral;

pub use crate::protocol::ATT_HEADER_LEN;

#[cfg(target_os = "linux")]
mod bluez {
    use super::ATT_HEADER_LEN;
    use crate::error::{MeshError, MeshResult};
    use crate::protocol::{
        link_mtu_bytes, LINK_MTU_CHARACTERISTIC_UUID, MESH_SERVICE_UUID,
        NOTIFY_CHARACTERISTIC_UUID, PEER_INFO_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID,
    };
    use crate::radio::{EventSink, InboundChunk, LocalIdentity, RadioPower};
    use crate::session::{PeerHandle, SessionRole};
    use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
    use bluer::gatt::local::{
        Application, ApplicationHandle, Characteristic, CharacteristicNotifier,
        CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
        CharacteristicWriteMethod, ReqError, Service,
    };
    use bluer::Address;
    use futures::FutureExt;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tracing::{debug, info, warn};

    /// Registered GATT application and advertisement; dropping them unpublishes both
    struct Published {
        _application: ApplicationHandle,
        _advertisement: AdvertisementHandle,
    }

    pub struct BluezPeripheral {
        _session: bluer::Session,
        adapter: bluer::Adapter,
        sink: EventSink,
        published: Mutex<Option<Published>>,
        /// BlueZ hands us one notifier per subscription of the notify characteristic
        notifier: Arc<Mutex<Option<CharacteristicNotifier>>>,
    }

    impl BluezPeripheral {
        /// A BlueZ notifier is per characteristic, not per subscribed device
        pub const NOTIFIES_ALL_SUBSCRIBERS: bool = true;

        pub async fn new(sink: EventSink) -> MeshResult<Self> {
            let session = bluer::Session::new()
                .await
                .map_err(|e| MeshError::RadioUnavailable(format!("BlueZ session: {}", e)))?;

            let adapter = session
                .default_adapter()
                .await
                .map_err(|e| MeshError::RadioUnavailable(format!("BLE adapter: {}", e)))?;

            if !adapter.is_powered().await.unwrap_or(false) {
                if let Err(e) = adapter.set_powered(true).await {
                    warn!("Failed to power on adapter {}: {}", adapter.name(), e);
                }
            }

            if adapter.is_powered().await.unwrap_or(false) {
                sink.set_power(RadioPower::PoweredOn);
            }

            info!("Linux BLE adapter {} initialized for peripheral role", adapter.name());

            Ok(Self {
                _session: session,
                adapter,
                sink,
                published: Mutex::new(None),
                notifier: Arc::new(Mutex::new(None)),
            })
        }

        pub async fn start_advertising(&self, identity: &LocalIdentity) -> MeshResult<()> {
            let mut published = self.published.lock().await;
            if published.is_some() {
                warn!("BLE advertising already active");
                return Ok(());
            }

            let application = self.application(identity)?;
            let application_handle = self
                .adapter
                .serve_gatt_application(application)
                .await
                .map_err(|e| MeshError::AdapterError(format!("Failed to register GATT service: {}", e)))?;

            let advertisement = Advertisement {
                advertisement_type: AdvertisementType::Peripheral,
                service_uuids: vec![MESH_SERVICE_UUID].into_iter().collect(),
                local_name: Some(identity.local_name().to_string()),
                discoverable: Some(true),
                ..Default::default()
            };

            let advertisement_handle = self
                .adapter
                .advertise(advertisement)
                .await
                .map_err(|e| MeshError::AdapterError(format!("Failed to start advertising: {}", e)))?;

            *published = Some(Published {
                _application: application_handle,
                _advertisement: advertisement_handle,
            });

            info!("Started BLE advertising as '{}'", identity.local_name());
            Ok(())
        }

        fn application(&self, identity: &LocalIdentity) -> MeshResult<Application> {
            let peer_info = identity.peer_info.to_bytes()?;
            let sink = self.sink.clone();
            let notifier_slot = Arc::clone(&self.notifier);

            let write = Characteristic {
                uuid: WRITE_CHARACTERISTIC_UUID,
                write: Some(CharacteristicWrite {
                    write: true,
                    write_without_response: true,
                    method: CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                        let sink = sink.clone();
                        async move {
                            let chunk = InboundChunk {
                                handle: PeerHandle::new(request.device_address.to_string()),
                                role: SessionRole::IncomingPeripheral,
                                data: value,
                                mtu: usize::from(request.mtu).saturating_sub(ATT_HEADER_LEN),
                            };
                            if sink.inbound(chunk).await {
                                Ok(())
                            } else {
                                Err(ReqError::Failed)
                            }
                        }
                        .boxed()
                    })),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let notify = Characteristic {
                uuid: NOTIFY_CHARACTERISTIC_UUID,
                notify: Some(CharacteristicNotify {
                    notify: true,
                    method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                        let slot = Arc::clone(&notifier_slot);
                        async move {
                            debug!("Central subscribed to mesh notifications");
                            *slot.lock().await = Some(notifier);
                        }
                        .boxed()
                    })),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let info = Characteristic {
                uuid: PEER_INFO_CHARACTERISTIC_UUID,
                read: Some(CharacteristicRead {
                    read: true,
                    fun: Box::new(move |_request| {
                        let value = peer_info.clone();
                        async move { Ok(value) }.boxed()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            };

            // centrals cannot query the negotiated MTU through btleplug, so we report it
            let link_mtu = Characteristic {
                uuid: LINK_MTU_CHARACTERISTIC_UUID,
                read: Some(CharacteristicRead {
                    read: true,
                    fun: Box::new(move |request| {
                        async move { Ok(link_mtu_bytes(request.mtu).to_vec()) }.boxed()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            };

            Ok(Application {
                services: vec![Service {
                    uuid: MESH_SERVICE_UUID,
                    primary: true,
                    characteristics: vec![write, notify, info, link_mtu],
                    ..Default::default()
                }],
                ..Default::default()
            })
        }

        pub async fn stop_advertising(&self) -> MeshResult<()> {
            let previous = self.published.lock().await.take();
            self.notifier.lock().await.take();

            if previous.is_some() {
                info!("Stopped BLE advertising");
            } else {
                debug!("BLE advertising not active");
            }
            Ok(())
        }

        /// Push a chunk to subscribed centrals
        ///
        /// BlueZ delivers a notification to every subscriber of the characteristic;
        /// `handle` only names the session in errors. The connection manager sends
        /// one sequence for all peripheral sessions accordingly.
        pub async fn notify_chunk(&self, handle: &PeerHandle, chunk: &[u8]) -> MeshResult<()> {
            let mut slot = self.notifier.lock().await;
            let notifier = slot
                .as_mut()
                .ok_or_else(|| MeshError::WriteFailed(format!("{}: no subscribed central", handle)))?;

            if notifier.is_stopped() {
                *slot = None;
                return Err(MeshError::WriteFailed(format!("{}: notification session stopped", handle)));
            }

            notifier
                .notify(chunk.to_vec())
                .await
                .map_err(|e| MeshError::WriteFailed(format!("{}: {}", handle, e)))
        }

        pub async fn is_connected(&self, handle: &PeerHandle) -> bool {
            let Ok(address) = handle.as_str().parse::<Address>() else {
                return false;
            };
            match self.adapter.device(address) {
                Ok(device) => device.is_connected().await.unwrap_or(false),
                Err(_) => false,
            }
        }

        pub async fn disconnect(&self, handle: &PeerHandle) -> MeshResult<()> {
            let Ok(address) = handle.as_str().parse::<Address>() else {
                debug!("Ignoring disconnect for unparseable handle {}", handle);
                return Ok(());
            };

            let device = self.adapter.device(address)?;
            if device.is_connected().await.unwrap_or(false) {
                device.disconnect().await?;
                info!("Disconnected central {}", handle);
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use crate::error::{MeshError, MeshResult};
    use crate::radio::{EventSink, LocalIdentity};
    use crate::session::PeerHandle;
    use tracing::warn;

    pub struct UnsupportedPeripheral;

    impl UnsupportedPeripheral {
        pub const NOTIFIES_ALL_SUBSCRIBERS: bool = false;

        pub async fn new(_sink: EventSink) -> MeshResult<Self> {
            warn!("Peripheral role unavailable on this platform; running central-only");
            Ok(Self)
        }

        pub async fn start_advertising(&self, _identity: &LocalIdentity) -> MeshResult<()> {
            Err(MeshError::PeripheralUnsupported)
        }

        pub async fn stop_advertising(&self) -> MeshResult<()> {
            Ok(())
        }

        pub async fn notify_chunk(&self, _handle: &PeerHandle, _chunk: &[u8]) -> MeshResult<()> {
            Err(MeshError::PeripheralUnsupported)
        }

        pub async fn is_connected(&self, _handle: &PeerHandle) -> bool {
            false
        }

        pub async fn disconnect(&self, _handle: &PeerHandle) -> MeshResult<()> {
            Ok(())
        }
    }
}
