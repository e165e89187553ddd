//! In-memory radio and ledger for relay node tests

#![allow(dead_code)]

use async_trait::async_trait;
use ble_mesh::radio::{event_channels, ConnectedPeer, EventSink, InboundChunk};
use ble_mesh::{
    DeviceId, DiscoveredDevice, LocalIdentity, MeshError, MeshResult, PeerHandle, RadioEvents,
    RadioPower, RadioTransport, SessionRole,
};
use offline_tx::{is_durable_message, LedgerError, NonceAccount, NonceError, NonceLedger};
use shared::{Config, MeshNetworkConfig};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub const MTU: usize = 128;

/// Radio whose peers are named devices; a session handle equals the device name
pub struct MockRadio {
    sink: EventSink,
    events: Mutex<Option<RadioEvents>>,
    devices: Mutex<HashSet<DeviceId>>,
    links: Mutex<HashSet<(PeerHandle, SessionRole)>>,
    writes: Mutex<Vec<(PeerHandle, Vec<u8>)>>,
}

impl MockRadio {
    pub fn new() -> Self {
        let (sink, events) = event_channels(64);
        sink.set_power(RadioPower::PoweredOn);
        Self {
            sink,
            events: Mutex::new(Some(events)),
            devices: Mutex::new(HashSet::new()),
            links: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn add_device(&self, name: &str) -> DeviceId {
        let device = DeviceId::new(name);
        self.devices.lock().unwrap().insert(device.clone());
        device
    }

    /// A scan result for a connectable device
    pub async fn announce(&self, name: &str) -> DeviceId {
        let device = self.add_device(name);
        self.sink
            .discovered(DiscoveredDevice {
                device_id: device.clone(),
                local_name: Some(name.to_string()),
                rssi: Some(-60),
            })
            .await;
        device
    }

    pub async fn inject(&self, name: &str, data: Vec<u8>) {
        let delivered = self
            .sink
            .inbound(InboundChunk {
                handle: PeerHandle::new(name),
                role: SessionRole::OutgoingCentral,
                data,
                mtu: MTU,
            })
            .await;
        assert!(delivered, "dispatch loop not consuming chunks");
    }

    pub fn writes_to(&self, name: &str) -> Vec<Vec<u8>> {
        let handle = PeerHandle::new(name);
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

#[async_trait]
impl RadioTransport for MockRadio {
    async fn start_scanning(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn stop_scanning(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn start_advertising(&self, _identity: &LocalIdentity) -> MeshResult<()> {
        Ok(())
    }

    async fn stop_advertising(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> MeshResult<ConnectedPeer> {
        if !self.devices.lock().unwrap().contains(device) {
            return Err(MeshError::DeviceNotFound(device.to_string()));
        }
        let handle = PeerHandle::new(device.as_str());
        self.links
            .lock()
            .unwrap()
            .insert((handle.clone(), SessionRole::OutgoingCentral));
        Ok(ConnectedPeer { handle, mtu: MTU })
    }

    async fn disconnect(&self, handle: &PeerHandle, role: SessionRole) -> MeshResult<()> {
        self.links.lock().unwrap().remove(&(handle.clone(), role));
        Ok(())
    }

    async fn write_chunk(
        &self,
        handle: &PeerHandle,
        _role: SessionRole,
        chunk: &[u8],
    ) -> MeshResult<()> {
        self.writes
            .lock()
            .unwrap()
            .push((handle.clone(), chunk.to_vec()));
        Ok(())
    }

    async fn is_connected(&self, handle: &PeerHandle, role: SessionRole) -> bool {
        self.links.lock().unwrap().contains(&(handle.clone(), role))
    }

    fn take_events(&self) -> Option<RadioEvents> {
        self.events.lock().unwrap().take()
    }
}

/// Ledger with switchable reachability that accepts any correctly signed transaction
pub struct MockLedger {
    nonces: Mutex<HashMap<Pubkey, NonceAccount>>,
    blockhash: Hash,
    submitted: Mutex<Vec<Transaction>>,
    reachable: AtomicBool,
    confirming: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    waiting: AtomicUsize,
}

impl MockLedger {
    pub fn new(reachable: bool) -> Self {
        Self {
            nonces: Mutex::new(HashMap::new()),
            blockhash: Hash::new_unique(),
            submitted: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(reachable),
            confirming: AtomicBool::new(true),
            gate: Mutex::new(None),
            waiting: AtomicUsize::new(0),
        }
    }

    /// From now on each submission waits for a permit on the returned gate
    pub fn hold_submissions(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Submissions currently parked at the gate
    pub fn waiting_submissions(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// While false, landed transactions report as not yet confirmed
    pub fn set_confirming(&self, confirming: bool) {
        self.confirming.store(confirming, Ordering::SeqCst);
    }

    pub fn add_nonce_account(&self, authority: Pubkey) -> Pubkey {
        let address = Pubkey::new_unique();
        self.nonces.lock().unwrap().insert(
            address,
            NonceAccount {
                address,
                authority,
                nonce_value: Hash::new_unique(),
                lamports_per_signature: 5000,
            },
        );
        address
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.submitted.lock().unwrap().clone()
    }

    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::Rpc("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl NonceLedger for MockLedger {
    async fn get_nonce_account(&self, address: &Pubkey) -> Result<NonceAccount, NonceError> {
        self.nonces
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .ok_or(NonceError::AccountNotFound(*address))
    }

    async fn latest_blockhash(&self) -> Result<Hash, LedgerError> {
        self.check_reachable()?;
        Ok(self.blockhash)
    }

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, LedgerError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        self.check_reachable()?;
        if transaction.verify().is_err() {
            return Err(LedgerError::SubmitFailed("signature verification failed".to_string()));
        }

        let mut nonces = self.nonces.lock().unwrap();
        if let Some(nonce) = nonces
            .values_mut()
            .find(|nonce| is_durable_message(&transaction.message, nonce))
        {
            nonce.nonce_value = Hash::new_unique();
        }
        drop(nonces);

        self.submitted.lock().unwrap().push(transaction.clone());
        Ok(transaction.signatures[0])
    }

    async fn confirm_signature(&self, signature: &Signature) -> Result<bool, LedgerError> {
        self.check_reachable()?;
        if !self.confirming.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self
            .submitted
            .lock()
            .unwrap()
            .iter()
            .any(|tx| tx.signatures[0] == *signature))
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.mesh = MeshNetworkConfig {
        scan_interval_ms: 1_000,
        connection_timeout_ms: 1_000,
        write_timeout_ms: 500,
        health_check_interval_ms: 60_000,
        stale_session_timeout_ms: 600_000,
        max_connections: 4,
        failure_threshold: 2,
        default_mtu: MTU,
        power_on_timeout_ms: 2_000,
        packet_ttl: 7,
        device_name: "relay-test".to_string(),
    };
    // tests drive connectivity checks themselves unless they shorten this
    config.relay.connectivity_check_interval_ms = 60_000;
    config.relay.relayer_fee_per_hop = 1_000;
    config
}
