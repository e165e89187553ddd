//! Per-peer connection state, independent of the radio stack

use crate::codec::{self, ChunkBuffer, Packet};
use crate::error::CodecError;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// We scanned, connected and write to the peer's write characteristic
    OutgoingCentral,
    /// The peer connected to our GATT server and writes to us
    IncomingPeripheral,
}

/// Opaque native connection reference (peripheral id or remote address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(String);

impl PeerHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of the session table; the same device may hold one session per role
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub role: SessionRole,
    pub handle: PeerHandle,
}

impl SessionId {
    pub fn new(role: SessionRole, handle: PeerHandle) -> Self {
        Self { role, handle }
    }

    pub fn central(handle: PeerHandle) -> Self {
        Self::new(SessionRole::OutgoingCentral, handle)
    }

    pub fn peripheral(handle: PeerHandle) -> Self {
        Self::new(SessionRole::IncomingPeripheral, handle)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            SessionRole::OutgoingCentral => "central",
            SessionRole::IncomingPeripheral => "peripheral",
        };
        write!(f, "{}:{}", role, self.handle)
    }
}

/// One live connection to a peer
#[derive(Debug)]
pub struct TransportSession {
    id: SessionId,
    mtu: usize,
    connected_at: Instant,
    last_seen: Instant,
    failure_count: u32,
    reassembly: ChunkBuffer,
}

/// Read-only view of a session for callers outside the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub mtu: usize,
    pub failure_count: u32,
    pub idle: Duration,
    pub pending_chunks: usize,
}

impl TransportSession {
    pub fn new(id: SessionId, mtu: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            mtu,
            connected_at: now,
            last_seen: now,
            failure_count: 0,
            reassembly: ChunkBuffer::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> SessionRole {
        self.id.role
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// A send completed; consecutive failures start over
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.touch();
    }

    /// Count a failed send; true once the threshold is reached
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.failure_count >= threshold
    }

    pub fn is_stale(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > window
    }

    /// Feed one inbound chunk into this peer's reassembly buffer
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<Option<Packet>, CodecError> {
        self.touch();
        self.reassembly.insert(chunk)
    }

    /// Chunk a packet for this session's MTU
    pub fn encode(&self, packet: &Packet) -> Result<Vec<Vec<u8>>, CodecError> {
        codec::encode(packet, self.mtu)
    }

    /// Drop any partially received transmission
    pub fn clear_reassembly(&mut self) {
        self.reassembly.clear();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            mtu: self.mtu,
            failure_count: self.failure_count,
            idle: self.last_seen.elapsed(),
            pending_chunks: self.reassembly.pending_chunks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PacketType, PeerId};

    fn session() -> TransportSession {
        TransportSession::new(SessionId::central(PeerHandle::new("AA:BB")), 64)
    }

    #[test]
    fn test_failure_threshold_and_reset() {
        let mut s = session();
        assert!(!s.record_failure(3));
        assert!(!s.record_failure(3));
        s.record_success();
        assert_eq!(s.failure_count(), 0);

        assert!(!s.record_failure(3));
        assert!(!s.record_failure(3));
        assert!(s.record_failure(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_window() {
        let mut s = session();
        let window = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!s.is_stale(Instant::now(), window));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(s.is_stale(Instant::now(), window));

        s.touch();
        assert!(!s.is_stale(Instant::now(), window));
    }

    #[test]
    fn test_ingest_and_clear() {
        let mut s = session();
        let packet = Packet::new(PacketType::Data, PeerId::random(), vec![9; 200]);
        let chunks = s.encode(&packet).unwrap();
        assert!(chunks.len() > 2);

        assert!(s.ingest(&chunks[0]).unwrap().is_none());
        assert_eq!(s.info().pending_chunks, 1);
        s.clear_reassembly();
        assert_eq!(s.info().pending_chunks, 0);

        let mut delivered = None;
        for chunk in &chunks {
            delivered = s.ingest(chunk).unwrap();
        }
        assert_eq!(delivered, Some(packet));
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId::peripheral(PeerHandle::new("11:22"));
        assert_eq!(id.to_string(), "peripheral:11:22");
    }
}
