//! BLE mesh transport for offline P2P communication
//!
//! This crate implements the mesh packet wire format, MTU-bounded chunking, a
//! dual-mode (central + peripheral) connection manager over a pluggable radio, and
//! a TTL/dedup packet router on top of it.

pub mod codec;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod radio;
pub mod router;
pub mod session;

// Re-export main types
pub use codec::{ChunkBuffer, Packet, PacketType, PeerId, DEFAULT_TTL};
pub use error::{CodecError, MeshError, MeshResult};
pub use manager::{BroadcastReport, ConnectionManager, ManagerState, SendOutcome};
pub use protocol::PeerInfo;
pub use radio::{
    DeviceId, DiscoveredDevice, LocalIdentity, PlatformRadio, RadioEvents, RadioPower,
    RadioTransport,
};
pub use router::{PacketRouter, Route};
pub use session::{PeerHandle, SessionId, SessionInfo, SessionRole, TransportSession};
