//! Error types for BLE mesh operations

use crate::manager::ManagerState;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Malformed, truncated or inconsistent wire data
///
/// Always recoverable: the offending chunk or packet is dropped and the session stays up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer truncated reading {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("length of {field} ({declared}) exceeds remaining buffer ({remaining})")]
    LengthOverflow {
        field: &'static str,
        declared: usize,
        remaining: usize,
    },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("unknown packet type 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("invalid peer id length {0}")]
    InvalidPeerIdLength(usize),

    #[error("{field} of {len} bytes does not fit its length prefix")]
    FieldTooLarge { field: &'static str, len: usize },

    #[error("inconsistent chunk total: transmission declared {expected}, chunk declared {found}")]
    InconsistentTotal { expected: u32, found: u32 },

    #[error("chunk index {index} out of range for {total} chunks")]
    ChunkIndexOutOfRange { index: u32, total: u32 },

    #[error("chunk declares zero total chunks")]
    ZeroChunkTotal,

    #[error("chunk carries no body")]
    EmptyChunk,

    #[error("MTU {0} leaves no room after the chunk header")]
    MtuTooSmall(usize),

    #[error("transmission incomplete: {received} of {total} chunks")]
    Incomplete { received: usize, total: u32 },
}

/// Errors that can occur during BLE mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("BLE connection failed: {0}")]
    ConnectionFailed(String),

    #[error("BLE connection timed out after {0:?}")]
    ConnectionTimeout(std::time::Duration),

    #[error("Chunk write failed: {0}")]
    WriteFailed(String),

    #[error("Chunk write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Connection limit of {0} sessions reached")]
    ConnectionLimit(usize),

    #[error("BLE radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("BLE adapter error: {0}")]
    AdapterError(String),

    #[error("Peripheral role is not supported on this platform")]
    PeripheralUnsupported,

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        state: ManagerState,
        operation: &'static str,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    /// Connect/write timeouts and native link failures, the errors that count against a session
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            MeshError::ConnectionFailed(_)
                | MeshError::ConnectionTimeout(_)
                | MeshError::WriteFailed(_)
                | MeshError::WriteTimeout(_)
                | MeshError::AdapterError(_)
        )
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::AdapterError(err.to_string())
    }
}

impl From<btleplug::Error> for MeshError {
    fn from(err: btleplug::Error) -> Self {
        MeshError::AdapterError(err.to_string())
    }
}

#[cfg(target_os = "linux")]
impl From<bluer::Error> for MeshError {
    fn from(err: bluer::Error) -> Self {
        MeshError::AdapterError(err.to_string())
    }
}
