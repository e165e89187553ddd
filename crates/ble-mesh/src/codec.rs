//! Mesh packet wire format and MTU-bounded chunking
//!
//! Packet layout, all integers big-endian:
//!
//! ```text
//! type(1) | senderLen(2) | sender | recipientLen(2) | recipient? | timestamp(8) | ttl(1)
//!         | sigLen(2) | signature? | payloadLen(4) | payload
//! ```
//!
//! Every transmission is split into chunks of at most `mtu` bytes, each prefixed by
//! `chunkIndex(4) | totalChunks(4)`. Single-chunk transmissions carry the header too.

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Signature, Signer};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Length of a peer identifier on the wire
pub const PEER_ID_LEN: usize = 16;

/// Length of the per-chunk header
pub const CHUNK_HEADER_LEN: usize = 8;

/// Hop budget used by `Packet::new`
pub const DEFAULT_TTL: u8 = 7;

/// Fixed-length identifier of a mesh peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let array: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| CodecError::InvalidPeerIdLength(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl From<Uuid> for PeerId {
    fn from(id: Uuid) -> Self {
        Self(*id.as_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

/// Packet type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Data = 0x01,
    Transaction = 0x02,
    Discovery = 0x03,
    PeerInfo = 0x04,
    /// A detached co-signer signature travelling back to the payload holder
    Signature = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Data),
            0x02 => Ok(PacketType::Transaction),
            0x03 => Ok(PacketType::Discovery),
            0x04 => Ok(PacketType::PeerInfo),
            0x05 => Ok(PacketType::Signature),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }
}

/// Unit of mesh communication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub sender_id: PeerId,
    /// `None` means broadcast
    pub recipient_id: Option<PeerId>,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: u64,
    pub ttl: u8,
    pub signature: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            sender_id,
            recipient_id: None,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            ttl: DEFAULT_TTL,
            signature: None,
            payload,
        }
    }

    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient_id = Some(recipient);
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// Serialize to the unchunked wire form
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let signature = self.signature.as_deref().unwrap_or_default();
        self.write_with_signature(signature)
    }

    /// Parse the unchunked wire form; the buffer must contain exactly one packet
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);

        let packet_type = PacketType::try_from(reader.read_u8("type")?)?;

        let sender_len = reader.read_u16("senderLen")? as usize;
        let sender_id = PeerId::from_slice(reader.take(sender_len, "sender")?)?;

        let recipient_len = reader.read_u16("recipientLen")? as usize;
        let recipient_id = match recipient_len {
            0 => None,
            len => Some(PeerId::from_slice(reader.take(len, "recipient")?)?),
        };

        let timestamp = reader.read_u64("timestamp")?;
        let ttl = reader.read_u8("ttl")?;

        let sig_len = reader.read_u16("sigLen")? as usize;
        let signature = match sig_len {
            0 => None,
            len => Some(reader.take(len, "signature")?.to_vec()),
        };

        let payload_len = reader.read_u32("payloadLen")? as usize;
        let payload = reader.take(payload_len, "payload")?.to_vec();

        if reader.remaining() > 0 {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            packet_type,
            sender_id,
            recipient_id,
            timestamp,
            ttl,
            signature,
            payload,
        })
    }

    /// Bytes covered by the packet signature: the wire form with an empty signature field
    ///
    /// TTL is excluded so that relays can decrement it without breaking authenticity.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let unsigned = Packet {
            ttl: 0,
            ..self.clone()
        };
        unsigned.write_with_signature(&[])
    }

    /// Attach an ed25519 signature over `signable_bytes`
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<(), CodecError> {
        let message = self.signable_bytes()?;
        self.signature = Some(signer.sign_message(&message).as_ref().to_vec());
        Ok(())
    }

    /// Check the attached signature against `public_key`; unsigned packets never verify
    pub fn verify(&self, public_key: &Pubkey) -> bool {
        let Some(raw) = self.signature.as_deref() else {
            return false;
        };
        let Ok(signature) = Signature::try_from(raw) else {
            return false;
        };
        match self.signable_bytes() {
            Ok(message) => signature.verify(public_key.as_ref(), &message),
            Err(_) => false,
        }
    }

    fn write_with_signature(&self, signature: &[u8]) -> Result<Vec<u8>, CodecError> {
        let recipient: &[u8] = match &self.recipient_id {
            Some(id) => id.as_bytes(),
            None => &[],
        };

        let sig_len = u16::try_from(signature.len()).map_err(|_| CodecError::FieldTooLarge {
            field: "signature",
            len: signature.len(),
        })?;
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| CodecError::FieldTooLarge {
                field: "payload",
                len: self.payload.len(),
            })?;

        let mut out = Vec::with_capacity(
            1 + 2 + PEER_ID_LEN + 2 + recipient.len() + 8 + 1 + 2 + signature.len() + 4
                + self.payload.len(),
        );
        out.push(self.packet_type as u8);
        out.extend_from_slice(&(PEER_ID_LEN as u16).to_be_bytes());
        out.extend_from_slice(self.sender_id.as_bytes());
        out.extend_from_slice(&(recipient.len() as u16).to_be_bytes());
        out.extend_from_slice(recipient);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.push(self.ttl);
        out.extend_from_slice(&sig_len.to_be_bytes());
        out.extend_from_slice(signature);
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Bounds-checked big-endian reader
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn fixed<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], CodecError> {
        if self.remaining() < N {
            return Err(CodecError::Truncated {
                field,
                needed: N,
                remaining: self.remaining(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        if len > self.remaining() {
            return Err(CodecError::LengthOverflow {
                field,
                declared: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        Ok(self.fixed::<1>(field)?[0])
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.fixed(field)?))
    }

    fn read_u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.fixed(field)?))
    }

    fn read_u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.fixed(field)?))
    }
}

/// Header prefixed to every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub index: u32,
    pub total: u32,
}

impl ChunkHeader {
    pub fn to_bytes(self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..4].copy_from_slice(&self.index.to_be_bytes());
        out[4..].copy_from_slice(&self.total.to_be_bytes());
        out
    }

    /// Split a chunk into its validated header and body
    pub fn parse(chunk: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let mut reader = Reader::new(chunk);
        let index = reader.read_u32("chunkIndex")?;
        let total = reader.read_u32("totalChunks")?;

        if total == 0 {
            return Err(CodecError::ZeroChunkTotal);
        }
        if index >= total {
            return Err(CodecError::ChunkIndexOutOfRange { index, total });
        }

        let body = &chunk[CHUNK_HEADER_LEN..];
        if body.is_empty() {
            return Err(CodecError::EmptyChunk);
        }
        Ok((Self { index, total }, body))
    }
}

/// Encode a packet into chunks of at most `mtu` bytes each
pub fn encode(packet: &Packet, mtu: usize) -> Result<Vec<Vec<u8>>, CodecError> {
    if mtu <= CHUNK_HEADER_LEN {
        return Err(CodecError::MtuTooSmall(mtu));
    }

    let body = packet.to_bytes()?;
    let budget = mtu - CHUNK_HEADER_LEN;
    let total = body.len().div_ceil(budget);
    let total = u32::try_from(total).map_err(|_| CodecError::FieldTooLarge {
        field: "totalChunks",
        len: total,
    })?;

    let chunks = body
        .chunks(budget)
        .enumerate()
        .map(|(index, part)| {
            let header = ChunkHeader {
                index: index as u32,
                total,
            };
            let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + part.len());
            chunk.extend_from_slice(&header.to_bytes());
            chunk.extend_from_slice(part);
            chunk
        })
        .collect();

    Ok(chunks)
}

/// Decode a self-contained single-chunk transmission
pub fn decode(chunk: &[u8]) -> Result<Packet, CodecError> {
    let mut buffer = ChunkBuffer::new();
    match buffer.insert(chunk)? {
        Some(packet) => Ok(packet),
        None => Err(CodecError::Incomplete {
            received: buffer.pending_chunks(),
            total: buffer.expected_total().unwrap_or_default(),
        }),
    }
}

/// Decode a complete set of chunks delivered in any order
pub fn decode_chunks<I, C>(chunks: I) -> Result<Packet, CodecError>
where
    I: IntoIterator<Item = C>,
    C: AsRef<[u8]>,
{
    let mut buffer = ChunkBuffer::new();
    for chunk in chunks {
        let chunk = chunk.as_ref();
        let (header, _) = ChunkHeader::parse(chunk)?;
        if let Some(expected) = buffer.expected_total() {
            if expected != header.total {
                return Err(CodecError::InconsistentTotal {
                    expected,
                    found: header.total,
                });
            }
        }
        if let Some(packet) = buffer.insert(chunk)? {
            return Ok(packet);
        }
    }
    Err(CodecError::Incomplete {
        received: buffer.pending_chunks(),
        total: buffer.expected_total().unwrap_or_default(),
    })
}

/// Reassembly state for the transmission currently in flight from one peer
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    total: Option<u32>,
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk; returns the packet once every index has arrived
    ///
    /// A chunk whose total disagrees with the buffered transmission means the peer
    /// gave up on it: the partial transmission is discarded and reassembly starts
    /// over from this chunk. The buffer is empty again after any completed packet,
    /// whether or not it decoded.
    pub fn insert(&mut self, chunk: &[u8]) -> Result<Option<Packet>, CodecError> {
        let (header, body) = ChunkHeader::parse(chunk)?;

        match self.total {
            Some(expected) if expected != header.total => {
                debug!(
                    "Abandoning partial transmission ({}/{} chunks) for a new {}-chunk one",
                    self.chunks.len(),
                    expected,
                    header.total
                );
                self.clear();
                self.total = Some(header.total);
            }
            Some(_) => {}
            None => self.total = Some(header.total),
        }

        self.chunks.insert(header.index, body.to_vec());

        if self.chunks.len() as u64 == header.total as u64 {
            let parts = std::mem::take(&mut self.chunks);
            self.total = None;
            let bytes: Vec<u8> = parts.into_values().flatten().collect();
            return Packet::from_bytes(&bytes).map(Some);
        }

        Ok(None)
    }

    pub fn clear(&mut self) {
        self.total = None;
        self.chunks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn pending_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn expected_total(&self) -> Option<u32> {
        self.total
    }
}
