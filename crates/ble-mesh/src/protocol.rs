//! GATT identifiers and the peer-info record served by every node

use crate::codec::{PeerId, CHUNK_HEADER_LEN, PEER_ID_LEN};
use crate::error::CodecError;
use chrono::{DateTime, TimeZone, Utc};
use solana_sdk::pubkey::Pubkey;
use uuid::Uuid;

/// Mesh service advertised by every peer
pub const MESH_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Peripheral-writable characteristic; centrals push chunks here
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Notify characteristic; peripherals push chunks to subscribed centrals
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Read-only characteristic holding the serialized `PeerInfo`
pub const PEER_INFO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400004_B5A3_F393_E0A9_E50E24DCCA9E);

/// Read-only characteristic holding the ATT MTU the peripheral sees on the reader's link
pub const LINK_MTU_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400005_B5A3_F393_E0A9_E50E24DCCA9E);

/// ATT opcode and handle overhead subtracted from the link MTU
pub const ATT_HEADER_LEN: usize = 3;

/// Value served by the link MTU characteristic: the ATT MTU, big-endian
pub fn link_mtu_bytes(att_mtu: u16) -> [u8; 2] {
    att_mtu.to_be_bytes()
}

/// Usable chunk size from a link MTU characteristic value
///
/// `None` if the value is malformed or leaves no room past the chunk header.
pub fn usable_link_mtu(value: &[u8]) -> Option<usize> {
    let att_mtu: [u8; 2] = value.try_into().ok()?;
    let usable = usize::from(u16::from_be_bytes(att_mtu)).checked_sub(ATT_HEADER_LEN)?;
    (usable > CHUNK_HEADER_LEN).then_some(usable)
}

/// Identity a node publishes about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub display_name: String,
    pub public_key: Pubkey,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>, public_key: Pubkey) -> Self {
        let now = Utc::now();
        Self {
            peer_id,
            display_name: display_name.into(),
            public_key,
            first_seen: now,
            last_seen: now,
        }
    }

    /// `peerId(16) | nameLen(2) | name | publicKey(32) | firstSeen(8) | lastSeen(8)`,
    /// timestamps in milliseconds, big-endian
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let name = self.display_name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| CodecError::FieldTooLarge {
            field: "displayName",
            len: name.len(),
        })?;

        let mut out = Vec::with_capacity(PEER_ID_LEN + 2 + name.len() + 32 + 16);
        out.extend_from_slice(self.peer_id.as_bytes());
        out.extend_from_slice(&name_len.to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(self.public_key.as_ref());
        out.extend_from_slice(&self.first_seen.timestamp_millis().to_be_bytes());
        out.extend_from_slice(&self.last_seen.timestamp_millis().to_be_bytes());
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = bytes;

        let peer_id = PeerId::from_slice(split(&mut cursor, PEER_ID_LEN, "peerId")?)?;
        let name_len = u16::from_be_bytes(fixed(&mut cursor, "nameLen")?) as usize;
        if name_len > cursor.len() {
            return Err(CodecError::LengthOverflow {
                field: "displayName",
                declared: name_len,
                remaining: cursor.len(),
            });
        }
        let display_name = String::from_utf8_lossy(split(&mut cursor, name_len, "displayName")?)
            .into_owned();
        let public_key = Pubkey::new_from_array(fixed(&mut cursor, "publicKey")?);
        let first_seen = millis_to_datetime(i64::from_be_bytes(fixed(&mut cursor, "firstSeen")?));
        let last_seen = millis_to_datetime(i64::from_be_bytes(fixed(&mut cursor, "lastSeen")?));

        if !cursor.is_empty() {
            return Err(CodecError::TrailingBytes(cursor.len()));
        }

        Ok(Self {
            peer_id,
            display_name,
            public_key,
            first_seen,
            last_seen,
        })
    }
}

fn split<'a>(
    cursor: &mut &'a [u8],
    len: usize,
    field: &'static str,
) -> Result<&'a [u8], CodecError> {
    if cursor.len() < len {
        return Err(CodecError::Truncated {
            field,
            needed: len,
            remaining: cursor.len(),
        });
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn fixed<const N: usize>(cursor: &mut &[u8], field: &'static str) -> Result<[u8; N], CodecError> {
    let mut out = [0u8; N];
    out.copy_from_slice(split(cursor, N, field)?);
    Ok(out)
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
