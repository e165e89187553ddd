//! Mesh relay forwarding policy

use crate::error::{TxError, TxResult};
use crate::payload::{OfflineTransactionPayload, RelayMetadata};
use chrono::{DateTime, Utc};
use solana_sdk::pubkey::Pubkey;
use tracing::debug;

/// Whether a relay may forward `payload` at `now`
///
/// Durable payloads never expire; blockhash payloads are only relayed while
/// younger than `window`.
pub fn should_relay(
    payload: &OfflineTransactionPayload,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> bool {
    let meta = &payload.relay_metadata;
    if meta.hop_count >= meta.max_hops {
        return false;
    }
    payload.durable || payload.age(now) < window
}

/// Count one hop through `relayer`
///
/// A relayer already recorded is not credited again, though the hop still counts.
pub fn record_hop(
    payload: &OfflineTransactionPayload,
    relayer: Pubkey,
) -> TxResult<OfflineTransactionPayload> {
    let meta = &payload.relay_metadata;
    if meta.hop_count >= meta.max_hops {
        return Err(TxError::RelayLimitReached {
            max_hops: meta.max_hops,
        });
    }

    let mut next = payload.clone();
    next.relay_metadata.hop_count += 1;
    if !next.relay_metadata.relayers.contains(&relayer) {
        next.relay_metadata.relayers.push(relayer);
    }
    Ok(next)
}

pub fn total_relayer_fees(meta: &RelayMetadata) -> u64 {
    meta.total_relayer_fees()
}

/// Applies the relay policy on behalf of one local relayer key
#[derive(Debug, Clone)]
pub struct MeshRelayForwarder {
    relayer: Pubkey,
    window: chrono::Duration,
    hop_limit: u8,
}

impl MeshRelayForwarder {
    pub fn new(relayer: Pubkey, window: chrono::Duration) -> Self {
        Self {
            relayer,
            window,
            hop_limit: u8::MAX,
        }
    }

    /// Never carry a payload further than `hop_limit` hops, whatever it asks for
    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit;
        self
    }

    pub fn relayer(&self) -> Pubkey {
        self.relayer
    }

    /// Lower the payload's hop budget to our limit; true if it asked for more
    pub fn cap_hops(&self, payload: &mut OfflineTransactionPayload) -> bool {
        let meta = &mut payload.relay_metadata;
        if meta.max_hops <= self.hop_limit {
            return false;
        }
        debug!(
            "Capping payload {} from {} to {} hops",
            payload.id, meta.max_hops, self.hop_limit
        );
        meta.max_hops = self.hop_limit;
        true
    }

    /// The payload with our hop recorded, or `None` if it must not travel further
    pub fn forward(
        &self,
        payload: &OfflineTransactionPayload,
        now: DateTime<Utc>,
    ) -> Option<OfflineTransactionPayload> {
        let mut payload = payload.clone();
        self.cap_hops(&mut payload);
        if !should_relay(&payload, now, self.window) {
            debug!(
                "Not relaying payload {} (hop {}/{}, durable: {})",
                payload.id,
                payload.relay_metadata.hop_count,
                payload.relay_metadata.max_hops,
                payload.durable
            );
            return None;
        }
        record_hop(&payload, self.relayer).ok()
    }
}
