//! Payloads held while the ledger is unreachable

use crate::error::{TxError, TxResult};
use crate::payload::OfflineTransactionPayload;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded FIFO of payloads awaiting submission, unique by payload id
pub struct Outbox {
    queue: VecDeque<OfflineTransactionPayload>,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        info!("Initializing Outbox with capacity={}", capacity);

        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Queue a payload
    ///
    /// A payload already queued is replaced in place (the new copy may carry more
    /// signatures) and `Ok(false)` is returned.
    pub fn push(&mut self, payload: OfflineTransactionPayload) -> TxResult<bool> {
        if self.replace(payload.clone()) {
            debug!("Payload {} already queued; updated", payload.id);
            return Ok(false);
        }

        if self.queue.len() >= self.capacity {
            warn!("Outbox full ({} payloads); rejecting {}", self.capacity, payload.id);
            return Err(TxError::OutboxFull(self.capacity));
        }

        info!(
            "Queued payload {} for submission (outbox size: {})",
            payload.id,
            self.queue.len() + 1
        );
        self.queue.push_back(payload);
        Ok(true)
    }

    /// Swap in a newer copy of a queued payload; false if it is not queued
    pub fn replace(&mut self, payload: OfflineTransactionPayload) -> bool {
        match self.queue.iter_mut().find(|queued| queued.id == payload.id) {
            Some(queued) => {
                *queued = payload;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&OfflineTransactionPayload> {
        self.queue.iter().find(|queued| &queued.id == id)
    }

    /// Queued payloads, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &OfflineTransactionPayload> {
        self.queue.iter()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<OfflineTransactionPayload> {
        let index = self.queue.iter().position(|queued| &queued.id == id)?;
        self.queue.remove(index)
    }

    /// Drop blockhash payloads older than `window`; durable ones never expire
    pub fn prune_expired(&mut self, now: DateTime<Utc>, window: chrono::Duration) -> usize {
        let before = self.queue.len();
        self.queue.retain(|payload| {
            let keep = payload.durable || payload.age(now) < window;
            if !keep {
                debug!("Removing expired payload {} (age: {})", payload.id, payload.age(now));
            }
            keep
        });

        let removed = before - self.queue.len();
        if removed > 0 {
            info!("Pruned {} expired payloads from outbox", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::RelayMetadata;
    use solana_sdk::pubkey::Pubkey;

    fn payload(durable: bool, created_at: DateTime<Utc>) -> OfflineTransactionPayload {
        OfflineTransactionPayload {
            id: Uuid::new_v4(),
            serialized_tx: vec![],
            message_bytes: vec![],
            nonce_account: None,
            fee_payer: Pubkey::new_unique(),
            recipient: Pubkey::new_unique(),
            amount: 10,
            sender: "bob".to_string(),
            created_at,
            durable,
            memo: None,
            signatures: vec![],
            required_signers: vec![],
            relay_metadata: RelayMetadata::new(3, 0),
        }
    }

    #[test]
    fn test_fifo_order_and_dedup() {
        let mut outbox = Outbox::new(4);
        let first = payload(true, Utc::now());
        let second = payload(true, Utc::now());

        assert!(outbox.push(first.clone()).unwrap());
        assert!(outbox.push(second.clone()).unwrap());

        let mut updated = first.clone();
        updated.relay_metadata.hop_count = 2;
        assert!(!outbox.push(updated).unwrap());
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.get(&first.id).unwrap().relay_metadata.hop_count, 2);

        let order: Vec<_> = outbox.iter().map(|queued| queued.id).collect();
        assert_eq!(order, vec![first.id, second.id]);

        assert_eq!(outbox.remove(&first.id).unwrap().id, first.id);
        assert!(outbox.remove(&first.id).is_none());
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let mut outbox = Outbox::new(1);
        outbox.push(payload(true, Utc::now())).unwrap();
        assert!(matches!(
            outbox.push(payload(true, Utc::now())),
            Err(TxError::OutboxFull(1))
        ));
    }

    #[test]
    fn test_prune_keeps_durable_payloads() {
        let mut outbox = Outbox::new(8);
        let old = Utc::now() - chrono::Duration::minutes(10);
        let durable = payload(true, old);
        let stale = payload(false, old);
        let fresh = payload(false, Utc::now());

        outbox.push(durable.clone()).unwrap();
        outbox.push(stale.clone()).unwrap();
        outbox.push(fresh.clone()).unwrap();

        assert_eq!(outbox.prune_expired(Utc::now(), chrono::Duration::seconds(60)), 1);
        assert!(outbox.contains(&durable.id));
        assert!(outbox.contains(&fresh.id));
        assert!(!outbox.contains(&stale.id));
    }
}
