//! Durable (nonce-anchored) transaction construction
//!
//! A durable transaction's first instruction advances its nonce account and its
//! `recent_blockhash` is that account's current nonce value. Such a transaction
//! never expires by time; it is invalidated only when the nonce is advanced.

use crate::error::{NonceError, SignatureError, TxError, TxResult};
use crate::nonce::{NonceAccount, NonceLedger};
use crate::payload::{signer_keys, OfflineTransactionPayload, RelayMetadata, SignatureEntry};
use chrono::Utc;
use shared::RelayConfig;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::Message;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signer;
use solana_sdk::system_instruction::{self, SystemInstruction};
use solana_sdk::system_program;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// SPL memo program
pub const MEMO_PROGRAM_ID: Pubkey = solana_sdk::pubkey!("MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr");

/// Transfer parameters shared by durable and blockhash transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub recipient: Pubkey,
    pub amount: u64,
    pub memo: Option<String>,
    pub max_hops: u8,
    pub relayer_fee_per_hop: u64,
    /// Defaults to the sender
    pub fee_payer: Option<Pubkey>,
    /// Defaults to the sender's public key
    pub sender_label: Option<String>,
}

impl TransferRequest {
    /// A transfer carrying the default relay policy
    pub fn new(recipient: Pubkey, amount: u64) -> Self {
        Self {
            recipient,
            amount,
            memo: None,
            max_hops: 0,
            relayer_fee_per_hop: 0,
            fee_payer: None,
            sender_label: None,
        }
        .with_relay_config(&RelayConfig::default())
    }

    pub fn with_relay_config(self, config: &RelayConfig) -> Self {
        self.with_relay(config.max_relay_hops, config.relayer_fee_per_hop)
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_relay(mut self, max_hops: u8, relayer_fee_per_hop: u64) -> Self {
        self.max_hops = max_hops;
        self.relayer_fee_per_hop = relayer_fee_per_hop;
        self
    }

    pub fn with_fee_payer(mut self, fee_payer: Pubkey) -> Self {
        self.fee_payer = Some(fee_payer);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableTransferRequest {
    pub nonce_account: Pubkey,
    pub transfer: TransferRequest,
}

impl DurableTransferRequest {
    pub fn new(nonce_account: Pubkey, transfer: TransferRequest) -> Self {
        Self {
            nonce_account,
            transfer,
        }
    }
}

pub fn memo_instruction(memo: &str) -> Instruction {
    Instruction {
        program_id: MEMO_PROGRAM_ID,
        accounts: vec![],
        data: memo.as_bytes().to_vec(),
    }
}

/// Builds sender-signed payloads ready for the mesh
pub struct DurableTransactionBuilder<L: NonceLedger> {
    ledger: Arc<L>,
}

impl<L: NonceLedger> DurableTransactionBuilder<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        Self { ledger }
    }

    /// Build a nonce-anchored transfer signed by `sender`
    ///
    /// When the nonce authority or fee payer is a different key, it stays in
    /// `required_signers` for later aggregation.
    pub async fn create_offline_durable_transaction(
        &self,
        request: &DurableTransferRequest,
        sender: &(dyn Signer + Sync),
    ) -> TxResult<OfflineTransactionPayload> {
        let transfer = &request.transfer;
        if transfer.amount == 0 {
            return Err(TxError::InvalidAmount);
        }

        let nonce = self.ledger.get_nonce_account(&request.nonce_account).await?;
        debug!(
            "Using nonce {} from account {} (authority {})",
            nonce.nonce_value, nonce.address, nonce.authority
        );

        let sender_key = sender.pubkey();
        let payer = transfer.fee_payer.unwrap_or(sender_key);

        // advancing the nonce must be the first instruction
        let mut instructions = vec![system_instruction::advance_nonce_account(
            &nonce.address,
            &nonce.authority,
        )];
        instructions.push(system_instruction::transfer(
            &sender_key,
            &transfer.recipient,
            transfer.amount,
        ));
        if let Some(memo) = &transfer.memo {
            instructions.push(memo_instruction(memo));
        }

        let message = Message::new_with_blockhash(&instructions, Some(&payer), &nonce.nonce_value);
        let payload = sign_into_payload(message, transfer, Some(nonce.address), sender)?;

        info!(
            "Created durable payload {} ({} lamports to {}, {} signer(s) outstanding)",
            payload.id,
            transfer.amount,
            transfer.recipient,
            payload.required_signers.len()
        );
        Ok(payload)
    }

    /// Build a transfer anchored to a recent blockhash
    ///
    /// The result expires with the blockhash, so relays only forward it within the
    /// non-durable window.
    pub async fn build_blockhash_transaction(
        &self,
        transfer: &TransferRequest,
        sender: &(dyn Signer + Sync),
    ) -> TxResult<OfflineTransactionPayload> {
        if transfer.amount == 0 {
            return Err(TxError::InvalidAmount);
        }

        let blockhash = self.ledger.latest_blockhash().await?;
        let sender_key = sender.pubkey();
        let payer = transfer.fee_payer.unwrap_or(sender_key);

        let mut instructions = vec![system_instruction::transfer(
            &sender_key,
            &transfer.recipient,
            transfer.amount,
        )];
        if let Some(memo) = &transfer.memo {
            instructions.push(memo_instruction(memo));
        }

        let message = Message::new_with_blockhash(&instructions, Some(&payer), &blockhash);
        let payload = sign_into_payload(message, transfer, None, sender)?;

        info!(
            "Created blockhash payload {} ({} lamports to {})",
            payload.id, transfer.amount, transfer.recipient
        );
        Ok(payload)
    }
}

fn sign_into_payload(
    message: Message,
    transfer: &TransferRequest,
    nonce_account: Option<Pubkey>,
    sender: &dyn Signer,
) -> TxResult<OfflineTransactionPayload> {
    let sender_key = sender.pubkey();
    let message_bytes = message.serialize();

    let signature = sender
        .try_sign_message(&message_bytes)
        .map_err(SignatureError::from)?;
    let entry = SignatureEntry::new(sender_key, signature);
    if !entry.verify(&message_bytes) {
        return Err(SignatureError::InvalidSignature(sender_key).into());
    }

    let required_signers: Vec<Pubkey> = signer_keys(&message)
        .iter()
        .filter(|key| **key != sender_key)
        .copied()
        .collect();

    let mut payload = OfflineTransactionPayload {
        id: Uuid::new_v4(),
        serialized_tx: Vec::new(),
        message_bytes,
        nonce_account,
        fee_payer: transfer.fee_payer.unwrap_or(sender_key),
        recipient: transfer.recipient,
        amount: transfer.amount,
        sender: transfer
            .sender_label
            .clone()
            .unwrap_or_else(|| sender_key.to_string()),
        created_at: Utc::now(),
        durable: nonce_account.is_some(),
        memo: transfer.memo.clone(),
        signatures: vec![entry],
        required_signers,
        relay_metadata: RelayMetadata::new(transfer.max_hops, transfer.relayer_fee_per_hop),
    };
    payload.refresh_transaction()?;
    Ok(payload)
}

/// True if instruction 0 advances `nonce` and the message is anchored to its value
pub fn is_durable_message(message: &Message, nonce: &NonceAccount) -> bool {
    if message.recent_blockhash != nonce.nonce_value {
        return false;
    }

    let Some(first) = message.instructions.first() else {
        return false;
    };
    let program = message.account_keys.get(usize::from(first.program_id_index));
    if program != Some(&system_program::id()) {
        return false;
    }

    let advances = matches!(
        bincode::deserialize::<SystemInstruction>(&first.data),
        Ok(SystemInstruction::AdvanceNonceAccount)
    );
    let account = first
        .accounts
        .first()
        .and_then(|index| message.account_keys.get(usize::from(*index)));

    advances && account == Some(&nonce.address)
}

/// Re-read the nonce and fail if the payload was signed against a stale value
pub async fn validate_against_nonce<L: NonceLedger + ?Sized>(
    payload: &OfflineTransactionPayload,
    ledger: &L,
) -> TxResult<NonceAccount> {
    let address = match (payload.durable, payload.nonce_account) {
        (true, Some(address)) => address,
        _ => return Err(TxError::NotDurable(payload.id)),
    };

    let message = payload.message()?;
    let current = ledger.get_nonce_account(&address).await?;

    if message.recent_blockhash != current.nonce_value {
        return Err(NonceError::Advanced {
            account: address,
            expected: message.recent_blockhash,
            current: current.nonce_value,
        }
        .into());
    }

    if !is_durable_message(&message, &current) {
        return Err(TxError::InvalidPayload(format!(
            "payload {} does not advance nonce account {} first",
            payload.id, address
        )));
    }

    // advance_nonce_account lists (nonce, recent_blockhashes sysvar, authority)
    let signed_by = message
        .instructions
        .first()
        .and_then(|ix| ix.accounts.get(2))
        .and_then(|index| message.account_keys.get(usize::from(*index)));
    match signed_by {
        Some(key) if *key == current.authority => Ok(current),
        Some(key) => Err(NonceError::AuthorityMismatch {
            account: address,
            signed_by: *key,
            current: current.authority,
        }
        .into()),
        None => Err(TxError::InvalidPayload(format!(
            "payload {} names no nonce authority",
            payload.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::signature::Keypair;

    fn nonce_account() -> NonceAccount {
        NonceAccount {
            address: Pubkey::new_unique(),
            authority: Pubkey::new_unique(),
            nonce_value: Hash::new_unique(),
            lamports_per_signature: 5000,
        }
    }

    #[test]
    fn test_is_durable_message_requires_advance_first() {
        let nonce = nonce_account();
        let sender = Pubkey::new_unique();
        let advance = system_instruction::advance_nonce_account(&nonce.address, &nonce.authority);
        let transfer = system_instruction::transfer(&sender, &Pubkey::new_unique(), 1);

        let good = Message::new_with_blockhash(
            &[advance.clone(), transfer.clone()],
            Some(&sender),
            &nonce.nonce_value,
        );
        assert!(is_durable_message(&good, &nonce));

        let reordered =
            Message::new_with_blockhash(&[transfer.clone(), advance.clone()], Some(&sender), &nonce.nonce_value);
        assert!(!is_durable_message(&reordered, &nonce));

        let wrong_anchor =
            Message::new_with_blockhash(&[advance, transfer], Some(&sender), &Hash::new_unique());
        assert!(!is_durable_message(&wrong_anchor, &nonce));
    }

    #[test]
    fn test_sign_into_payload_leaves_other_signers_required() {
        let sender = Keypair::new();
        let payer = Pubkey::new_unique();
        let transfer = TransferRequest::new(Pubkey::new_unique(), 42)
            .with_fee_payer(payer)
            .with_memo("lunch");
        let instructions = vec![
            system_instruction::transfer(&sender.pubkey(), &transfer.recipient, 42),
            memo_instruction("lunch"),
        ];
        let message = Message::new_with_blockhash(&instructions, Some(&payer), &Hash::new_unique());

        let payload = sign_into_payload(message, &transfer, None, &sender).unwrap();
        assert!(!payload.durable);
        assert_eq!(payload.required_signers, vec![payer]);
        assert_eq!(payload.signatures.len(), 1);
        assert!(payload.signatures[0].verify(&payload.message_bytes));
        assert_eq!(payload.sender, sender.pubkey().to_string());

        let tx = payload.transaction().unwrap();
        assert_eq!(tx.signatures.len(), 2);
        assert_eq!(tx.signatures[1], payload.signatures[0].signature);
    }

    #[test]
    fn test_relay_policy_comes_from_config() {
        let defaults = RelayConfig::default();
        let transfer = TransferRequest::new(Pubkey::new_unique(), 1);
        assert_eq!(transfer.max_hops, defaults.max_relay_hops);
        assert_eq!(transfer.relayer_fee_per_hop, defaults.relayer_fee_per_hop);

        let config = RelayConfig {
            max_relay_hops: 2,
            relayer_fee_per_hop: 750,
            ..RelayConfig::default()
        };
        let transfer = TransferRequest::new(Pubkey::new_unique(), 1).with_relay_config(&config);
        assert_eq!((transfer.max_hops, transfer.relayer_fee_per_hop), (2, 750));
    }

    #[test]
    fn test_memo_instruction_targets_memo_program() {
        let ix = memo_instruction("hello");
        assert_eq!(ix.program_id, MEMO_PROGRAM_ID);
        assert_eq!(ix.data, b"hello".to_vec());
        assert!(ix.accounts.is_empty());
    }
}
