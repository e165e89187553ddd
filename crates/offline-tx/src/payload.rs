//! Offline transaction payload and its mesh relay envelope
//!
//! Payloads travel inside `PacketType::Transaction` packets; detached co-signer
//! signatures travel inside `PacketType::Signature` packets. Both are bincode.

use crate::error::{SignatureError, TxError, TxResult};
use ble_mesh::{Packet, PacketType, PeerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::message::Message;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use uuid::Uuid;

/// One collected signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub public_key: Pubkey,
    pub signature: Signature,
}

impl SignatureEntry {
    pub fn new(public_key: Pubkey, signature: Signature) -> Self {
        Self {
            public_key,
            signature,
        }
    }

    pub fn verify(&self, message_bytes: &[u8]) -> bool {
        self.signature
            .verify(self.public_key.as_ref(), message_bytes)
    }
}

/// Hop accounting carried alongside a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMetadata {
    pub hop_count: u8,
    pub max_hops: u8,
    /// Lamports owed to each distinct relayer
    pub relayer_fee_per_hop: u64,
    /// Distinct relayers in the order they first forwarded the payload
    pub relayers: Vec<Pubkey>,
}

impl RelayMetadata {
    pub fn new(max_hops: u8, relayer_fee_per_hop: u64) -> Self {
        Self {
            hop_count: 0,
            max_hops,
            relayer_fee_per_hop,
            relayers: Vec::new(),
        }
    }

    pub fn hops_remaining(&self) -> u8 {
        self.max_hops.saturating_sub(self.hop_count)
    }

    /// Fees owed to the relayers actually recorded
    pub fn total_relayer_fees(&self) -> u64 {
        (self.relayers.len() as u64).saturating_mul(self.relayer_fee_per_hop)
    }
}

/// Signature collection over fixed message bytes
///
/// Implementors only store; verification and duplicate checks live in the aggregator.
pub trait Multisig: Clone {
    fn message_bytes(&self) -> &[u8];

    fn signatures(&self) -> &[SignatureEntry];

    /// Keys whose signatures are still missing
    fn required_signers(&self) -> &[Pubkey];

    /// Store a verified signature and drop its key from the required set
    fn accept_signature(&mut self, entry: SignatureEntry) -> Result<(), SignatureError>;

    fn has_signed(&self, public_key: &Pubkey) -> bool {
        self.signatures()
            .iter()
            .any(|entry| &entry.public_key == public_key)
    }
}

/// A transfer plus everything needed to relay, co-sign and submit it later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineTransactionPayload {
    pub id: Uuid,
    /// bincode `Transaction` carrying the signatures known so far
    pub serialized_tx: Vec<u8>,
    /// The signable message; never re-derived after creation
    pub message_bytes: Vec<u8>,
    /// `None` for transactions anchored to a recent blockhash
    pub nonce_account: Option<Pubkey>,
    pub fee_payer: Pubkey,
    pub recipient: Pubkey,
    pub amount: u64,
    /// Human-readable origin label
    pub sender: String,
    pub created_at: DateTime<Utc>,
    pub durable: bool,
    pub memo: Option<String>,
    pub signatures: Vec<SignatureEntry>,
    pub required_signers: Vec<Pubkey>,
    pub relay_metadata: RelayMetadata,
}

impl OfflineTransactionPayload {
    pub fn message(&self) -> Result<Message, SignatureError> {
        bincode::deserialize(&self.message_bytes)
            .map_err(|e| SignatureError::MalformedMessage(e.to_string()))
    }

    pub fn transaction(&self) -> TxResult<Transaction> {
        Ok(bincode::deserialize(&self.serialized_tx)?)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }

    pub fn to_bytes(&self) -> TxResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> TxResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Wrap in a broadcast `Transaction` packet
    pub fn to_packet(&self, sender: PeerId, ttl: u8) -> TxResult<Packet> {
        Ok(Packet::new(PacketType::Transaction, sender, self.to_bytes()?).with_ttl(ttl))
    }

    pub fn from_packet(packet: &Packet) -> TxResult<Self> {
        if packet.packet_type != PacketType::Transaction {
            return Err(TxError::InvalidPayload(format!(
                "expected a transaction packet, got {:?}",
                packet.packet_type
            )));
        }
        Self::from_bytes(&packet.payload)
    }

    /// Rebuild `serialized_tx` from the message and the collected signatures
    pub(crate) fn refresh_transaction(&mut self) -> Result<(), SignatureError> {
        let transaction = place_signatures(self.message()?, &self.signatures);
        self.serialized_tx = bincode::serialize(&transaction)
            .map_err(|e| SignatureError::MalformedMessage(e.to_string()))?;
        Ok(())
    }
}

impl Multisig for OfflineTransactionPayload {
    fn message_bytes(&self) -> &[u8] {
        &self.message_bytes
    }

    fn signatures(&self) -> &[SignatureEntry] {
        &self.signatures
    }

    fn required_signers(&self) -> &[Pubkey] {
        &self.required_signers
    }

    fn accept_signature(&mut self, entry: SignatureEntry) -> Result<(), SignatureError> {
        self.required_signers.retain(|key| key != &entry.public_key);
        self.signatures.push(entry);
        // serialized_tx must carry every accepted signature
        self.refresh_transaction()
    }
}

/// Co-signing state for an arbitrary message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartiallySignedTransaction {
    pub id: Uuid,
    pub message_bytes: Vec<u8>,
    pub signatures: Vec<SignatureEntry>,
    pub required_signers: Vec<Pubkey>,
}

impl PartiallySignedTransaction {
    /// Every signer of `message` starts out required
    pub fn new(message: &Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_bytes: message.serialize(),
            signatures: Vec::new(),
            required_signers: signer_keys(message).to_vec(),
        }
    }

    pub fn message(&self) -> Result<Message, SignatureError> {
        bincode::deserialize(&self.message_bytes)
            .map_err(|e| SignatureError::MalformedMessage(e.to_string()))
    }
}

impl Multisig for PartiallySignedTransaction {
    fn message_bytes(&self) -> &[u8] {
        &self.message_bytes
    }

    fn signatures(&self) -> &[SignatureEntry] {
        &self.signatures
    }

    fn required_signers(&self) -> &[Pubkey] {
        &self.required_signers
    }

    fn accept_signature(&mut self, entry: SignatureEntry) -> Result<(), SignatureError> {
        self.required_signers.retain(|key| key != &entry.public_key);
        self.signatures.push(entry);
        Ok(())
    }
}

/// A co-signer's signature sent back over the mesh to whoever holds the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedSignature {
    pub payload_id: Uuid,
    pub entry: SignatureEntry,
}

impl DetachedSignature {
    pub fn to_packet(&self, sender: PeerId, ttl: u8) -> TxResult<Packet> {
        Ok(Packet::new(PacketType::Signature, sender, bincode::serialize(self)?).with_ttl(ttl))
    }

    pub fn from_packet(packet: &Packet) -> TxResult<Self> {
        if packet.packet_type != PacketType::Signature {
            return Err(TxError::InvalidPayload(format!(
                "expected a signature packet, got {:?}",
                packet.packet_type
            )));
        }
        Ok(bincode::deserialize(&packet.payload)?)
    }
}

/// Keys that must sign `message`, in signature-slot order
pub fn signer_keys(message: &Message) -> &[Pubkey] {
    let required = usize::from(message.header.num_required_signatures).min(message.account_keys.len());
    &message.account_keys[..required]
}

/// Build a transaction with each known signature in its signer slot
pub(crate) fn place_signatures(message: Message, entries: &[SignatureEntry]) -> Transaction {
    let mut transaction = Transaction::new_unsigned(message);
    for entry in entries {
        if let Some(slot) = signer_keys(&transaction.message)
            .iter()
            .position(|key| key == &entry.public_key)
        {
            transaction.signatures[slot] = entry.signature;
        }
    }
    transaction
}
