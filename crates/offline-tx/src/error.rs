//! Error types for offline transaction handling

use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use thiserror::Error;

/// Result type for offline transaction operations
pub type TxResult<T> = Result<T, TxError>;

/// Signature collection failures; the payload is left unchanged
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Invalid signature from {0}")]
    InvalidSignature(Pubkey),

    #[error("Signer {0} has already signed")]
    DuplicateSigner(Pubkey),

    #[error("Signer {0} is not required by this transaction")]
    SignerNotRequired(Pubkey),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Missing signatures from {0:?}")]
    MissingSignatures(Vec<Pubkey>),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

/// Problems with the nonce account a durable transaction depends on
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    #[error("Nonce account not found: {0}")]
    AccountNotFound(Pubkey),

    #[error("Account {0} is not a nonce account")]
    NotNonceAccount(Pubkey),

    #[error("Nonce account {0} is not initialized")]
    Uninitialized(Pubkey),

    #[error("Nonce account {account} is controlled by {current}, not {signed_by}")]
    AuthorityMismatch {
        account: Pubkey,
        signed_by: Pubkey,
        current: Pubkey,
    },

    #[error("Nonce account {account} has been advanced (signed against {expected}, now {current})")]
    Advanced {
        account: Pubkey,
        expected: Hash,
        current: Hash,
    },

    #[error("Nonce lookup failed: {0}")]
    Rpc(String),
}

/// Failures talking to the ledger
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transaction submission failed: {0}")]
    SubmitFailed(String),

    #[error("Transaction {0} is not confirmed")]
    NotConfirmed(Signature),

    #[error("Transaction {signature} failed: {reason}")]
    TransactionFailed { signature: Signature, reason: String },
}

/// Errors that can occur while building, relaying or submitting offline transactions
#[derive(Error, Debug)]
pub enum TxError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Nonce(#[from] NonceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Transfer amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Payload {0} is not a durable transaction")]
    NotDurable(uuid::Uuid),

    #[error("Relay limit reached: {max_hops} hops")]
    RelayLimitReached { max_hops: u8 },

    #[error("Outbox full: maximum {0} payloads")]
    OutboxFull(usize),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Mesh error: {0}")]
    Mesh(#[from] ble_mesh::MeshError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<bincode::Error> for TxError {
    fn from(err: bincode::Error) -> Self {
        TxError::Serialization(err.to_string())
    }
}

impl From<solana_sdk::signer::SignerError> for SignatureError {
    fn from(err: solana_sdk::signer::SignerError) -> Self {
        SignatureError::SigningFailed(err.to_string())
    }
}
