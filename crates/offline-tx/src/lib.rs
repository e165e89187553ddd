//! Offline Solana transfers relayed over the BLE mesh
//!
//! Builds durable (nonce-anchored) transactions that never expire by time, collects
//! co-signer signatures, tracks relay hops for fee settlement, and submits payloads
//! once a node regains internet access.

pub mod aggregator;
pub mod durable;
pub mod error;
pub mod nonce;
pub mod outbox;
pub mod payload;
pub mod relay;
pub mod settlement;
pub mod submit;

// Re-export main types
pub use aggregator::{
    add_detached_signature, add_signature, assemble_transaction, is_fully_signed, merge_signatures,
    verify_all,
};
pub use durable::{
    is_durable_message, validate_against_nonce, DurableTransactionBuilder, DurableTransferRequest,
    TransferRequest,
};
pub use error::{LedgerError, NonceError, SignatureError, TxError, TxResult};
pub use nonce::{NonceAccount, NonceLedger};
pub use outbox::Outbox;
pub use payload::{
    DetachedSignature, Multisig, OfflineTransactionPayload, PartiallySignedTransaction,
    RelayMetadata, SignatureEntry,
};
pub use relay::{record_hop, should_relay, total_relayer_fees, MeshRelayForwarder};
pub use settlement::{settle_relayer_fees, RelayerPayout, SettlementPlan, SettlementReport};
pub use submit::{submit_payload, SubmissionOutcome};
