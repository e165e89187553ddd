//! Nonce accounts and the ledger collaborator interface

use crate::error::{LedgerError, NonceError};
use async_trait::async_trait;
use solana_sdk::hash::Hash;
use solana_sdk::nonce::state::{State, Versions};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;

/// Current state of an initialized on-chain nonce account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceAccount {
    pub address: Pubkey,
    /// Who may advance the nonce
    pub authority: Pubkey,
    /// Value a durable transaction uses in place of a recent blockhash
    pub nonce_value: Hash,
    pub lamports_per_signature: u64,
}

impl NonceAccount {
    /// Decode the system program's nonce account data
    pub fn from_account_data(address: Pubkey, data: &[u8]) -> Result<Self, NonceError> {
        let versions: Versions =
            bincode::deserialize(data).map_err(|_| NonceError::NotNonceAccount(address))?;

        match versions.state() {
            State::Uninitialized => Err(NonceError::Uninitialized(address)),
            State::Initialized(data) => Ok(Self {
                address,
                authority: data.authority,
                nonce_value: data.blockhash(),
                lamports_per_signature: data.get_lamports_per_signature(),
            }),
        }
    }
}

/// Everything this crate needs from the external ledger
#[async_trait]
pub trait NonceLedger: Send + Sync {
    async fn get_nonce_account(&self, address: &Pubkey) -> Result<NonceAccount, NonceError>;

    async fn latest_blockhash(&self) -> Result<Hash, LedgerError>;

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, LedgerError>;

    /// True once the transaction is confirmed without error
    async fn confirm_signature(&self, signature: &Signature) -> Result<bool, LedgerError>;

    /// Cheap liveness check used to decide between submitting and relaying
    async fn is_reachable(&self) -> bool;
}
