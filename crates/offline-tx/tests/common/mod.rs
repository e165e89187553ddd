//! In-memory ledger used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use offline_tx::{is_durable_message, LedgerError, NonceAccount, NonceError, NonceLedger};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Ledger that advances nonces on use and confirms what it accepts
pub struct MockLedger {
    nonces: Mutex<HashMap<Pubkey, NonceAccount>>,
    blockhash: Mutex<Hash>,
    submitted: Mutex<Vec<Transaction>>,
    confirmed: Mutex<HashSet<Signature>>,
    reachable: AtomicBool,
    auto_confirm: AtomicBool,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            nonces: Mutex::new(HashMap::new()),
            blockhash: Mutex::new(Hash::new_unique()),
            submitted: Mutex::new(Vec::new()),
            confirmed: Mutex::new(HashSet::new()),
            reachable: AtomicBool::new(true),
            auto_confirm: AtomicBool::new(true),
        }
    }

    /// Create an initialized nonce account controlled by `authority`
    pub fn add_nonce_account(&self, authority: Pubkey) -> Pubkey {
        let address = Pubkey::new_unique();
        self.nonces.lock().unwrap().insert(
            address,
            NonceAccount {
                address,
                authority,
                nonce_value: Hash::new_unique(),
                lamports_per_signature: 5000,
            },
        );
        address
    }

    /// Someone else used the nonce
    pub fn advance_nonce(&self, address: &Pubkey) {
        if let Some(account) = self.nonces.lock().unwrap().get_mut(address) {
            account.nonce_value = Hash::new_unique();
        }
    }

    /// Hand control of the nonce to another key
    pub fn set_authority(&self, address: &Pubkey, authority: Pubkey) {
        if let Some(account) = self.nonces.lock().unwrap().get_mut(address) {
            account.authority = authority;
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_auto_confirm(&self, confirm: bool) {
        self.auto_confirm.store(confirm, Ordering::SeqCst);
    }

    pub fn confirm(&self, signature: Signature) {
        self.confirmed.lock().unwrap().insert(signature);
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl NonceLedger for MockLedger {
    async fn get_nonce_account(&self, address: &Pubkey) -> Result<NonceAccount, NonceError> {
        self.nonces
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .ok_or(NonceError::AccountNotFound(*address))
    }

    async fn latest_blockhash(&self) -> Result<Hash, LedgerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(LedgerError::Rpc("unreachable".to_string()));
        }
        Ok(*self.blockhash.lock().unwrap())
    }

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, LedgerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(LedgerError::Rpc("unreachable".to_string()));
        }
        if transaction.verify().is_err() {
            return Err(LedgerError::SubmitFailed("signature verification failed".to_string()));
        }

        let mut nonces = self.nonces.lock().unwrap();
        let durable = nonces
            .values()
            .find(|nonce| is_durable_message(&transaction.message, nonce))
            .map(|nonce| nonce.address);

        match durable {
            Some(address) => {
                if let Some(account) = nonces.get_mut(&address) {
                    account.nonce_value = Hash::new_unique();
                }
            }
            None => {
                let anchored_to_nonce = nonces
                    .values()
                    .any(|nonce| transaction.message.account_keys.contains(&nonce.address));
                let current = *self.blockhash.lock().unwrap();
                if anchored_to_nonce || transaction.message.recent_blockhash != current {
                    return Err(LedgerError::SubmitFailed("blockhash not found".to_string()));
                }
            }
        }
        drop(nonces);

        let signature = transaction.signatures[0];
        self.submitted.lock().unwrap().push(transaction.clone());
        if self.auto_confirm.load(Ordering::SeqCst) {
            self.confirmed.lock().unwrap().insert(signature);
        }
        Ok(signature)
    }

    async fn confirm_signature(&self, signature: &Signature) -> Result<bool, LedgerError> {
        Ok(self.confirmed.lock().unwrap().contains(signature))
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
