//! Solana JSON-RPC implementation of the offline transaction ledger

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::retry::{retry_with_backoff_if, RetryConfig};
use async_trait::async_trait;
use offline_tx::{LedgerError, NonceAccount, NonceError, NonceLedger};
use shared::SolanaConfig;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_client::rpc_request::RpcError;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::system_program;
use solana_sdk::transaction::Transaction;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// JSON-RPC "node is unhealthy"; the node is catching up and may answer later
const NODE_UNHEALTHY: i64 = -32005;

#[derive(Debug, Error)]
pub enum RpcFailure {
    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Transport-level failures are worth another attempt; answers from the node are final
pub fn is_retryable(error: &ClientError) -> bool {
    match error.kind() {
        ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => true,
        ClientErrorKind::RpcError(RpcError::RpcRequestError(_)) => true,
        ClientErrorKind::RpcError(RpcError::RpcResponseError { code, .. }) => *code == NODE_UNHEALTHY,
        _ => false,
    }
}

pub struct SolanaLedger {
    rpc: RpcClient,
    commitment: CommitmentConfig,
    retry_config: RetryConfig,
    circuit_breaker: CircuitBreaker,
    confirm_timeout: Duration,
    confirm_poll_interval: Duration,
}

impl SolanaLedger {
    pub fn new(rpc_url: impl Into<String>, retry_config: RetryConfig) -> Self {
        let rpc_url = rpc_url.into();
        info!("Initializing Solana ledger client for {}", rpc_url);

        Self {
            rpc: RpcClient::new_with_commitment(rpc_url, CommitmentConfig::confirmed()),
            commitment: CommitmentConfig::confirmed(),
            retry_config,
            circuit_breaker: CircuitBreaker::new("solana-rpc", CircuitBreakerConfig::default()),
            confirm_timeout: Duration::from_secs(30),
            confirm_poll_interval: Duration::from_millis(500),
        }
    }

    pub fn from_config(config: &SolanaConfig) -> Self {
        Self::new(
            config.rpc_url.clone(),
            RetryConfig::with_max_attempts(config.max_retry_attempts),
        )
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = CircuitBreaker::new("solana-rpc", config);
        self
    }

    /// How long `confirm_signature` waits for a status before answering `false`
    pub fn with_confirmation(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.confirm_timeout = timeout;
        self.confirm_poll_interval = poll_interval;
        self
    }

    pub fn rpc_url(&self) -> String {
        self.rpc.url()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Run an RPC call behind the circuit breaker, retrying transient failures
    async fn call<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T, RpcFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        if !self.circuit_breaker.is_request_allowed().await {
            debug!("Skipping '{}': circuit breaker open", operation_name);
            return Err(RpcFailure::CircuitOpen(operation_name.to_string()));
        }

        let result =
            retry_with_backoff_if(operation_name, &self.retry_config, operation, is_retryable).await;

        // a final answer still proves the endpoint is up
        match &result {
            Err(e) if is_retryable(e) => self.circuit_breaker.record_failure().await,
            _ => self.circuit_breaker.record_success().await,
        }

        result.map_err(RpcFailure::from)
    }
}

#[async_trait]
impl NonceLedger for SolanaLedger {
    async fn get_nonce_account(&self, address: &Pubkey) -> Result<NonceAccount, NonceError> {
        let response = self
            .call("get_nonce_account", || {
                self.rpc.get_account_with_commitment(address, self.commitment)
            })
            .await
            .map_err(|e| NonceError::Rpc(e.to_string()))?;

        let account = response.value.ok_or(NonceError::AccountNotFound(*address))?;
        if account.owner != system_program::id() {
            return Err(NonceError::NotNonceAccount(*address));
        }

        let nonce = NonceAccount::from_account_data(*address, &account.data)?;
        debug!("Nonce account {} at {}", address, nonce.nonce_value);
        Ok(nonce)
    }

    async fn latest_blockhash(&self) -> Result<Hash, LedgerError> {
        self.call("get_latest_blockhash", || self.rpc.get_latest_blockhash())
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, LedgerError> {
        let config = RpcSendTransactionConfig {
            preflight_commitment: Some(self.commitment.commitment),
            ..RpcSendTransactionConfig::default()
        };

        let signature = self
            .call("send_transaction", || {
                self.rpc.send_transaction_with_config(transaction, config)
            })
            .await
            .map_err(|e| match &e {
                // rejected by the node; resending will not help
                RpcFailure::Client(client) if !is_retryable(client) => {
                    LedgerError::SubmitFailed(e.to_string())
                }
                _ => LedgerError::Rpc(e.to_string()),
            })?;

        info!("Transaction sent: {}", signature);
        Ok(signature)
    }

    async fn confirm_signature(&self, signature: &Signature) -> Result<bool, LedgerError> {
        let deadline = Instant::now() + self.confirm_timeout;

        loop {
            let status = self
                .call("get_signature_status", || {
                    self.rpc
                        .get_signature_status_with_commitment(signature, self.commitment)
                })
                .await
                .map_err(|e| LedgerError::Rpc(e.to_string()))?;

            match status {
                Some(Ok(())) => {
                    debug!("Transaction {} confirmed", signature);
                    return Ok(true);
                }
                Some(Err(e)) => {
                    warn!("Transaction {} failed: {}", signature, e);
                    return Err(LedgerError::TransactionFailed {
                        signature: *signature,
                        reason: e.to_string(),
                    });
                }
                None if Instant::now() >= deadline => {
                    debug!("Transaction {} not confirmed within {:?}", signature, self.confirm_timeout);
                    return Ok(false);
                }
                None => sleep(self.confirm_poll_interval).await,
            }
        }
    }

    async fn is_reachable(&self) -> bool {
        if !self.circuit_breaker.is_request_allowed().await {
            return false;
        }

        match self.rpc.get_health().await {
            Ok(()) => {
                self.circuit_breaker.record_success().await;
                true
            }
            Err(e) => {
                debug!("Solana RPC health check failed: {}", e);
                self.circuit_breaker.record_failure().await;
                false
            }
        }
    }
}
