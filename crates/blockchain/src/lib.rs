//! Solana RPC access for relay nodes

pub mod circuit_breaker;
pub mod ledger;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use ledger::{is_retryable, RpcFailure, SolanaLedger};
pub use retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};
