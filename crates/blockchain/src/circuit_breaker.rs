//! Circuit breaker guarding the RPC endpoint
//!
//! While open, calls fail fast so a node that has lost internet access stops
//! waiting on timeouts and keeps relaying over the mesh instead.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the cool-down elapses
    Open,
    /// Probing whether the endpoint recovered
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Successes in half-open state before closing
    pub success_threshold: u32,
    /// Time to wait before transitioning from open to half-open
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: CircuitBreakerConfig,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            "Initializing circuit breaker '{}' with failure_threshold={}, success_threshold={}, timeout={:?}",
            name, config.failure_threshold, config.success_threshold, config.timeout
        );

        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
            config,
            name,
        }
    }

    /// Whether a request may go out now; moves Open to HalfOpen once the cool-down elapsed
    pub async fn is_request_allowed(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.timeout);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    info!("Circuit breaker '{}': Transitioned to HALF_OPEN state", self.name);
                }
                cooled
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                debug!(
                    "Circuit breaker '{}': Success in half-open state ({}/{})",
                    self.name, inner.successes, self.config.success_threshold
                );
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    info!("Circuit breaker '{}': Transitioned to CLOSED state", self.name);
                }
            }
            CircuitState::Open => {
                warn!("Circuit breaker '{}': Success recorded in open state", self.name);
            }
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                debug!(
                    "Circuit breaker '{}': Failure recorded ({}/{})",
                    self.name, inner.failures, self.config.failure_threshold
                );
                if inner.failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            // one failure while probing is enough
            CircuitState::HalfOpen => self.open(&mut inner),
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.successes = 0;
        warn!("Circuit breaker '{}': Transitioned to OPEN state", self.name);
    }
}
