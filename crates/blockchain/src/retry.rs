use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Defaults with a different attempt budget; at least one attempt is always made
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64)
            * self.backoff_multiplier.powi(attempt as i32);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }
}

/// Execute an operation with retry logic and exponential backoff
///
/// Every error is treated as transient.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(operation_name, config, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up at once on errors `is_retryable` rejects
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        debug!(
            "Executing '{}' - attempt {}/{}",
            operation_name,
            attempt + 1,
            max_attempts
        );

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        "'{}' succeeded on attempt {}/{}",
                        operation_name,
                        attempt + 1,
                        max_attempts
                    );
                }
                return Ok(result);
            }
            Err(e) if !is_retryable(&e) => {
                debug!("'{}' failed permanently: {}", operation_name, e);
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "'{}' failed on attempt {}/{}: {}",
                    operation_name,
                    attempt + 1,
                    max_attempts,
                    e
                );

                if attempt + 1 >= max_attempts {
                    return Err(e);
                }

                let delay = config.calculate_delay(attempt);
                debug!(
                    "Retrying '{}' after {:?} (exponential backoff)",
                    operation_name, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
