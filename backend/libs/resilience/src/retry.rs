/// Retry policy with exponential backoff
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{operation} still failing after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last: E,
    },
}

/// Execute an operation until it succeeds or the retry budget is spent
pub async fn with_retry<F, Fut, T, E>(
    operation: &'static str,
    config: &RetryConfig,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    return Err(RetryError::Exhausted {
                        operation,
                        attempts: attempt,
                        last: e,
                    });
                }

                let backoff = config.backoff_for(attempt);
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    "retrying after {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
