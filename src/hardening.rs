use crate::types::{BridgeError, ObservedError, Result};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with ±25% jitter, for transient browser and network failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter_range = base / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base as i64 + jitter).max(1) as u64)
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && Self::is_retryable(&e) => {
                    let delay = self.delay_for(attempts);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        label,
                        attempts,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_retryable(err: &ObservedError) -> bool {
        matches!(
            &err.inner,
            BridgeError::Network(_)
                | BridgeError::WebSocket(_)
                | BridgeError::Io(_)
                | BridgeError::Browser(_)
        )
    }
}
