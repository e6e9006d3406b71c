//! Bounded retry with exponential backoff and full jitter.
//!
//! Used for every suspending call in a reconciliation cycle: the board fetch,
//! the read-before-diff and each document write.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Transient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: std::env::var("RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0 && n <= 10)
                .unwrap_or(d.max_attempts),
            base_delay_ms: std::env::var("RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(d.base_delay_ms),
            max_delay_ms: std::env::var("RETRY_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(d.max_delay_ms),
        }
    }

    /// Upper bound of the delay after `attempt` failed: `min(max, base * 2^(attempt-1))`.
    pub fn backoff_cap_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        let exponential = self.base_delay_ms.saturating_mul(1u64 << exponent);
        exponential.min(self.max_delay_ms)
    }

    /// Full jitter: uniform in `[0, cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = self.backoff_cap_ms(attempt);
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..cap))
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. The last error is returned.
pub async fn retry_async<T, E, F, Fut>(policy: &RetryPolicy, op_name: &str, mut operation: F) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = op_name, attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => {
                debug!(op = op_name, attempt, "non-retryable error: {e}");
                return Err(e);
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!(op = op_name, attempts = attempt, "retries exhausted: {e}");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.backoff(attempt);
                debug!(op = op_name, attempt, delay_ms = delay.as_millis() as u64, "retrying after: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
