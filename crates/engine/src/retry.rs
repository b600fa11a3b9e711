//! Bounded exponential backoff around storage calls.

use crate::error::EngineResult;
use std::future::Future;
use std::time::Duration;

/// Delay before the first retry.
pub const BACKOFF_BASE_MS: u64 = 50;

/// Upper bound on any single delay.
pub const BACKOFF_CAP_MS: u64 = 2_000;

/// Attempts including the first one.
pub const MAX_ATTEMPTS: u32 = 5;

/// Retry schedule: `base * 2^n`, capped, for at most `max_attempts` calls.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(BACKOFF_BASE_MS),
            cap: Duration::from_millis(BACKOFF_CAP_MS),
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl Backoff {
    /// Delay after the given 1-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// runs out of attempts. The last error is returned.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// [`Backoff::retry`] with the default schedule.
pub async fn with_backoff<T, F, Fut>(what: &str, op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    Backoff::default().retry(what, op).await
}
