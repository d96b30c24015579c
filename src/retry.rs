//! Retry policy for unreliable external calls.
//!
//! Network and LLM calls share the same failure profile: transient errors
//! (timeouts, rate limits, 5xx) are worth retrying with exponential backoff,
//! everything else fails identically on every attempt. The policy is a plain
//! value so each adapter can carry its own schedule and tests can exercise
//! the schedule without real network calls.

use crate::error::{ResearchError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Maximum random jitter added to each backoff sleep
const JITTER_MS: u64 = 250;

/// Exponential-backoff retry schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Backoff delay before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    ///
    /// A `RateLimited` error stretches the backoff to at least the server's
    /// retry-after hint. The last error is returned unchanged once the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let mut delay = self.delay_for(attempt);
                    if let ResearchError::RateLimited(secs) = &err {
                        delay = delay.max(Duration::from_secs(*secs));
                    }
                    warn!(
                        what = what,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    let jitter = Duration::from_millis(rand::random::<u64>() % JITTER_MS);
                    tokio::time::sleep(delay + jitter).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
