//! Exponential backoff with jitter, and a retrying [`TokenSolver`] decorator.
//!
//! # Retry Strategy
//!
//! The delay before retry `n` (1-based) is:
//! ```text
//! delay = min(base_delay * 2^(n-1), max_delay) + random_jitter(0..=250ms)
//! ```
//! Only transient failures (transport errors, timeouts) are retried; a
//! rejection or a missing key is returned at once.

use crate::error::CapabilityError;
use crate::models::ChallengeKind;
use crate::solver::token::TokenSolver;
use async_trait::async_trait;
use rand::{Rng, rng};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, instrument, warn};

/// Backoff schedule shared by every bounded retry loop in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl Backoff {
    pub fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_for(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(31) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt` (1-based), jitter included.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let jitter_cap = self.max_jitter.as_millis() as u64;
        let jitter_ms: u64 = if jitter_cap == 0 {
            0
        } else {
            rng().random_range(0..=jitter_cap)
        };
        self.base_for(attempt) + Duration::from_millis(jitter_ms)
    }
}

/// Wraps a [`TokenSolver`] and retries its transient failures.
pub struct RetryTokenSolver<T> {
    inner: T,
    backoff: Backoff,
}

impl<T> RetryTokenSolver<T> {
    pub fn new(inner: T, backoff: Backoff) -> Self {
        Self { inner, backoff }
    }
}

impl<T> fmt::Debug for RetryTokenSolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTokenSolver")
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[async_trait]
impl<T> TokenSolver for RetryTokenSolver<T>
where
    T: TokenSolver,
{
    #[instrument(level = "info", skip_all)]
    async fn solve(
        &self,
        site_key: &str,
        page_url: &str,
        kind: ChallengeKind,
    ) -> Result<String, CapabilityError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.solve(site_key, page_url, kind).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    attempt += 1;
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if !e.is_transient() || attempt > self.backoff.max_retries {
                        error!(
                            attempt,
                            max = self.backoff.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                            elapsed_ms_total = total_dt.as_millis() as u64,
                            error = %e,
                            "Token solve gave up"
                        );
                        return Err(e);
                    }

                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        attempt,
                        max = self.backoff.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                        ?delay,
                        error = %e,
                        "Token solve attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
