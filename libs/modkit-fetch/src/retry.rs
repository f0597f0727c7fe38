//! Sequential retry of one call's attempts.
//!
//! An attempt failure is retried while budget remains: `retry = n` allows
//! `n + 1` attempts in total. Programming errors stop the loop immediately.
//! Attempts never overlap; the next one starts only after the previous one
//! has settled.

use crate::config::ExponentialBackoff;
use crate::error::FetchError;
use rand::Rng;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Drives attempts of one call until success, a non-retryable failure, or budget exhaustion.
#[derive(Debug, Clone)]
pub struct RetryController {
    retry: usize,
    backoff: Option<ExponentialBackoff>,
}

impl RetryController {
    #[must_use]
    pub fn new(retry: usize, backoff: Option<ExponentialBackoff>) -> Self {
        Self { retry, backoff }
    }

    /// Total number of attempts this controller may make.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.retry.saturating_add(1)
    }

    /// Run `attempt(n)` for `n = 0, 1, ..` until it settles for good.
    ///
    /// # Errors
    /// Returns the error of the last attempt made.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> Result<Value, FetchError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<Value, FetchError>>,
    {
        let mut n = 0;
        loop {
            match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => {
                    tracing::debug!(attempt = n, error = %err, "non-retryable failure");
                    return Err(err);
                }
                Err(err) if n >= self.retry => {
                    tracing::debug!(
                        attempts = n + 1,
                        error = %err,
                        "retry budget exhausted"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!(attempt = n, error = %err, "attempt failed; retrying");
                    if let Some(backoff) = &self.backoff {
                        tokio::time::sleep(calculate_backoff(backoff, n)).await;
                    }
                    n += 1;
                }
            }
        }
    }
}

/// Calculate backoff duration for a given retry attempt
///
/// Uses the formula: `min(initial * multiplier^attempt, max)` with optional jitter.
/// Non-finite or negative inputs fall back to safe values.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    // One day; anything longer is not a meaningful retry delay
    const MAX_BACKOFF_SECS: f64 = 86400.0;

    let attempt_i32 = i32::try_from(attempt).unwrap_or(i32::MAX);

    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };

    let initial_secs = backoff.initial.as_secs_f64();
    let max_secs = backoff.max.as_secs_f64().min(MAX_BACKOFF_SECS);

    let base = initial_secs * multiplier.powi(attempt_i32);
    let clamped = if base.is_finite() {
        base.min(max_secs).max(0.0)
    } else {
        max_secs
    };
    let duration = Duration::from_secs_f64(clamped);

    let duration = if backoff.jitter {
        let jitter_factor = rand::rng().random_range(0.0..=0.25);
        duration + duration.mul_f64(jitter_factor)
    } else {
        duration
    };

    duration.min(Duration::from_secs_f64(max_secs))
}
