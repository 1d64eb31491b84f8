//! Retry with exponential backoff

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry configuration for failed operations
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries (total attempts = `max_retries + 1`)
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f64,

    /// Random spread applied to each delay, as a fraction of it (0.1 = ±10%)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the retry count
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial and maximum delay
    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Set the backoff multiplier
    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the jitter fraction
    #[must_use]
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter;
        self
    }

    /// Apply jitter to a delay
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        let base = delay.as_secs_f64();
        let spread = base * self.jitter_factor;
        if spread <= 0.0 || !spread.is_finite() {
            return delay;
        }

        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::try_from_secs_f64((base + offset).max(0.0)).unwrap_or(delay)
    }

    /// Delay that follows `delay` in the backoff sequence
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ============================================================================
// Retry Loop
// ============================================================================

/// Why a retry sequence gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// The last attempt failed and no further attempt was allowed
    #[error("failed after {attempts} attempt(s): {error}")]
    Failed {
        /// Error of the last attempt
        error: E,
        /// Number of attempts made
        attempts: u32,
    },
}

/// Run `operation` until it succeeds, a non-retryable error occurs, retries
/// are exhausted or `cancel` fires
///
/// `operation` receives the zero-based attempt index. Cancellation during a
/// backoff wait wins over the previous attempt's error.
///
/// # Errors
///
/// Returns `RetryError::Cancelled` on cancellation and `RetryError::Failed`
/// with the last error otherwise.
pub async fn retry<T, E, F, Fut, P>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let attempts = attempt + 1;

        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        if !is_retryable(&error) || attempt >= config.max_retries {
            return Err(RetryError::Failed { error, attempts });
        }

        let backoff = config.jittered(delay);
        tracing::warn!(
            attempt = attempts,
            max_attempts = config.max_retries + 1,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Attempt failed, backing off"
        );

        tokio::select! {
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = tokio::time::sleep(backoff) => {}
        }

        delay = config.next_delay(delay);
        attempt += 1;
    }
}
