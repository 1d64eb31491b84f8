//! Retry sequence gated by a circuit breaker
//!
//! One full retry sequence counts as a single success or failure for the
//! breaker. An open circuit rejects the call before the first attempt.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::retry::{retry, RetryConfig, RetryError};

/// Why an executed operation did not produce a value
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    /// The circuit is open; nothing was attempted
    #[error("circuit open, retry after {}s", retry_after.as_secs())]
    CircuitOpen {
        /// Time until a trial call is admitted
        retry_after: Duration,
    },

    /// Cancellation fired before or between attempts
    #[error("operation cancelled")]
    Cancelled,

    /// Every allowed attempt failed
    #[error("failed after {attempts} attempt(s): {error}")]
    Failed {
        /// Error of the last attempt
        error: E,
        /// Number of attempts made
        attempts: u32,
    },
}

/// Retry-with-backoff plus circuit breaker
#[derive(Debug)]
pub struct ResilientExecutor {
    retry: RetryConfig,
    breaker: Arc<CircuitBreaker>,
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default(), CircuitBreakerConfig::default())
    }
}

impl ResilientExecutor {
    /// Create an executor with its own breaker
    #[must_use]
    pub fn new(retry: RetryConfig, breaker: CircuitBreakerConfig) -> Self {
        Self::with_breaker(retry, Arc::new(CircuitBreaker::new(breaker)))
    }

    /// Create an executor around an existing breaker
    #[must_use]
    pub fn with_breaker(retry: RetryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self { retry, breaker }
    }

    /// The breaker guarding this executor
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Current breaker state
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Retry settings
    #[must_use]
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `operation` through the breaker and the retry loop
    ///
    /// Cancellation is not recorded against the breaker.
    ///
    /// # Errors
    ///
    /// See [`ExecuteError`].
    pub async fn execute<T, E, F, Fut, P>(
        &self,
        cancel: &CancellationToken,
        is_retryable: P,
        operation: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        if let Err(retry_after) = self.breaker.admit() {
            tracing::debug!(
                retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                "Call rejected by open circuit"
            );
            return Err(ExecuteError::CircuitOpen { retry_after });
        }

        match retry(&self.retry, cancel, is_retryable, operation).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(RetryError::Cancelled) => Err(ExecuteError::Cancelled),
            Err(RetryError::Failed { error, attempts }) => {
                self.breaker.record_failure();
                Err(ExecuteError::Failed { error, attempts })
            }
        }
    }
}
