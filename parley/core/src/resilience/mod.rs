//! Resilience
//!
//! Protects the daemon from flaky upstream providers:
//! - [`retry`]: exponential backoff with jitter, cancellable
//! - [`CircuitBreaker`]: fails fast while an upstream is known to be down
//! - [`ResilientExecutor`]: the breaker gating a full retry sequence

pub mod breaker;
pub mod executor;
pub mod retry;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitHistory, CircuitState, StateObserver,
};
pub use executor::{ExecuteError, ResilientExecutor};
pub use retry::{retry, RetryConfig, RetryError};
