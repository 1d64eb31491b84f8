//! Circuit Breaker
//!
//! ```text
//! +--------+  failure_threshold  +------+   recovery_timeout   +-----------+
//! | Closed | ------------------> | Open | -------------------> | Half-Open |
//! +--------+                     +------+                      +-----------+
//!     ^                              ^          1 failure            |
//!     |                              +-------------------------------+
//!     |                 half_open_success_threshold                  |
//!     +--------------------------------------------------------------+
//! ```
//!
//! - **Closed**: Normal operation, calls allowed
//! - **Open**: Calls rejected immediately until the recovery timeout has
//!   elapsed since the last recorded failure
//! - **Half-Open**: Probation; successes close the circuit, any failure
//!   reopens it
//!
//! Every transition resets both counters. Observers are notified outside the
//! state lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

// ============================================================================
// Circuit State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Circuit is closed (normal operation)
    #[default]
    Closed,

    /// Circuit is open (rejecting calls)
    Open,

    /// Circuit is half-open (testing recovery)
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name used in status reports
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker thresholds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time after the last failure before a trial call is admitted
    pub recovery_timeout: Duration,

    /// Successes in half-open state needed to close the circuit
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
        }
    }
}

// ============================================================================
// Breaker
// ============================================================================

/// Callback invoked with `(from, to)` on every state transition
pub type StateObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        self.state = to;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        (from != to).then_some((from, to))
    }

    fn remaining_open(&self, recovery_timeout: Duration) -> Duration {
        self.last_failure_at
            .map_or(Duration::ZERO, |at| recovery_timeout.saturating_sub(at.elapsed()))
    }
}

/// Three-state circuit breaker
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observer: Option<StateObserver>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
            observer: None,
        }
    }

    /// Attach a transition observer
    #[must_use]
    pub fn with_observer(
        mut self,
        observer: impl Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Thresholds in use
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Time left before an open circuit admits a trial call
    ///
    /// `None` unless the circuit is open.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        let state = self.state.lock();
        (state.state == CircuitState::Open)
            .then(|| state.remaining_open(self.config.recovery_timeout))
    }

    /// Ask permission to run a call
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// before the call is admitted.
    ///
    /// # Errors
    ///
    /// Returns the remaining open time if the call is rejected.
    pub fn admit(&self) -> Result<(), Duration> {
        let transition = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed | CircuitState::HalfOpen => return Ok(()),
                CircuitState::Open => {
                    let remaining = state.remaining_open(self.config.recovery_timeout);
                    if !remaining.is_zero() {
                        return Err(remaining);
                    }
                    state.transition(CircuitState::HalfOpen)
                }
            }
        };

        self.notify(transition);
        Ok(())
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let transition = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => {
                    state.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    state.half_open_successes += 1;
                    if state.half_open_successes >= self.config.half_open_success_threshold {
                        state.transition(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                // A call admitted before the circuit reopened; ignore
                CircuitState::Open => None,
            }
        };

        self.notify(transition);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let transition = {
            let mut state = self.state.lock();
            state.last_failure_at = Some(Instant::now());
            match state.state {
                CircuitState::Closed => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.failure_threshold {
                        state.transition(CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => state.transition(CircuitState::Open),
                CircuitState::Open => None,
            }
        };

        self.notify(transition);
    }

    /// Force the circuit closed
    pub fn reset(&self) {
        let transition = {
            let mut state = self.state.lock();
            state.last_failure_at = None;
            state.transition(CircuitState::Closed)
        };

        self.notify(transition);
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => tracing::warn!(
                from = %from,
                recovery_timeout_ms =
                    u64::try_from(self.config.recovery_timeout.as_millis()).unwrap_or(u64::MAX),
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(from = %from, "Circuit breaker transitioning to half-open");
            }
            CircuitState::Closed => tracing::info!(from = %from, "Circuit breaker closed"),
        }

        let Some(observer) = self.observer.clone() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { observer(from, to) });
            }
            Err(_) => observer(from, to),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

// ============================================================================
// Transition history
// ============================================================================

/// Count and time of the breaker transitions seen so far
///
/// Fed through [`CircuitHistory::observer`]; cloning shares the record.
#[derive(Clone, Debug, Default)]
pub struct CircuitHistory {
    inner: Arc<Mutex<HistoryState>>,
}

#[derive(Debug, Default)]
struct HistoryState {
    transitions: u64,
    last_change_ms: Option<i64>,
}

impl CircuitHistory {
    /// Empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transition happening now
    pub fn record(&self) {
        let mut inner = self.inner.lock();
        inner.transitions += 1;
        inner.last_change_ms = Some(chrono::Utc::now().timestamp_millis());
    }

    /// Number of transitions recorded
    #[must_use]
    pub fn transitions(&self) -> u64 {
        self.inner.lock().transitions
    }

    /// Unix milliseconds of the most recent transition
    #[must_use]
    pub fn last_change_ms(&self) -> Option<i64> {
        self.inner.lock().last_change_ms
    }

    /// Observer for [`CircuitBreaker::with_observer`] that records into this history
    #[must_use]
    pub fn observer(&self) -> impl Fn(CircuitState, CircuitState) + Send + Sync + 'static {
        let history = self.clone();
        move |_, _| history.record()
    }
}
