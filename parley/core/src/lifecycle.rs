//! Daemon lifecycle tasks
//!
//! - [`ActivityClock`]: daemon start and the last request
//! - [`watch_idle`]: cancels the root scope once the daemon has been idle for
//!   the configured timeout
//! - [`run_heartbeat`]: broadcasts a `heartbeat` envelope at a fixed period
//!
//! Both tasks return as soon as their cancellation token fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Envelope, HeartbeatPayload, MessageType};
use crate::transport::ConnectionRegistry;

/// Longest pause between two idle checks
pub const MAX_IDLE_CHECK_PERIOD: Duration = Duration::from_secs(30);

/// Tracks the time of the last inbound request
///
/// Cloning shares the same clock.
#[derive(Clone, Debug)]
pub struct ActivityClock {
    inner: Arc<ClockInner>,
}

#[derive(Debug)]
struct ClockInner {
    origin: Instant,
    /// Milliseconds after `origin`
    last_activity_ms: AtomicU64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    /// Start a clock; creation counts as activity
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                origin: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Record activity now
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.inner.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.inner
            .last_activity_ms
            .fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last activity
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.inner.last_activity_ms.load(Ordering::Relaxed));
        self.inner.origin.elapsed().saturating_sub(last)
    }

    /// Whole seconds since the last activity
    #[must_use]
    pub fn idle_seconds(&self) -> u64 {
        self.idle_for().as_secs()
    }

    /// Whole seconds since the clock was started
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.inner.origin.elapsed().as_secs()
    }
}

/// Cancel `root` once `clock` has been idle for `idle_timeout`
///
/// Checks every 30 s, or every `idle_timeout` if that is shorter. A zero
/// timeout disables the watcher.
pub async fn watch_idle(clock: ActivityClock, idle_timeout: Duration, root: CancellationToken) {
    if idle_timeout.is_zero() {
        tracing::debug!("Idle timeout disabled");
        return;
    }

    let period = idle_timeout.min(MAX_IDLE_CHECK_PERIOD);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = root.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let idle = clock.idle_for();
        if idle >= idle_timeout {
            tracing::info!(
                idle_secs = idle.as_secs(),
                timeout_secs = idle_timeout.as_secs(),
                "Idle timeout reached, shutting down"
            );
            root.cancel();
            return;
        }
    }
}

/// Broadcast `heartbeat {timestamp}` to every connection each `period`
pub async fn run_heartbeat(registry: ConnectionRegistry, period: Duration, cancel: CancellationToken) {
    if period.is_zero() {
        tracing::debug!("Heartbeat disabled");
        return;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let envelope = Envelope::new(
            MessageType::Heartbeat,
            &HeartbeatPayload {
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        );
        let result = registry.broadcast(&envelope);
        tracing::trace!(
            delivered = result.successful,
            dropped = result.failed,
            "Heartbeat sent"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionHandle, ConnectionId};
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_idle_watcher_cancels_root() {
        let clock = ActivityClock::new();
        let root = CancellationToken::new();
        let task = tokio::spawn(watch_idle(clock.clone(), Duration::from_secs(60), root.clone()));

        tokio::time::advance(Duration::from_secs(45)).await;
        clock.touch();
        tokio::time::advance(Duration::from_secs(45)).await;
        tokio::task::yield_now().await;
        assert!(!root.is_cancelled());

        tokio::time::advance(Duration::from_secs(60)).await;
        task.await.unwrap();
        assert!(root.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_watcher_stops_on_cancel() {
        let root = CancellationToken::new();
        let task = tokio::spawn(watch_idle(ActivityClock::new(), Duration::from_secs(3600), root.clone()));
        root.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_seconds() {
        let clock = ActivityClock::new();
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(clock.idle_seconds(), 7);
        clock.touch();
        assert_eq!(clock.idle_seconds(), 0);
        assert_eq!(clock.uptime_seconds(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_broadcasts() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(ConnectionHandle::new(ConnectionId::new(), tx, CancellationToken::new()));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_heartbeat(registry, Duration::from_secs(15), cancel.clone()));

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, MessageType::Heartbeat);
        let payload: HeartbeatPayload = envelope.payload_as().unwrap();
        assert!(payload.timestamp > 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
