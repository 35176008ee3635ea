use std::time::Duration;

use tokio::time::Instant;

/// A stopwatch over the monotonic clock.
///
/// Measures the latency of a single admitted operation. A timer is either
/// running (it holds the instant it was started at) or idle. Reading an
/// idle timer yields [Duration::ZERO] rather than an error, so callers
/// never need to track the timer's state separately.
#[derive(Debug, Default)]
pub struct Timer {
    start: Option<Instant>,
}

impl Timer {
    /// An idle timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A timer started at the current instant.
    pub fn started() -> Self {
        Self {
            start: Some(Instant::now()),
        }
    }

    /// Start the timer. Has no effect if it is already running.
    pub fn start(&mut self) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
    }

    /// Stop the timer, returning the elapsed duration and leaving the
    /// timer idle. Stopping an idle timer returns [Duration::ZERO].
    pub fn stop(&mut self) -> Duration {
        self.start
            .take()
            .map(|start| start.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// The duration elapsed since the timer was started, without stopping
    /// it. [Duration::ZERO] if the timer is idle.
    pub fn elapsed(&self) -> Duration {
        self.start
            .map(|start| start.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the timer is currently running.
    pub fn is_running(&self) -> bool {
        self.start.is_some()
    }
}
