//! Algorithms for controlling concurrency limits.

mod adaptive;
mod defaults;
mod fixed;
mod vegas;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

use crate::Outcome;

pub use adaptive::Adaptive;
pub use fixed::Fixed;
pub use vegas::Vegas;

/// An algorithm for controlling a concurrency limit.
#[async_trait]
pub trait LimitAlgorithm {
    /// The current limit.
    fn limit(&self) -> usize;

    /// Subscribe to limit changes.
    ///
    /// Every change carries the new absolute limit, so a subscriber which
    /// misses an intermediate value is still left in a consistent state
    /// by the next one. Changes are observed in the order they occurred.
    fn subscribe(&self) -> watch::Receiver<usize>;

    /// Update the concurrency limit in response to a job completion.
    ///
    /// Returns the limit now in effect.
    async fn update(&self, sample: Sample) -> usize;
}

/// The result of a job, including the [Outcome] (loss) and latency (delay).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub(crate) latency: Duration,
    /// Jobs in flight when the sample was taken.
    pub(crate) in_flight: usize,
    pub(crate) outcome: Outcome,
}
