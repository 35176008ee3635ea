//! Adaptive admission control for protecting downstream resources.
//!
//! A [Limiter] gates operations through a dynamically adjusted concurrency
//! limit, fed back from observed latencies and load-based errors by a
//! pluggable [limits::LimitAlgorithm]. Work which cannot be admitted
//! immediately can be parked in a [MultiLevelPriorityQueue] and dispatched
//! later by queue workers, with per-task timeouts enforced by a background
//! curator.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

mod limiter;
pub mod limits;
mod queue;
mod semaphore;
mod timing;

pub use limiter::{LimitedOperation, Limiter, Outcome};
pub use queue::{
    create_queue_worker, Completion, JobHandle, MultiLevelPriorityQueue, Priority, QueueError,
};
pub use semaphore::Semaphore;
pub use timing::Timer;
