mod operation;

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    limits::{LimitAlgorithm, Sample},
    semaphore::Semaphore,
};

pub use operation::LimitedOperation;

/// Whether a job succeeded or was dropped by the downstream resource.
///
/// Jobs whose result says nothing about downstream load (cancelled
/// upstream, bad request, ...) report neither: see
/// [LimitedOperation::ignore].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job completed normally.
    Success,
    /// The job failed or timed out because the downstream resource is
    /// overloaded.
    Dropped,
}

/// Gates operations on a downstream resource through a dynamically
/// adjusted concurrency limit.
///
/// Couples a [LimitAlgorithm] with a [Semaphore]: each admitted operation
/// holds one permit, and each reported outcome feeds the algorithm, whose
/// updated limit resizes the semaphore.
#[derive(Debug)]
pub struct Limiter<T> {
    limit_algo: T,
    semaphore: Semaphore,
    /// The limit currently applied to the semaphore.
    limit: AtomicUsize,
    in_flight: AtomicUsize,
}

impl<T> Limiter<T>
where
    T: LimitAlgorithm + Send + Sync,
{
    /// A limiter starting with `initial_permits` available.
    ///
    /// # Panics
    ///
    /// If `initial_permits` is zero.
    pub fn new(limit_algo: T, initial_permits: usize) -> Self {
        assert!(initial_permits > 0);

        Self {
            limit_algo,
            semaphore: Semaphore::new(initial_permits),
            limit: AtomicUsize::new(initial_permits),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Admit an operation if capacity is immediately available. Never
    /// suspends.
    pub fn try_acquire(&self) -> Option<LimitedOperation<'_, T>> {
        self.semaphore
            .try_acquire()
            .then(|| LimitedOperation::new(self))
    }

    /// Admit an operation, waiting for capacity if necessary.
    pub async fn acquire(&self) -> Option<LimitedOperation<'_, T>> {
        self.semaphore
            .acquire()
            .await
            .then(|| LimitedOperation::new(self))
    }

    /// Admit an operation, waiting at most `duration` for capacity.
    pub async fn acquire_timeout(&self, duration: Duration) -> Option<LimitedOperation<'_, T>> {
        self.semaphore
            .acquire_timeout(duration)
            .await
            .then(|| LimitedOperation::new(self))
    }

    /// The concurrency limit currently in effect.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Operations admitted and not yet finalized.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Feed a finished operation's sample to the algorithm and apply any
    /// resulting limit change. The operation has already released its
    /// permit.
    pub(crate) async fn record(&self, latency: Duration, in_flight: usize, outcome: Outcome) {
        let new_limit = self
            .limit_algo
            .update(Sample {
                latency,
                in_flight,
                outcome,
            })
            .await;

        let old_limit = self.limit.swap(new_limit, Ordering::SeqCst);
        if new_limit != old_limit {
            tracing::debug!(old_limit, new_limit, "limit changed, resizing semaphore");
            self.semaphore.resize(new_limit);
        }
    }

}
