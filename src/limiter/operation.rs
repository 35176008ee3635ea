use std::{sync::atomic::Ordering, time::Duration};

use crate::{limits::LimitAlgorithm, timing::Timer};

use super::{Limiter, Outcome};

/// A single admitted operation.
///
/// Holds one semaphore permit and a timer started at admission. Report
/// the result with exactly one of [success](Self::success),
/// [dropped](Self::dropped) or [ignore](Self::ignore); each consumes the
/// operation, so reporting twice does not compile.
///
/// An operation dropped without being finalized releases its permit but
/// feeds nothing back to the limit algorithm, so a panicking job cannot
/// leak capacity or skew the limit.
#[derive(Debug)]
pub struct LimitedOperation<'l, T> {
    limiter: &'l Limiter<T>,
    timer: Timer,
    in_flight_at_acquire: usize,
    finished: bool,
}

impl<'l, T> LimitedOperation<'l, T>
where
    T: LimitAlgorithm + Send + Sync,
{
    pub(super) fn new(limiter: &'l Limiter<T>) -> Self {
        let in_flight = limiter.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            limiter,
            timer: Timer::started(),
            in_flight_at_acquire: in_flight,
            finished: false,
        }
    }

    /// Operations in flight when this one was admitted, itself included.
    pub fn in_flight_at_acquire(&self) -> usize {
        self.in_flight_at_acquire
    }

    /// Time since this operation was admitted.
    pub fn elapsed(&self) -> Duration {
        self.timer.elapsed()
    }

    /// The operation completed normally.
    pub async fn success(mut self) {
        let latency = self.release();
        self.limiter
            .record(latency, self.in_flight_at_acquire, Outcome::Success)
            .await;
    }

    /// The operation was dropped by the downstream resource.
    pub async fn dropped(mut self) {
        let latency = self.release();
        self.limiter
            .record(latency, self.in_flight_at_acquire, Outcome::Dropped)
            .await;
    }

    /// The operation's result says nothing about downstream load; release
    /// capacity without feeding the algorithm.
    pub async fn ignore(mut self) {
        self.release();
    }

    /// Settle accounting and return the permit. Called at most once.
    fn release(&mut self) -> Duration {
        let latency = self.timer.stop();
        self.finished = true;
        self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.limiter.semaphore.release();
        latency
    }
}

impl<T> Drop for LimitedOperation<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.limiter.semaphore.release();
        }
    }
}
