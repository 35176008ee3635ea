use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::Outcome;

use super::{
    defaults::{DEFAULT_MAX_LIMIT, DEFAULT_MIN_LIMIT},
    LimitAlgorithm, Sample,
};

/// Failure-rate-based congestion avoidance.
///
/// Counts dropped jobs over a sliding window of samples. At each window
/// boundary the limit steps down by one if the window's failure count
/// reached the configured rate, and steps up by one otherwise, within
/// `[min, max]`.
///
/// Latency is not used by this variant, which makes it a good fit for
/// downstreams whose latency is noisy but whose load shedding is
/// explicit (e.g. 429/503 responses).
#[derive(Debug)]
pub struct Adaptive {
    min_limit: usize,
    max_limit: usize,
    /// Window length minus one; windows are power-of-two sized.
    window_mask: usize,
    /// Failures per window at which the limit steps down.
    failure_threshold: f64,

    limit: AtomicUsize,
    changed: watch::Sender<usize>,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Position within the current window.
    window: usize,
    /// Dropped jobs observed in the current window.
    failures: usize,
}

impl Adaptive {
    const DEFAULT_FAILURE_RATE: f64 = 0.05;
    const MAX_FAILURE_RATE: f64 = 0.99;

    /// An adaptive limit observing windows of `window_size` samples.
    ///
    /// `window_size` is rounded up to the next power of two.
    ///
    /// # Panics
    ///
    /// If `initial_limit` or `window_size` is zero.
    pub fn new_with_initial_limit(initial_limit: usize, window_size: usize) -> Self {
        assert!(initial_limit > 0);
        assert!(window_size > 0);

        let window = window_size.next_power_of_two();
        let (changed, _) = watch::channel(initial_limit);

        Self {
            min_limit: DEFAULT_MIN_LIMIT,
            max_limit: DEFAULT_MAX_LIMIT,
            window_mask: window - 1,
            failure_threshold: window as f64 * Self::DEFAULT_FAILURE_RATE,

            limit: AtomicUsize::new(initial_limit),
            changed,
            inner: Mutex::new(Inner {
                window: 0,
                failures: 0,
            }),
        }
    }

    /// The floor the limit will not step below.
    pub fn with_min_limit(self, min: usize) -> Self {
        assert!(min > 0);
        Self {
            min_limit: min,
            ..self
        }
    }

    /// The ceiling the limit will not step above.
    pub fn with_max_limit(self, max: usize) -> Self {
        assert!(max >= self.min_limit);
        Self {
            max_limit: max,
            ..self
        }
    }

    /// The fraction of a window which must be drops for the limit to step
    /// down. Capped at 0.99.
    pub fn with_failure_rate(self, rate: f64) -> Self {
        assert!(rate > 0.0 && rate.is_finite());

        let window = self.window_mask + 1;
        Self {
            failure_threshold: window as f64 * rate.min(Self::MAX_FAILURE_RATE),
            ..self
        }
    }
}

#[async_trait]
impl LimitAlgorithm for Adaptive {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.changed.subscribe()
    }

    async fn update(&self, sample: Sample) -> usize {
        let mut inner = self.inner.lock().await;

        inner.window = (inner.window + 1) & self.window_mask;
        if sample.outcome == Outcome::Dropped {
            inner.failures += 1;
        }

        if inner.window != 0 {
            return self.limit.load(Ordering::Acquire);
        }

        // One full window observed.
        let over_threshold = inner.failures as f64 >= self.failure_threshold;
        inner.failures = 0;

        let old_limit = self.limit.load(Ordering::Acquire);
        let new_limit = if over_threshold && old_limit > self.min_limit {
            old_limit - 1
        } else if !over_threshold && old_limit < self.max_limit {
            old_limit + 1
        } else {
            old_limit
        };

        if new_limit != old_limit {
            self.limit.store(new_limit, Ordering::Release);
            self.changed.send_replace(new_limit);
        }

        new_limit
    }
}
