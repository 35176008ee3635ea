use std::{
    fmt::Debug,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use conv::ConvUtil;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::sync::{watch, Mutex};

use crate::Outcome;

use super::{
    defaults::{log10_at_least_one, MIN_SAMPLE_LATENCY},
    LimitAlgorithm, Sample,
};

/// A queueing-level estimator, as a function of the current limit.
type Estimator = Box<dyn (Fn(usize) -> f64) + Send + Sync>;

/// Loss- and delay-based congestion avoidance.
///
/// Tracks the minimum observed RTT as the no-load baseline and estimates
/// the number of queued jobs from the latency in excess of it. Small
/// queues grow the limit, large queues and dropped jobs shrink it, with
/// the step sizes supplied by pluggable estimator functions (log-scaled
/// by default).
///
/// The baseline is re-calibrated by a periodic probe whose cadence is
/// jittered so that independent clients do not probe in lockstep.
///
/// Inspired by TCP Vegas.
///
/// - [TCP Vegas: End to End Congestion Avoidance on a Global
///   Internet](https://www.cs.princeton.edu/courses/archive/fall06/cos561/papers/vegas.pdf)
/// - [Understanding TCP Vegas: Theory and
///   Practice](https://www.cs.princeton.edu/research/techreps/TR-628-00)
pub struct Vegas {
    max_limit: usize,
    smoothing: f64,
    probe_multiplier: u32,

    /// Queueing below this grows the limit by `beta` in one step.
    threshold: Estimator,
    /// Lower queueing threshold.
    alpha: Estimator,
    /// Upper queueing threshold.
    beta: Estimator,
    /// Step applied for moderate queueing below `alpha`.
    increase: Estimator,
    /// Step applied for queueing above `beta`, or on a drop.
    decrease: Estimator,

    limit: AtomicUsize,
    changed: watch::Sender<usize>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// The minimum observed RTT in microseconds; zero until calibrated.
    ///
    /// This is the latency we would expect to see with no queueing.
    rtt_no_load: u64,
    /// Samples observed since the last probe.
    probe_count: u64,
    /// Probe cadence scaling, redrawn from `[0.5, 1.0)` at each probe.
    probe_jitter: f64,
    rng: SmallRng,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("rtt_no_load", &self.rtt_no_load)
            .field("probe_count", &self.probe_count)
            .field("probe_jitter", &self.probe_jitter)
            .finish()
    }
}

impl Vegas {
    const DEFAULT_MAX_LIMIT: usize = 512;
    const DEFAULT_PROBE_MULTIPLIER: u32 = 30;
    const DEFAULT_SMOOTHING: f64 = 1.0;

    const DEFAULT_ALPHA_MULTIPLIER: f64 = 3.0;
    const DEFAULT_BETA_MULTIPLIER: f64 = 6.0;

    /// A Vegas limit with default estimators and probe cadence.
    ///
    /// # Panics
    ///
    /// If `initial_limit` is zero.
    pub fn new_with_initial_limit(initial_limit: usize) -> Self {
        assert!(initial_limit > 0);

        let mut rng = SmallRng::from_entropy();
        let probe_jitter = rng.gen_range(0.5..1.0);
        let (changed, _) = watch::channel(initial_limit);

        Self {
            max_limit: Self::DEFAULT_MAX_LIMIT,
            smoothing: Self::DEFAULT_SMOOTHING,
            probe_multiplier: Self::DEFAULT_PROBE_MULTIPLIER,

            threshold: Box::new(log10_at_least_one),
            alpha: Box::new(|limit| Self::DEFAULT_ALPHA_MULTIPLIER * log10_at_least_one(limit)),
            beta: Box::new(|limit| Self::DEFAULT_BETA_MULTIPLIER * log10_at_least_one(limit)),
            increase: Box::new(|limit| limit as f64 + log10_at_least_one(limit)),
            decrease: Box::new(|limit| limit as f64 - log10_at_least_one(limit)),

            limit: AtomicUsize::new(initial_limit),
            changed,
            inner: Mutex::new(Inner {
                rtt_no_load: 0,
                probe_count: 0,
                probe_jitter,
                rng,
            }),
        }
    }

    /// The ceiling the estimate will not exceed.
    pub fn with_max_limit(self, max: usize) -> Self {
        assert!(max > 0);
        Self {
            max_limit: max,
            ..self
        }
    }

    /// Exponential smoothing factor applied to limit movements, in
    /// `(0, 1]`. 1 applies each new limit in full.
    pub fn with_smoothing(self, smoothing: f64) -> Self {
        assert!(
            smoothing > 0.0 && smoothing <= 1.0,
            "smoothing must be in (0, 1]"
        );
        Self { smoothing, ..self }
    }

    /// Scales how many samples pass between baseline probes.
    pub fn with_probe_multiplier(self, multiplier: u32) -> Self {
        assert!(multiplier >= 1);
        Self {
            probe_multiplier: multiplier,
            ..self
        }
    }

    /// The lower queueing threshold, below which the limit increases.
    pub fn with_alpha(self, alpha: impl Fn(usize) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            alpha: Box::new(alpha),
            ..self
        }
    }

    /// The upper queueing threshold, above which the limit decreases.
    pub fn with_beta(self, beta: impl Fn(usize) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            beta: Box::new(beta),
            ..self
        }
    }

    /// The near-zero queueing threshold, below which the limit grows by
    /// `beta` in one step.
    pub fn with_threshold(self, threshold: impl Fn(usize) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            threshold: Box::new(threshold),
            ..self
        }
    }

    /// The limit applied on moderate queueing below `alpha`.
    pub fn with_increase(self, increase: impl Fn(usize) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            increase: Box::new(increase),
            ..self
        }
    }

    /// The limit applied on queueing above `beta` or on a drop.
    pub fn with_decrease(self, decrease: impl Fn(usize) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            decrease: Box::new(decrease),
            ..self
        }
    }
}

#[async_trait]
impl LimitAlgorithm for Vegas {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.changed.subscribe()
    }

    async fn update(&self, sample: Sample) -> usize {
        if sample.latency < MIN_SAMPLE_LATENCY {
            return self.limit.load(Ordering::Acquire);
        }

        let rtt = u64::try_from(sample.latency.as_micros()).unwrap_or(u64::MAX);

        let mut inner = self.inner.lock().await;
        let estimated = self.limit.load(Ordering::Acquire);

        inner.probe_count += 1;
        if estimated as f64 * inner.probe_jitter * f64::from(self.probe_multiplier)
            <= inner.probe_count as f64
        {
            // Re-calibrate: the previous baseline may predate a routing
            // or capacity change downstream.
            inner.probe_jitter = inner.rng.gen_range(0.5..1.0);
            inner.probe_count = 0;
            inner.rtt_no_load = rtt;
            return estimated;
        }

        if inner.rtt_no_load == 0 || rtt < inner.rtt_no_load {
            inner.rtt_no_load = rtt;
            return estimated;
        }

        // Estimated queue size, from the latency in excess of the
        // baseline.
        let queued = (estimated as f64 * (1.0 - inner.rtt_no_load as f64 / rtt as f64)).ceil();

        let new_limit = if sample.outcome == Outcome::Dropped {
            (self.decrease)(estimated)
        } else if sample.in_flight * 2 <= estimated {
            // Not enough load to learn anything.
            return estimated;
        } else {
            let threshold = (self.threshold)(estimated);
            let alpha = (self.alpha)(estimated);
            let beta = (self.beta)(estimated);

            if queued <= threshold {
                estimated as f64 + beta
            } else if queued < alpha {
                (self.increase)(estimated)
            } else if queued > beta {
                (self.decrease)(estimated)
            } else {
                return estimated;
            }
        };

        let clamped = new_limit.clamp(1.0, self.max_limit as f64);
        let smoothed =
            ((1.0 - self.smoothing) * estimated as f64 + self.smoothing * clamped).floor();
        let new_limit = smoothed
            .approx_as::<usize>()
            .expect("smoothed limit is clamped within usize range");

        if new_limit != estimated {
            self.limit.store(new_limit, Ordering::Release);
            self.changed.send_replace(new_limit);
        }

        new_limit
    }
}

impl Debug for Vegas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vegas")
            .field("limit", &self.limit)
            .field("max_limit", &self.max_limit)
            .field("smoothing", &self.smoothing)
            .field("probe_multiplier", &self.probe_multiplier)
            .field("alpha(10)", &(self.alpha)(10))
            .field("beta(10)", &(self.beta)(10))
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sample(latency_us: u64, in_flight: usize, outcome: Outcome) -> Sample {
        Sample {
            latency: Duration::from_micros(latency_us),
            in_flight,
            outcome,
        }
    }

    #[tokio::test]
    async fn probing_leaves_the_limit_alone() {
        let vegas = Vegas::new_with_initial_limit(10);
        let changes = vegas.subscribe();

        // Identical samples at half utilisation: the first calibrates the
        // baseline, the rest carry no congestion signal. The probe
        // barrier fires at least once along the way (cadence is at most
        // 10 * 1.0 * 30 samples) and re-calibrates to the same baseline.
        for _ in 0..301 {
            vegas
                .update(sample(1_000, 5, Outcome::Success))
                .await;
        }

        assert_eq!(vegas.limit(), 10);
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn grows_when_queueing_is_low_under_load() {
        let vegas = Vegas::new_with_initial_limit(10);

        vegas.update(sample(500, 8, Outcome::Success)).await;

        // Latency at the baseline, high utilisation: near-zero queueing
        // grows the limit by beta in one step.
        let limit = vegas.update(sample(500, 8, Outcome::Success)).await;
        assert_eq!(limit, 16);
        assert_eq!(vegas.limit(), 16);
    }

    #[tokio::test]
    async fn shrinks_on_a_drop() {
        let vegas = Vegas::new_with_initial_limit(100);

        vegas.update(sample(500, 60, Outcome::Success)).await;

        let limit = vegas.update(sample(500, 60, Outcome::Dropped)).await;
        assert_eq!(limit, 98, "decrease by log10(100)");
    }

    #[tokio::test]
    async fn stable_when_underutilised() {
        let vegas = Vegas::new_with_initial_limit(10);
        let changes = vegas.subscribe();

        vegas.update(sample(500, 2, Outcome::Success)).await;

        // Latency keeps climbing but with so few jobs in flight there is
        // nothing to learn.
        for latency in [600, 900, 5_000, 20_000] {
            let limit = vegas.update(sample(latency, 2, Outcome::Success)).await;
            assert_eq!(limit, 10);
        }
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn clamps_at_the_ceiling() {
        let vegas = Vegas::new_with_initial_limit(16).with_max_limit(16);
        let changes = vegas.subscribe();

        vegas.update(sample(500, 9, Outcome::Success)).await;

        let limit = vegas.update(sample(500, 9, Outcome::Success)).await;
        assert_eq!(limit, 16, "already at the ceiling");
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn custom_estimators_drive_the_steps() {
        let vegas = Vegas::new_with_initial_limit(10).with_increase(|_| 42.0);

        vegas.update(sample(500, 8, Outcome::Success)).await;

        // 600us against a 500us baseline queues ~2 jobs: between the
        // threshold (1) and alpha (3), so the increase estimator applies.
        let limit = vegas.update(sample(600, 8, Outcome::Success)).await;
        assert_eq!(limit, 42);
    }

    #[tokio::test]
    async fn smoothing_damps_the_step() {
        let vegas = Vegas::new_with_initial_limit(10).with_smoothing(0.5);

        vegas.update(sample(500, 8, Outcome::Success)).await;

        // The raw step is 10 + beta = 16; half-smoothing lands on 13.
        let limit = vegas.update(sample(500, 8, Outcome::Success)).await;
        assert_eq!(limit, 13);
    }

    #[tokio::test]
    async fn sub_microsecond_samples_are_discarded() {
        let vegas = Vegas::new_with_initial_limit(10);
        let changes = vegas.subscribe();

        let limit = vegas.update(sample(0, 8, Outcome::Success)).await;

        assert_eq!(limit, 10);
        assert!(!changes.has_changed().unwrap());
    }
}
