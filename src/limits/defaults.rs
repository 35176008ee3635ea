use std::sync::OnceLock;
use std::time::Duration;

pub(crate) const MIN_SAMPLE_LATENCY: Duration = Duration::from_micros(1);

pub(crate) const DEFAULT_MIN_LIMIT: usize = 1;
pub(crate) const DEFAULT_MAX_LIMIT: usize = 1000;

const LOG10_TABLE_SIZE: usize = 1001;

/// `log10(n)` lower-bounded at 1, memoized for small inputs.
///
/// The lower bound keeps log-scaled estimators from collapsing to zero
/// steps near a limit of 1.
pub(crate) fn log10_at_least_one(n: usize) -> f64 {
    static TABLE: OnceLock<Vec<f64>> = OnceLock::new();

    let table = TABLE.get_or_init(|| {
        (0..LOG10_TABLE_SIZE)
            .map(|n| (n.max(1) as f64).log10().max(1.0))
            .collect()
    });

    match table.get(n) {
        Some(&memoized) => memoized,
        None => (n as f64).log10().max(1.0),
    }
}
