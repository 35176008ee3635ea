use std::{sync::Arc, time::Duration};

use tokio::time::{interval, Instant};

use super::{Completion, Shared};

/// How often the heads of the level queues are swept for expiry.
///
/// Short relative to typical task timeouts; tests rely only on eventual
/// reaping, not on this exact cadence.
const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Reap expired tasks until the queue is shut down and drained.
///
/// Each tick inspects only the head of each level, so a tick is
/// O(levels) unless multiple heads expired at once, in which case all of
/// them are reaped in the same tick.
pub(super) async fn run<T>(shared: Arc<Shared<T>>) {
    let mut ticks = interval(SWEEP_INTERVAL);

    loop {
        ticks.tick().await;

        let (expired, done) = {
            let mut st = shared.lock();
            let expired = st.take_expired(Instant::now());
            (expired, st.is_shutdown() && st.is_drained())
        };

        if !expired.is_empty() {
            tracing::trace!(reaped = expired.len(), "curator reaped expired tasks");
        }
        for queued in expired {
            queued.abandon(Completion::TimedOut);
        }

        if done {
            break;
        }
    }
}
