use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{sync::oneshot, time::timeout};

/// A counting semaphore whose permit ceiling can be resized while permits
/// are held.
///
/// Unlike [tokio::sync::Semaphore], reducing the ceiling requires no
/// acquire-and-forget workaround: the ceiling simply drops below the
/// number of running jobs and natural releases drain the excess. During
/// that window `running > concurrency` is allowed; no new permits are
/// granted until running falls back under the ceiling.
///
/// Waiters are granted permits strictly in enrollment order. Grants are
/// delivered over a channel, so a releaser never runs waiter code
/// synchronously inside [release](Semaphore::release).
pub struct Semaphore {
    state: Arc<Mutex<State>>,
}

struct State {
    concurrency: usize,
    running: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

/// A granted permit in flight to a waiter.
///
/// Accounted for in `running` from the moment it is created. If the waiter
/// is gone by the time the grant arrives (timed out or cancelled), the
/// unreceived grant is dropped by the channel and its `Drop` impl returns
/// the permit to the pool.
struct Grant {
    state: Arc<Mutex<State>>,
    armed: bool,
}

enum Enrolled {
    Acquired,
    Waiting(u64, oneshot::Receiver<Grant>),
}

impl Semaphore {
    /// A semaphore with the given permit ceiling.
    ///
    /// # Panics
    ///
    /// If `permits` is zero.
    pub fn new(permits: usize) -> Self {
        assert!(permits > 0, "concurrency must be at least 1");

        Self {
            state: Arc::new(Mutex::new(State {
                concurrency: permits,
                running: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            })),
        }
    }

    /// Take a permit if one is immediately available. Never suspends.
    ///
    /// When this returns `false` no state has changed.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.lock();
        if st.running < st.concurrency {
            st.running += 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, waiting until one is available.
    ///
    /// Returns `false` only if the semaphore is torn down while waiting.
    pub async fn acquire(&self) -> bool {
        match self.try_or_enroll() {
            Enrolled::Acquired => true,
            Enrolled::Waiting(_, rx) => match rx.await {
                Ok(grant) => {
                    grant.accept();
                    true
                }
                Err(_) => false,
            },
        }
    }

    /// Take a permit, waiting at most `duration` for one to free up.
    ///
    /// On timeout the waiter is removed from the wait list, wherever it
    /// sits, and `false` is returned. A grant racing with the timeout is
    /// returned to the pool.
    pub async fn acquire_timeout(&self, duration: Duration) -> bool {
        match self.try_or_enroll() {
            Enrolled::Acquired => true,
            Enrolled::Waiting(id, rx) => match timeout(duration, rx).await {
                Ok(Ok(grant)) => {
                    grant.accept();
                    true
                }
                Ok(Err(_)) => false,
                Err(_) => {
                    let mut st = self.lock();
                    if let Some(pos) = st.waiters.iter().position(|waiter| waiter.id == id) {
                        let _ = st.waiters.remove(pos);
                    }
                    // If the waiter is no longer enrolled, a grant won the
                    // race; dropping the receiver released it already.
                    false
                }
            },
        }
    }

    /// Return a held permit.
    ///
    /// Hands the permit to the head waiter if one exists and the ceiling
    /// allows it; after a resize down, permits are absorbed until
    /// `running` is back under the ceiling.
    pub fn release(&self) {
        let mut st = self.lock();
        debug_assert!(st.running > 0, "release without a held permit");
        st.running = st.running.saturating_sub(1);
        grant_waiters(&self.state, &mut st);
    }

    /// Change the permit ceiling.
    ///
    /// Increasing grants permits to head waiters until the wait list is
    /// empty or the new ceiling is reached. Decreasing touches no current
    /// holder.
    ///
    /// # Panics
    ///
    /// If `new_limit` is zero.
    pub fn resize(&self, new_limit: usize) {
        assert!(new_limit > 0, "concurrency must be at least 1");

        let mut st = self.lock();
        st.concurrency = new_limit;
        grant_waiters(&self.state, &mut st);
    }

    /// Permits still available under the current ceiling. Zero while a
    /// resize down is draining.
    pub fn available(&self) -> usize {
        let st = self.lock();
        st.concurrency.saturating_sub(st.running)
    }

    /// The current permit ceiling.
    pub fn limit(&self) -> usize {
        self.lock().concurrency
    }

    fn try_or_enroll(&self) -> Enrolled {
        let mut st = self.lock();
        if st.running < st.concurrency {
            st.running += 1;
            return Enrolled::Acquired;
        }

        let (tx, rx) = oneshot::channel();
        let id = st.next_waiter_id;
        st.next_waiter_id += 1;
        st.waiters.push_back(Waiter { id, tx });
        Enrolled::Waiting(id, rx)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("semaphore state lock poisoned")
    }
}

/// Hand permits to head waiters while the ceiling allows it.
///
/// Waiters whose receiving side is gone are skipped and their permits
/// taken back immediately.
fn grant_waiters(state: &Arc<Mutex<State>>, st: &mut State) {
    while st.running < st.concurrency {
        let Some(waiter) = st.waiters.pop_front() else {
            break;
        };
        st.running += 1;
        if let Err(grant) = waiter.tx.send(Grant::new(Arc::clone(state))) {
            grant.defuse();
            st.running -= 1;
        }
    }
}

impl Grant {
    fn new(state: Arc<Mutex<State>>) -> Self {
        Self { state, armed: true }
    }

    /// The waiter took the permit; accounting stands.
    fn accept(mut self) {
        self.armed = false;
    }

    /// Take the permit back without going through `Drop`. Used while the
    /// state lock is already held.
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        if self.armed {
            let state = Arc::clone(&self.state);
            let mut st = state.lock().expect("semaphore state lock poisoned");
            st.running = st.running.saturating_sub(1);
            grant_waiters(&state, &mut st);
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("Semaphore")
            .field("concurrency", &st.concurrency)
            .field("running", &st.running)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}
