mod curator;
mod task;
mod worker;

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{oneshot, Notify},
    task::JoinHandle,
    time::Instant,
};

use task::QueuedTask;

pub use worker::create_queue_worker;

/// Dispatch priority of a queued task.
///
/// Levels form a total order: at dispatch time a queued task always loses
/// to any queued task of a higher level, regardless of age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Dispatched only when nothing else is queued.
    Low,
    /// Below-normal dispatch priority.
    Medium,
    /// Above-normal dispatch priority.
    High,
    /// Dispatched before everything else.
    Critical,
}

impl Priority {
    const LEVELS: usize = 4;

    fn index(self) -> usize {
        self as usize
    }
}

/// Errors from queue operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been shut down and accepts no further tasks.
    #[error("queue is shut down")]
    Shutdown,
}

/// How an enqueued task's lifecycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The task was dispatched and ran.
    Completed,
    /// The task expired before dispatch; its cancel callback has fired.
    TimedOut,
    /// The queue shut down (or the dispatcher was torn down) before the
    /// task ran; its cancel callback has fired if it was still queued.
    Cancelled,
}

/// The enqueuer's completion signal for a single task.
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<Completion>,
}

impl JobHandle {
    /// Wait until the task completes, times out, or is cancelled.
    pub async fn wait(self) -> Completion {
        self.rx.await.unwrap_or(Completion::Cancelled)
    }
}

/// A priority-ordered task queue with per-task timeouts.
///
/// Tasks are dispatched strictly by level, FIFO within a level. Each task
/// carries a timeout measured from enqueue: tasks not dispatched in time
/// are reaped by a background curator, which fires their cancel callback
/// and resolves their handle [Completion::TimedOut]. Timeouts gate
/// dispatch only; a task which has started running is never interrupted.
///
/// Dispatch happens through [next](Self::next), usually driven by one or
/// more [workers](create_queue_worker).
pub struct MultiLevelPriorityQueue<T> {
    shared: Arc<Shared<T>>,
    curator: JoinHandle<()>,
}

pub(super) struct Shared<T> {
    state: Mutex<QueueState<T>>,
    /// Woken on enqueue and shutdown.
    arrivals: Notify,
}

pub(super) struct QueueState<T> {
    levels: [VecDeque<QueuedTask<T>>; Priority::LEVELS],
    shutdown: bool,
}

enum Step<T> {
    Run(QueuedTask<T>),
    Drained,
    Wait,
}

impl<T> MultiLevelPriorityQueue<T>
where
    T: Send + 'static,
{
    /// An empty queue with a running curator.
    ///
    /// Must be called within a Tokio runtime, which the curator task is
    /// spawned onto.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                levels: std::array::from_fn(|_| VecDeque::new()),
                shutdown: false,
            }),
            arrivals: Notify::new(),
        });

        let curator = tokio::spawn(curator::run(Arc::clone(&shared)));

        Self { shared, curator }
    }

    /// Park a task for later dispatch.
    ///
    /// The job future is not polled until a dispatcher picks the task up;
    /// its arguments are whatever it captured at enqueue time. If the
    /// task is still queued when `timeout` has elapsed, `on_cancel` fires
    /// and the job future is dropped unpolled.
    pub fn enqueue<F, C>(
        &self,
        priority: Priority,
        timeout: Duration,
        job: F,
        on_cancel: C,
    ) -> Result<JobHandle, QueueError>
    where
        F: Future<Output = T> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        {
            let mut st = self.shared.lock();
            if st.shutdown {
                return Err(QueueError::Shutdown);
            }
            st.levels[priority.index()].push_back(QueuedTask::new(
                Box::pin(job),
                priority,
                timeout,
                Box::new(on_cancel),
                tx,
            ));
        }
        self.shared.arrivals.notify_one();

        Ok(JobHandle { rx })
    }

    /// Dispatch the highest-priority task which has not expired,
    /// returning its result.
    ///
    /// Expired heads encountered on the way are reaped exactly as the
    /// curator would reap them. When every level is empty this suspends
    /// until a task arrives; once the queue is shut down and drained it
    /// returns `None`.
    pub async fn next(&self) -> Option<T> {
        loop {
            // Arm the arrival listener before checking state, so an
            // enqueue between the check and the await cannot be missed.
            let notified = self.shared.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (expired, step) = {
                let mut st = self.shared.lock();
                let expired = st.take_expired(Instant::now());
                let step = match st.pop_highest() {
                    Some(queued) => Step::Run(queued),
                    None if st.shutdown => Step::Drained,
                    None => Step::Wait,
                };
                (expired, step)
            };

            for queued in expired {
                tracing::trace!(priority = ?queued.priority, "expired task reaped at dispatch");
                queued.abandon(Completion::TimedOut);
            }

            match step {
                Step::Run(mut queued) => {
                    let value = queued.future.as_mut().await;
                    queued.complete();
                    return Some(value);
                }
                Step::Drained => return None,
                Step::Wait => notified.await,
            }
        }
    }

    /// Shut down the queue.
    ///
    /// Rejects further enqueues, drains every queued task (firing its
    /// cancel callback and resolving its handle
    /// [Completion::Cancelled]), and wakes all pending [next](Self::next)
    /// callers. Tasks already dispatched run to completion. Idempotent.
    pub fn shutdown(&self) {
        let drained = {
            let mut st = self.shared.lock();
            st.shutdown = true;
            let mut drained = Vec::new();
            for level in &mut st.levels {
                drained.extend(level.drain(..));
            }
            drained
        };

        let count = drained.len();
        for queued in drained {
            queued.abandon(Completion::Cancelled);
        }
        self.shared.arrivals.notify_waiters();

        tracing::debug!(drained = count, "queue shut down");
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Tasks currently queued across all levels.
    pub fn len(&self) -> usize {
        self.shared.lock().levels.iter().map(VecDeque::len).sum()
    }

    /// Whether no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for MultiLevelPriorityQueue<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MultiLevelPriorityQueue<T> {
    fn drop(&mut self) {
        // The curator owns a handle to the shared state; don't let it
        // outlive the queue if shutdown was never requested.
        self.curator.abort();
    }
}

impl<T> Shared<T> {
    pub(super) fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().expect("queue state lock poisoned")
    }
}

impl<T> QueueState<T> {
    /// Remove every expired head, repeatedly, from every level.
    pub(super) fn take_expired(&mut self, now: Instant) -> Vec<QueuedTask<T>> {
        let mut expired = Vec::new();
        for level in &mut self.levels {
            while level.front().is_some_and(|queued| queued.is_expired(now)) {
                expired.push(level.pop_front().expect("head exists"));
            }
        }
        expired
    }

    fn pop_highest(&mut self) -> Option<QueuedTask<T>> {
        self.levels.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    pub(super) fn is_drained(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    pub(super) fn is_shutdown(&self) -> bool {
        self.shutdown
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn dispatches_in_priority_order() {
        let queue = MultiLevelPriorityQueue::new();
        let timeout = Duration::from_secs(1);

        for (value, priority) in [
            (1, Priority::Low),
            (2, Priority::High),
            (3, Priority::Critical),
            (4, Priority::Low),
            (5, Priority::High),
        ] {
            queue
                .enqueue(priority, timeout, async move { value }, || {})
                .unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(queue.next().await.unwrap());
        }
        assert_eq!(order, vec![3, 2, 5, 1, 4]);
    }

    #[tokio::test]
    async fn fifo_within_a_level() {
        let queue = MultiLevelPriorityQueue::new();

        for value in 1..=3 {
            queue
                .enqueue(
                    Priority::Medium,
                    Duration::from_secs(1),
                    async move { value },
                    || {},
                )
                .unwrap();
        }

        assert_eq!(queue.next().await, Some(1));
        assert_eq!(queue.next().await, Some(2));
        assert_eq!(queue.next().await, Some(3));
    }

    #[tokio::test]
    async fn round_trip() {
        let queue = MultiLevelPriorityQueue::new();

        let handle = queue
            .enqueue(
                Priority::Medium,
                Duration::from_secs(1),
                async { "seven" },
                || {},
            )
            .unwrap();

        assert_eq!(queue.next().await, Some("seven"));
        assert_eq!(handle.wait().await, Completion::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn next_waits_for_an_arrival() {
        let queue = Arc::new(MultiLevelPriorityQueue::new());

        let enqueuer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                queue
                    .enqueue(Priority::Low, Duration::from_secs(1), async { 9 }, || {})
                    .unwrap();
            })
        };

        assert_eq!(queue.next().await, Some(9));
        enqueuer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn curator_reaps_undispatched_tasks() {
        let queue = MultiLevelPriorityQueue::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let timeout = Duration::from_millis(35);

        let mut handles = Vec::new();
        for i in 0..5 {
            let cancelled = Arc::clone(&cancelled);
            handles.push(
                queue
                    .enqueue(
                        Priority::Medium,
                        timeout,
                        async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            i
                        },
                        move || {
                            cancelled.fetch_add(1, Ordering::SeqCst);
                        },
                    )
                    .unwrap(),
            );
        }

        // Three dispatches take ~30ms; the remaining two then age out.
        for expected in 0..3 {
            assert_eq!(queue.next().await, Some(expected));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());

        let mut completions = Vec::new();
        for handle in handles {
            completions.push(handle.wait().await);
        }
        assert_eq!(
            completions,
            vec![
                Completion::Completed,
                Completion::Completed,
                Completion::Completed,
                Completion::TimedOut,
                Completion::TimedOut,
            ]
        );

        queue.shutdown();
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn next_reaps_expired_heads_in_passing() {
        tokio::time::pause();

        let queue = MultiLevelPriorityQueue::new();
        let cancelled = Arc::new(AtomicUsize::new(0));

        let reaper_count = Arc::clone(&cancelled);
        queue
            .enqueue(
                Priority::Critical,
                Duration::from_millis(1),
                async { 1 },
                move || {
                    reaper_count.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        queue
            .enqueue(Priority::Low, Duration::from_secs(10), async { 2 }, || {})
            .unwrap();

        tokio::time::advance(Duration::from_millis(5)).await;

        assert_eq!(queue.next().await, Some(2), "expired head was skipped");
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_and_rejects() {
        let queue = MultiLevelPriorityQueue::new();
        let cancelled = Arc::new(AtomicUsize::new(0));

        let handle = {
            let cancelled = Arc::clone(&cancelled);
            queue
                .enqueue(
                    Priority::High,
                    Duration::from_secs(1),
                    async { 1 },
                    move || {
                        cancelled.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap()
        };

        queue.shutdown();

        assert_eq!(handle.wait().await, Completion::Cancelled);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(queue.is_shutdown());
        assert_eq!(queue.next().await, None);
        assert_eq!(
            queue
                .enqueue(Priority::Low, Duration::from_secs(1), async { 2 }, || {})
                .unwrap_err(),
            QueueError::Shutdown
        );

        // Idempotent.
        queue.shutdown();
    }

    #[tokio::test]
    async fn pending_next_wakes_on_shutdown() {
        let queue = Arc::new(MultiLevelPriorityQueue::<u32>::new());

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
