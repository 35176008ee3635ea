use std::{future::Future, pin::Pin, time::Duration};

use tokio::{sync::oneshot, time::Instant};

use super::{Completion, Priority};

pub(super) type TaskFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(super) type CancelCallback = Box<dyn FnOnce() + Send>;

/// A task parked in the queue, waiting for dispatch.
pub(super) struct QueuedTask<T> {
    pub(super) future: TaskFuture<T>,
    pub(super) priority: Priority,
    pub(super) timeout: Duration,
    pub(super) enqueued_at: Instant,
    on_cancel: Option<CancelCallback>,
    completion: Option<oneshot::Sender<Completion>>,
}

impl<T> QueuedTask<T> {
    pub(super) fn new(
        future: TaskFuture<T>,
        priority: Priority,
        timeout: Duration,
        on_cancel: CancelCallback,
        completion: oneshot::Sender<Completion>,
    ) -> Self {
        Self {
            future,
            priority,
            timeout,
            enqueued_at: Instant::now(),
            on_cancel: Some(on_cancel),
            completion: Some(completion),
        }
    }

    pub(super) fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.enqueued_at) > self.timeout
    }

    /// Drop the task without running it: fire the cancel callback (at
    /// most once) and resolve the enqueuer's handle.
    pub(super) fn abandon(mut self, completion: Completion) {
        if let Some(cancel) = self.on_cancel.take() {
            cancel();
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(completion);
        }
    }

    /// Resolve the enqueuer's handle after the task ran.
    pub(super) fn complete(&mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Completion::Completed);
        }
    }
}
