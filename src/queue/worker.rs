use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};

use super::MultiLevelPriorityQueue;

/// Drive a queue from a background task until cancelled.
///
/// The worker repeatedly dispatches through
/// [next](MultiLevelPriorityQueue::next), discarding the returned values:
/// results flow to interested parties through the enqueuers' completion
/// signals and whatever channels the job futures captured. Several
/// workers may drive one queue; each task is handed to exactly one of
/// them.
///
/// The worker stops when `cancel` becomes `true` (or its sender is
/// dropped), or when the queue shuts down and drains. Cancelling a worker
/// mid-task drops that task; its handle resolves
/// [Cancelled](super::Completion::Cancelled).
pub fn create_queue_worker<T>(
    queue: Arc<MultiLevelPriorityQueue<T>>,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    T: Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if *cancel.borrow() {
                break;
            }

            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                dispatched = queue.next() => {
                    if dispatched.is_none() {
                        // Shut down and drained.
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::queue::Priority;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn workers_drain_the_queue() {
        let queue = Arc::new(MultiLevelPriorityQueue::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let workers = vec![
            create_queue_worker(Arc::clone(&queue), cancel_rx.clone()),
            create_queue_worker(Arc::clone(&queue), cancel_rx),
        ];

        for i in 0..10 {
            let results_tx = results_tx.clone();
            queue
                .enqueue(
                    Priority::Medium,
                    Duration::from_secs(1),
                    async move {
                        let _ = results_tx.send(i);
                    },
                    || {},
                )
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(results_rx.recv().await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        cancel_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn worker_stops_when_the_queue_shuts_down() {
        let queue = Arc::new(MultiLevelPriorityQueue::<()>::new());
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let worker = create_queue_worker(Arc::clone(&queue), cancel_rx);
        queue.shutdown();

        worker.await.unwrap();
    }
}
