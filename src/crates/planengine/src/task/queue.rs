//! Task queue: a bounded worker pool draining an unbounded backlog (spec.md
//! §4.10).
//!
//! Grounded on `original_source/app/controller/task_queue.py`: a fixed
//! number of workers pull `(task_id, job, enqueue_time)` triples off a
//! shared channel, discard anything that sat past `timeout` before a worker
//! picked it up, and otherwise run it under a semaphore sized to the worker
//! count. A worker panicking or returning an error is logged and does not
//! take down the pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use uuid::Uuid;

type Job = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

struct QueueItem {
    task_id: Uuid,
    enqueued_at: Instant,
    job: Job,
}

/// A bounded pool of workers draining an unbounded backlog of task jobs.
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<QueueItem>,
}

impl TaskQueue {
    /// Spawns `workers` worker tasks sharing a concurrency semaphore of the
    /// same size, each discarding items that waited longer than `timeout`
    /// before being picked up.
    pub fn start(workers: usize, timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<QueueItem>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let semaphore = Arc::new(Semaphore::new(workers));

        for worker_id in 0..workers {
            let receiver = receiver.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await
                    };
                    let Some(item) = item else {
                        break;
                    };

                    if item.enqueued_at.elapsed() > timeout {
                        tracing::warn!(
                            task_id = %item.task_id,
                            worker_id,
                            "task exceeded queue timeout, discarding"
                        );
                        continue;
                    }

                    let _permit = semaphore.acquire().await.expect("semaphore not closed");
                    if let Err(err) = item.job.await {
                        tracing::error!(
                            task_id = %item.task_id,
                            worker_id,
                            error = ?err,
                            "task queue job failed"
                        );
                    }
                }
            });
        }

        Self { sender }
    }

    /// Enqueues `job` for `task_id`, timestamped now. Never blocks: the
    /// backlog is unbounded, matching the Python queue's unbounded `Queue`.
    pub fn add_task<F>(&self, task_id: Uuid, job: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let item = QueueItem { task_id, enqueued_at: Instant::now(), job: Box::pin(job) };
        // The only way this send fails is if every worker task has panicked
        // away its receiver handle; there is nothing more useful to do than
        // log and drop the job.
        if self.sender.send(item).is_err() {
            tracing::error!(%task_id, "task queue has no live workers, dropping job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn runs_a_submitted_job() {
        let queue = TaskQueue::start(2, Duration::from_secs(60));
        let (tx, rx) = oneshot::channel();
        queue.add_task(Uuid::new_v4(), async move {
            tx.send(()).ok();
            Ok(())
        });
        tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn limits_concurrency_to_worker_count() {
        let queue = TaskQueue::start(2, Duration::from_secs(60));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..6 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            let done_tx = done_tx.clone();
            queue.add_task(Uuid::new_v4(), async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                done_tx.send(()).ok();
                Ok(())
            });
        }
        drop(done_tx);

        for _ in 0..6 {
            done_rx.recv().await;
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn stale_job_is_discarded_without_blocking_others() {
        let queue = TaskQueue::start(1, Duration::from_millis(10));
        let ran = Arc::new(AtomicUsize::new(0));

        let stale_item = QueueItem {
            task_id: Uuid::new_v4(),
            enqueued_at: Instant::now() - Duration::from_secs(1),
            job: Box::pin({
                let ran = ran.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        };
        queue.sender.send(stale_item).unwrap();

        let (tx, rx) = oneshot::channel();
        queue.add_task(Uuid::new_v4(), async move {
            tx.send(()).ok();
            Ok(())
        });
        tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
