//! Process-wide build queue.
//!
//! A single worker task pulls jobs in FIFO order and awaits each one to
//! completion before starting the next, so at most one build runs at any
//! instant across all projects. A job that overruns the timeout has its
//! cancellation token triggered; the worker keeps waiting for the job to wind
//! down before moving on.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Default per-job timeout: 30 minutes.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Lifecycle notifications emitted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Started { label: String },
    TimedOut { label: String },
    Finished { label: String },
}

type JobFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

struct QueuedJob {
    label: String,
    run: JobFn,
}

/// Handle to the build queue. Cheap to clone; all clones feed the same worker.
#[derive(Clone)]
pub struct BuildQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    events: broadcast::Sender<QueueEvent>,
    pending: Arc<AtomicUsize>,
}

impl BuildQueue {
    /// Spawn the worker on the current runtime and return a handle to it.
    pub fn start(timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(worker(rx, events.clone(), pending.clone(), timeout));

        Self {
            tx,
            events,
            pending,
        }
    }

    /// Append a job. The job receives a token that is cancelled if it runs
    /// past the queue timeout; the queue advances only once the returned
    /// future completes.
    pub fn push<F, Fut>(&self, label: impl Into<String>, job: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let queued = QueuedJob {
            label: label.clone(),
            run: Box::new(move |token| Box::pin(job(token))),
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(queued).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(job = %label, "build queue worker has stopped; job dropped");
        }
    }

    /// Number of jobs waiting to start.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<QueuedJob>,
    events: broadcast::Sender<QueueEvent>,
    pending: Arc<AtomicUsize>,
    timeout: Duration,
) {
    while let Some(job) = rx.recv().await {
        pending.fetch_sub(1, Ordering::SeqCst);
        let label = job.label;
        let token = CancellationToken::new();
        let started = Instant::now();

        tracing::info!(job = %label, "build job started");
        let _ = events.send(QueueEvent::Started {
            label: label.clone(),
        });

        // Run on its own task so a panicking job cannot take the worker down.
        let mut handle = tokio::spawn((job.run)(token.clone()));

        let joined = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(job = %label, timeout_secs = timeout.as_secs(), "build job timed out");
                let _ = events.send(QueueEvent::TimedOut {
                    label: label.clone(),
                });
                token.cancel();
                handle.await
            }
        };

        if let Err(e) = joined {
            tracing::error!(job = %label, "build job aborted: {}", e);
        }

        tracing::info!(
            job = %label,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "build job finished"
        );
        let _ = events.send(QueueEvent::Finished { label });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    async fn next_event(rx: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("queue event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_jobs_run_one_at_a_time_in_fifo_order() {
        let queue = BuildQueue::start(DEFAULT_JOB_TIMEOUT);
        let mut events = queue.subscribe();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let order = order.clone();
            queue.push(format!("job-{i}"), move |_token| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                order.lock().unwrap().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        for i in 0..4 {
            assert_eq!(
                next_event(&mut events).await,
                QueueEvent::Started {
                    label: format!("job-{i}")
                }
            );
            assert_eq!(
                next_event(&mut events).await,
                QueueEvent::Finished {
                    label: format!("job-{i}")
                }
            );
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_timeout_cancels_token_and_waits_for_job() {
        let queue = BuildQueue::start(Duration::from_millis(50));
        let mut events = queue.subscribe();
        let saw_cancel = Arc::new(AtomicUsize::new(0));

        let flag = saw_cancel.clone();
        queue.push("slow", move |token| async move {
            token.cancelled().await;
            // Still winding down after cancellation; the queue must wait.
            tokio::time::sleep(Duration::from_millis(30)).await;
            flag.store(1, Ordering::SeqCst);
        });
        queue.push("next", |_token| async {});

        assert_eq!(
            next_event(&mut events).await,
            QueueEvent::Started {
                label: "slow".into()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            QueueEvent::TimedOut {
                label: "slow".into()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            QueueEvent::Finished {
                label: "slow".into()
            }
        );
        assert_eq!(saw_cancel.load(Ordering::SeqCst), 1);
        assert_eq!(
            next_event(&mut events).await,
            QueueEvent::Started {
                label: "next".into()
            }
        );
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_queue() {
        let queue = BuildQueue::start(DEFAULT_JOB_TIMEOUT);
        let mut events = queue.subscribe();

        queue.push("boom", |_token| async { panic!("build exploded") });
        queue.push("after", |_token| async {});

        let mut finished = Vec::new();
        while finished.len() < 2 {
            if let QueueEvent::Finished { label } = next_event(&mut events).await {
                finished.push(label);
            }
        }
        assert_eq!(finished, vec!["boom", "after"]);
    }
}
