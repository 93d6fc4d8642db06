//! Bounded job worker pool
//!
//! Network jobs run in a pool with bounded concurrency, async submission and
//! priorities. Submitting returns a [`JobHandle`] exposing the outcome and an
//! abort switch; aborting cancels the job's token, which closes the in-flight
//! request.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pairdrive_core::domain::{ExitCause, ExitCode};

use crate::runner::JobRunner;
use crate::spec::{JobOutcome, JobSpec};

/// Dispatch priority of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

struct QueuedJob {
    priority: JobPriority,
    seq: u64,
    spec: JobSpec,
    cancel: CancellationToken,
    result_tx: oneshot::Sender<JobOutcome>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // higher priority first; FIFO within a priority
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Handle to a submitted job
pub struct JobHandle {
    id: u64,
    cancel: CancellationToken,
    result_rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests cooperative cancellation.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Token that aborts this job; usable after the handle is consumed.
    pub fn abort_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the job to finish.
    pub async fn outcome(self) -> JobOutcome {
        match self.result_rx.await {
            Ok(outcome) => outcome,
            // dispatcher dropped mid-flight (pool shut down)
            Err(_) => JobOutcome::failed(ExitCode::OperationCanceled, ExitCause::Unknown),
        }
    }
}

/// Worker pool over a [`JobRunner`]
pub struct JobPool {
    runner: Arc<dyn JobRunner>,
    queue: Arc<Mutex<BinaryHeap<QueuedJob>>>,
    wakeup: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl JobPool {
    pub fn new(runner: Arc<dyn JobRunner>, max_concurrent: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            runner,
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            wakeup: Arc::new(Notify::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(Self::dispatch_loop(pool.clone()));
        pool
    }

    /// Queues a job and returns its handle.
    pub fn submit(&self, spec: JobSpec, priority: JobPriority) -> JobHandle {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();

        debug!(job = spec.label(), id, ?priority, "Job queued");

        self.queue.lock().expect("job queue poisoned").push(QueuedJob {
            priority,
            seq: id,
            spec,
            cancel: cancel.clone(),
            result_tx,
        });
        self.wakeup.notify_one();

        JobHandle {
            id,
            cancel,
            result_rx,
        }
    }

    /// Convenience: submit and wait.
    pub async fn run(&self, spec: JobSpec, priority: JobPriority) -> JobOutcome {
        self.submit(spec, priority).outcome().await
    }

    /// Stops dispatching; queued jobs resolve as canceled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.wakeup.notify_one();
    }

    async fn dispatch_loop(pool: Arc<Self>) {
        loop {
            let job = pool.queue.lock().expect("job queue poisoned").pop();
            let Some(job) = job else {
                tokio::select! {
                    _ = pool.wakeup.notified() => continue,
                    _ = pool.shutdown.cancelled() => break,
                }
            };

            let permit = tokio::select! {
                permit = pool.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = pool.shutdown.cancelled() => break,
            };

            let runner = pool.runner.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = runner.run(job.spec, &job.cancel).await;
                if job.result_tx.send(outcome).is_err() {
                    warn!(id = job.seq, "Job finished but nobody was waiting");
                }
            });
        }

        // drain: everything still queued is canceled
        let mut queue = pool.queue.lock().expect("job queue poisoned");
        while let Some(job) = queue.pop() {
            let _ = job
                .result_tx
                .send(JobOutcome::failed(ExitCode::OperationCanceled, ExitCause::Unknown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::spec::JobPayload;

    /// Runner that records concurrency and sleeps briefly.
    struct SlowRunner {
        active: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for SlowRunner {
        async fn run(&self, _spec: JobSpec, cancel: &CancellationToken) -> JobOutcome {
            let now = self.active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.max_seen.fetch_max(now, AtomicOrdering::SeqCst);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    JobOutcome::failed(ExitCode::OperationCanceled, ExitCause::Unknown)
                }
                _ = tokio::time::sleep(Duration::from_millis(30)) => {
                    JobOutcome::ok(JobPayload::None)
                }
            };

            self.active.fetch_sub(1, AtomicOrdering::SeqCst);
            outcome
        }
    }

    fn delete_spec(n: u64) -> JobSpec {
        JobSpec::Delete {
            remote_id: pairdrive_core::domain::NodeId::new(format!("r{n}")),
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let runner = Arc::new(SlowRunner {
            active: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let pool = JobPool::new(runner.clone(), 2);

        let handles: Vec<_> = (0..6)
            .map(|n| pool.submit(delete_spec(n), JobPriority::Normal))
            .collect();
        for handle in handles {
            assert!(handle.outcome().await.is_ok());
        }

        assert!(runner.max_seen.load(AtomicOrdering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_abort_resolves_as_canceled() {
        let runner = Arc::new(SlowRunner {
            active: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let pool = JobPool::new(runner, 1);

        let handle = pool.submit(delete_spec(1), JobPriority::Normal);
        handle.abort();
        let outcome = handle.outcome().await;
        assert_eq!(outcome.code, ExitCode::OperationCanceled);
    }

    #[tokio::test]
    async fn test_priority_order() {
        // One slot, and the first job occupies it while we queue the rest.
        let runner = Arc::new(SlowRunner {
            active: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let pool = JobPool::new(runner, 1);

        let first = pool.submit(delete_spec(0), JobPriority::Normal);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let low = pool.submit(delete_spec(1), JobPriority::Low);
        let high = pool.submit(delete_spec(2), JobPriority::High);

        // the high-priority job finishes before the low one
        first.outcome().await;
        tokio::select! {
            _ = high.outcome() => {}
            _ = tokio::time::sleep(Duration::from_secs(2)) => panic!("high-priority job starved"),
        }
        low.outcome().await;
    }
}
