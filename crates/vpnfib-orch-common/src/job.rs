//! Keyed job coordinator.
//!
//! Jobs submitted under the same key run one at a time in submission order.
//! Jobs under different keys run in parallel, bounded by a shared worker
//! pool. A job that fails with a retryable [`TaskError`] is run again, up to
//! `max_retries` extra attempts, before its result is reported.
//!
//! A job must never wait on the handle of another job with the same key: the
//! key's worker is busy running the caller and the wait would never finish.

use crate::task::{TaskError, TaskResult};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};

type JobFuture = Pin<Box<dyn Future<Output = TaskResult<()>> + Send>>;
type JobFn = Box<dyn FnMut() -> JobFuture + Send>;

/// Configuration for the job coordinator.
#[derive(Debug, Clone)]
pub struct JobCoordinatorConfig {
    /// Jobs allowed to run at the same time across all keys.
    pub max_concurrent_jobs: usize,
    /// Extra attempts for a job failing with a retryable error.
    pub max_retries: u32,
    /// Base delay before a retry; attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for JobCoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 16,
            max_retries: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// Counters exposed for dumps and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

struct QueuedJob {
    name: String,
    run: JobFn,
    done: oneshot::Sender<TaskResult<()>>,
}

struct Inner {
    config: JobCoordinatorConfig,
    queues: Mutex<HashMap<String, VecDeque<QueuedJob>>>,
    permits: Semaphore,
    pending: AtomicUsize,
    idle: Notify,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Completion handle for one submitted job.
pub struct JobHandle {
    rx: oneshot::Receiver<TaskResult<()>>,
}

impl JobHandle {
    /// Waits for the job's final result (after retries).
    pub async fn wait(self) -> TaskResult<()> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(TaskError::failed("job dropped before completion")))
    }
}

/// Serializes jobs per key over a bounded worker pool.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    pub fn new(config: JobCoordinatorConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent_jobs.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                queues: Mutex::new(HashMap::new()),
                permits,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retried: AtomicU64::new(0),
            }),
        }
    }

    /// Submits a job under `key`. The closure is called once per attempt.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<F, Fut>(&self, key: impl Into<String>, name: impl Into<String>, mut job: F) -> JobHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        let key = key.into();
        let (done, rx) = oneshot::channel();
        let queued = QueuedJob {
            name: name.into(),
            run: Box::new(move || -> JobFuture { Box::pin(job()) }),
            done,
        };

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);

        let start_worker = {
            let mut queues = self.inner.queues.lock();
            match queues.get_mut(&key) {
                Some(queue) => {
                    queue.push_back(queued);
                    false
                }
                None => {
                    queues.insert(key.clone(), VecDeque::from([queued]));
                    true
                }
            }
        };

        if start_worker {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.run_key(key).await });
        }

        JobHandle { rx }
    }

    /// Number of jobs submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Number of keys that currently have a worker.
    pub fn active_keys(&self) -> usize {
        self.inner.queues.lock().len()
    }

    /// Resolves once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            retried: self.inner.retried.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn run_key(self: Arc<Self>, key: String) {
        loop {
            let next = {
                let mut queues = self.queues.lock();
                let job = queues.get_mut(&key).and_then(VecDeque::pop_front);
                if job.is_none() {
                    queues.remove(&key);
                }
                job
            };
            let Some(job) = next else {
                return;
            };

            let result = self.run_job(&key, job.name, job.run).await;
            match &result {
                Ok(()) => self.completed.fetch_add(1, Ordering::Relaxed),
                Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
            };
            // The submitter may have dropped its handle.
            let _ = job.done.send(result);

            if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.idle.notify_waiters();
            }
        }
    }

    async fn run_job(&self, key: &str, name: String, mut run: JobFn) -> TaskResult<()> {
        let _permit = self.permits.acquire().await.ok();
        let mut attempt = 0;
        loop {
            // Each attempt runs as its own task so a panic fails the job
            // instead of taking the key's worker down with it.
            let outcome = match tokio::spawn(run()).await {
                Ok(outcome) => outcome,
                Err(e) => Err(TaskError::failed(format!("job {} aborted: {}", name, e))),
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "JobCoordinator: {} [{}] attempt {} failed, retrying: {}",
                        name, key, attempt, e
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                other => {
                    debug!("JobCoordinator: {} [{}] finished after {} retries", name, key, attempt);
                    return other;
                }
            }
        }
    }
}
