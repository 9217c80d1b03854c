use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{event, instrument, Instrument, Level};
use uuid::Uuid;

use crate::db_writer::finish::JobOutcome;
use crate::job::ClaimedJob;
use crate::job_registry::JobRegistry;
use crate::shared_state::SharedState;
use crate::{Error, Queue, Result};

/// Recorded when a handler fails with an error that displays as an empty string.
const EMPTY_FAILURE_REASON: &str = "handler returned an error";

/// What a worker does with a job type that has no handler in its registry.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum UnknownJobTypePolicy {
    /// Only claim job types that have a registered handler. Jobs of other types stay pending, so
    /// they can be found in the store and will be claimed once a worker with a handler for them
    /// starts.
    #[default]
    LeavePending,
    /// Claim jobs of any type, and mark jobs without a handler as failed with a configuration
    /// error reason.
    Fail,
}

/// Counts of the jobs a [WorkerPool] has processed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCounts {
    /// Jobs claimed by the pool.
    pub started: u64,
    /// Jobs the pool recorded as completed.
    pub completed: u64,
    /// Jobs the pool recorded as failed.
    pub failed: u64,
}

#[derive(Default)]
struct RunningJobs {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// A set of worker routines that claim jobs from a [Queue] and run them with the handlers in a
/// [JobRegistry].
///
/// Each worker claims the oldest pending job, runs it, records the result, and repeats. Jobs are
/// claimed in approximately the order they were enqueued, but workers race each other, so two
/// jobs enqueued in order A, B may be claimed or finished in order B, A.
///
/// Dropping the pool tells the workers to stop after their current job without waiting for them.
/// Use [WorkerPool::drain] to wait.
pub struct WorkerPool {
    /// The unique identifier of this pool. Each worker's id is derived from it.
    pub id: String,
    counts: Arc<RunningJobs>,
    stop_tx: watch::Sender<bool>,
    join_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a [WorkerPoolBuilder] for the given queue.
    pub fn builder<CONTEXT>(queue: &Queue, context: CONTEXT) -> WorkerPoolBuilder<'_, CONTEXT>
    where
        CONTEXT: Send + Sync + Debug + Clone + 'static,
    {
        WorkerPoolBuilder::new(queue, context)
    }

    /// Return counts of the jobs this pool has started and finished.
    pub fn counts(&self) -> WorkerCounts {
        WorkerCounts {
            started: self.counts.started.load(Ordering::Relaxed),
            completed: self.counts.completed.load(Ordering::Relaxed),
            failed: self.counts.failed.load(Ordering::Relaxed),
        }
    }

    /// The number of worker routines in the pool.
    pub fn size(&self) -> usize {
        self.join_handles.len()
    }

    /// Stop claiming new jobs, let running handlers finish and record their results, and wait for
    /// every worker to exit.
    #[instrument(skip(self), fields(pool_id = %self.id))]
    pub async fn drain(mut self, timeout: Duration) -> Result<()> {
        self.stop_tx.send_replace(true);

        let handles = std::mem::take(&mut self.join_handles);
        let wait = async move {
            for handle in handles {
                handle.await?;
            }
            Ok::<_, Error>(())
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout)??;

        event!(Level::INFO, "Worker pool drained");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

/// A builder for a [WorkerPool].
pub struct WorkerPoolBuilder<'a, CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    /// The job registry from which this pool should take its job functions.
    registry: Option<&'a JobRegistry<CONTEXT>>,
    queue: &'a Queue,
    /// The context value to send to the pool's jobs.
    context: CONTEXT,
    name: String,
    size: usize,
    poll_interval: Duration,
    poll_jitter: f64,
    unknown_job_types: UnknownJobTypePolicy,
}

impl<'a, CONTEXT> WorkerPoolBuilder<'a, CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    /// Create a new builder. The pool defaults to 4 workers polling every second.
    pub fn new(queue: &'a Queue, context: CONTEXT) -> Self {
        Self {
            registry: None,
            queue,
            context,
            name: "worker".to_string(),
            size: 4,
            poll_interval: Duration::from_secs(1),
            poll_jitter: 0.1,
            unknown_job_types: UnknownJobTypePolicy::default(),
        }
    }

    /// Set the registry of handlers the pool dispatches to.
    pub fn registry(mut self, registry: &'a JobRegistry<CONTEXT>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// A prefix for the worker identities recorded on claimed jobs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The number of concurrent worker routines.
    pub fn size(mut self, size: usize) -> Self {
        assert!(size > 0, "worker pool size must be at least 1");
        self.size = size;
        self
    }

    /// How long an idle worker waits before checking the store again. A job enqueued through a
    /// client of the same [Queue] wakes a worker immediately; jobs enqueued by other processes are
    /// found by polling.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Randomize each idle wait by up to this fraction of the poll interval, so that workers
    /// don't poll in lockstep. Defaults to 0.1.
    pub fn poll_jitter(mut self, poll_jitter: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&poll_jitter),
            "poll_jitter must be between 0 and 1"
        );
        self.poll_jitter = poll_jitter;
        self
    }

    /// What to do with jobs whose type has no registered handler.
    pub fn unknown_job_types(mut self, policy: UnknownJobTypePolicy) -> Self {
        self.unknown_job_types = policy;
        self
    }

    /// Start the worker routines.
    ///
    /// Returns [Error::MissingConfiguration] if no registry was set or the registry is empty.
    pub fn build(self) -> Result<WorkerPool> {
        let registry = self
            .registry
            .filter(|r| !r.is_empty())
            .ok_or(Error::MissingConfiguration("worker pool has no job handlers"))?;

        let job_types = match self.unknown_job_types {
            UnknownJobTypePolicy::LeavePending => {
                Some(Arc::<[String]>::from(registry.job_types()))
            }
            UnknownJobTypePolicy::Fail => None,
        };

        let pool_id = format!("{}-{}", self.name, Uuid::now_v7().simple());
        let counts = Arc::new(RunningJobs::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let runners: Arc<ahash::HashMap<_, _>> = Arc::new(
            registry
                .jobs
                .iter()
                .map(|(name, runner)| (name.clone(), runner.clone()))
                .collect(),
        );

        event!(
            Level::INFO,
            %pool_id,
            size = self.size,
            job_types = ?registry.job_types(),
            poll_interval = ?self.poll_interval,
            unknown_job_types = ?self.unknown_job_types,
            "Starting worker pool",
        );

        let join_handles = (0..self.size)
            .map(|index| {
                let worker = WorkerInternal {
                    worker_id: Arc::from(format!("{pool_id}-{index}")),
                    queue: self.queue.state.clone(),
                    runners: Arc::clone(&runners),
                    job_types: job_types.clone(),
                    context: self.context.clone(),
                    counts: counts.clone(),
                    poll_interval: self.poll_interval,
                    poll_jitter: self.poll_jitter,
                };

                worker.queue.worker_started();
                tokio::spawn(worker.run(stop_rx.clone()))
            })
            .collect();

        Ok(WorkerPool {
            id: pool_id,
            counts,
            stop_tx,
            join_handles,
        })
    }
}

struct WorkerInternal<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    worker_id: Arc<str>,
    queue: SharedState,
    runners: Arc<ahash::HashMap<crate::SmartString, crate::JobRunner<CONTEXT>>>,
    job_types: Option<Arc<[String]>>,
    context: CONTEXT,
    counts: Arc<RunningJobs>,
    poll_interval: Duration,
    poll_jitter: f64,
}

pub(crate) fn log_error<T, E>(result: Result<T, E>)
where
    E: std::error::Error,
{
    if let Err(e) = result {
        event!(Level::ERROR, ?e);
    }
}

impl<CONTEXT> WorkerInternal<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    #[instrument(parent = None, name = "worker_loop", skip_all, fields(worker_id = %self.worker_id))]
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut global_close_rx = self.queue.close.clone();
        loop {
            if *stop_rx.borrow_and_update() || global_close_rx.has_changed().unwrap_or(true) {
                break;
            }

            match self.queue.claim_next(&self.worker_id, self.job_types.clone()).await {
                Ok(Some(job)) => {
                    self.run_job(job).await;
                    continue;
                }
                Ok(None) => {
                    event!(Level::TRACE, "No jobs ready");
                }
                Err(e) => {
                    event!(Level::ERROR, %e, "Failed to claim a job");
                }
            }

            tokio::select! {
                biased;
                _ = stop_rx.changed() => {}
                _ = global_close_rx.changed() => break,
                _ = self.queue.job_available.notified() => {
                    event!(Level::TRACE, "New job ready");
                }
                _ = tokio::time::sleep(self.idle_wait()) => {}
            }
        }

        self.queue.worker_stopped();
        event!(Level::DEBUG, "Worker stopped");
    }

    fn idle_wait(&self) -> Duration {
        if self.poll_jitter == 0.0 {
            return self.poll_interval;
        }

        let jitter = rand::thread_rng().gen_range(0.0..=self.poll_jitter);
        self.poll_interval.mul_f64(1.0 + jitter)
    }

    async fn run_job(&self, job: ClaimedJob) {
        self.counts.started.fetch_add(1, Ordering::Relaxed);
        let job_id = job.id;
        let span = tracing::info_span!("run_job", %job);

        let outcome = async {
            let outcome = match self.runners.get(job.job_type.as_str()) {
                Some(runner) => match runner.run(job, self.context.clone()).await {
                    Ok(()) => JobOutcome::Completed,
                    Err(reason) if reason.is_empty() => {
                        JobOutcome::Failed(EMPTY_FAILURE_REASON.to_string())
                    }
                    Err(reason) => JobOutcome::Failed(reason),
                },
                None => {
                    let err = Error::UnregisteredJobType(job.job_type.clone());
                    event!(Level::ERROR, %err, "Claimed a job with no handler");
                    JobOutcome::Failed(format!("configuration error: {err}"))
                }
            };

            match &outcome {
                JobOutcome::Completed => event!(Level::DEBUG, "Job completed"),
                JobOutcome::Failed(reason) => event!(Level::WARN, %reason, "Job failed"),
            }

            outcome
        }
        .instrument(span.clone())
        .await;

        let succeeded = matches!(outcome, JobOutcome::Completed);
        let result = self
            .queue
            .finish_job(job_id, &self.worker_id, outcome)
            .instrument(span)
            .await;

        match result {
            Ok(()) if succeeded => {
                self.counts.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(()) => {
                self.counts.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e @ (Error::NotFound | Error::NotClaimed { .. })) => {
                // Only this worker may finish the job. Seeing this means the claim was lost,
                // which should never happen during normal operation.
                event!(Level::ERROR, %job_id, err = %e, "Job was not held by this worker when finishing it");
            }
            Err(e) => {
                event!(Level::ERROR, %job_id, err = %e, "Failed to record job result");
            }
        }
    }
}
