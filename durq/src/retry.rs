use std::time::Duration;

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{event, instrument, Level};

use crate::{
    db_writer::{requeue::RequeueFailedArgs, DbOperationType},
    shared_state::SharedState,
    Error, JobId, Queue, Result,
};

/// How a [RetrySupervisor] decides whether and when to re-insert a failed job.
///
/// The delay before retrying a job that failed on attempt `n` is
/// `initial_interval * backoff_coefficient^(n - 1)`, capped at `maximum_interval`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The total number of attempts a job gets, counting the first. A job that fails on this
    /// attempt is left failed for good.
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The delay before the first retry.
    pub initial_interval: Duration,
    /// The maximum possible delay between retries.
    pub maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    /// Create a policy allowing `max_attempts` attempts, with the default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// The time to wait after a job fails on `attempt` before re-inserting it.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let candidate = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate, max_interval),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: Some(Duration::from_secs(60 * 60)),
        }
    }
}

/// A failed job that was re-inserted as a new job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequeuedJob {
    /// The job that failed. It stays in the `failed` state.
    pub failed_job_id: JobId,
    /// The new pending job.
    pub new_job_id: JobId,
    /// The type shared by both jobs.
    pub job_type: String,
    /// The attempt number of the new job.
    pub attempt: u32,
}

const REQUEUE_BATCH_LIMIT: usize = 100;

impl SharedState {
    async fn requeue_failed(&self, policy: RetryPolicy) -> Result<Vec<RequeuedJob>> {
        let now = self.time.now().unix_timestamp();
        let requeued = self
            .write(|result_tx| {
                DbOperationType::RequeueFailed(RequeueFailedArgs {
                    policy,
                    now,
                    limit: REQUEUE_BATCH_LIMIT,
                    result_tx,
                })
            })
            .await?;

        for job in &requeued {
            event!(
                Level::INFO,
                failed_job_id = %job.failed_job_id,
                new_job_id = %job.new_job_id,
                job_type = %job.job_type,
                attempt = %job.attempt,
                "Requeued failed job"
            );
            self.job_available.notify_one();
        }

        Ok(requeued)
    }
}

impl Queue {
    /// Re-insert failed jobs that `policy` allows another attempt and whose backoff delay has
    /// passed. Each failed job stays failed, and is linked to the new pending job through
    /// [JobStatus::requeued_as](crate::JobStatus::requeued_as). A failed job is re-inserted at
    /// most once.
    ///
    /// At most 100 jobs are handled per call.
    pub async fn requeue_failed(&self, policy: RetryPolicy) -> Result<Vec<RequeuedJob>> {
        self.state.requeue_failed(policy).await
    }
}

/// A background task that periodically calls [Queue::requeue_failed].
///
/// Failed jobs are terminal as far as the queue is concerned. The supervisor is an optional
/// policy on top of that, and never modifies a failed job except to link it to its retry.
pub struct RetrySupervisor {
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl RetrySupervisor {
    /// Start checking for retryable jobs every `check_interval`. The supervisor runs until
    /// [RetrySupervisor::stop] is called or the queue closes.
    pub fn start(queue: &Queue, policy: RetryPolicy, check_interval: Duration) -> RetrySupervisor {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = queue.state.clone();
        state.worker_started();
        let handle = tokio::spawn(supervise(state, policy, check_interval, stop_rx));

        RetrySupervisor {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the supervisor and wait for it to exit.
    pub async fn stop(mut self) -> Result<()> {
        self.stop_tx.send_replace(true);
        match self.handle.take() {
            Some(handle) => handle.await.map_err(Error::from),
            None => Ok(()),
        }
    }
}

impl Drop for RetrySupervisor {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

#[instrument(parent = None, name = "retry_supervisor", skip(state, stop_rx))]
async fn supervise(
    state: SharedState,
    policy: RetryPolicy,
    check_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut close_rx = state.close.clone();
    let mut interval = tokio::time::interval(check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = close_rx.changed() => break,
            _ = interval.tick() => {}
        }

        if let Err(e) = state.requeue_failed(policy).await {
            event!(Level::ERROR, %e, "Failed to requeue failed jobs");
        }
    }

    state.worker_stopped();
    event!(Level::DEBUG, "Retry supervisor stopped");
}
