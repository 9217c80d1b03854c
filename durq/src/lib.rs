#![warn(missing_docs)]
//! A durable job queue backed by SQLite. Producers enqueue typed jobs with opaque payloads, and a
//! pool of workers claims each job exactly once, runs the handler registered for its type, and
//! records whether it completed or failed.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::path::Path;
//! # use std::time::Duration;
//! # use serde::{Deserialize, Serialize};
//! use durq::{ClaimedJob, Error, JobRegistry, JobRunner, JobState, Queue, WorkerPool};
//!
//! #[derive(Debug)]
//! pub struct JobContext {
//!    // database pool or other things here
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct RemindMePayload {
//!   email: String,
//!   message: String,
//! }
//!
//! async fn remind_me_job(job: ClaimedJob, context: Arc<JobContext>) -> Result<(), Error> {
//!     let payload: RemindMePayload = job.json_payload()?;
//!     // do something with the job
//!     Ok(())
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Error> {
//!   // Create a queue
//!   let queue = Queue::new(Path::new("durq.db")).await?;
//!
//!   // Register a handler for the job type.
//!   let registry = JobRegistry::new([JobRunner::new("remind_me", remind_me_job)]);
//!
//!   let context = Arc::new(JobContext{
//!     // database pool or other things here
//!   });
//!
//!   // Start two workers to run jobs.
//!   let pool = WorkerPool::builder(&queue, context)
//!     .registry(&registry)
//!     .size(2)
//!     .build()?;
//!
//!   // Submit a job to the queue.
//!   let job_id = queue
//!     .client()
//!     .enqueue_json("remind_me", &RemindMePayload {
//!         email: "me@example.com".to_string(),
//!         message: "Time to go!".to_string()
//!     })
//!     .await?;
//!
//!   // See what's happening with the job.
//!   let status = queue.get_job_status(job_id).await?;
//!   println!("job {job_id} is {}", status.state);
//!
//!   // Let running jobs finish, then shut down.
//!   pool.drain(Duration::from_secs(30)).await?;
//!   queue.close(Duration::from_secs(5)).await?;
//!
//!   Ok(())
//! }
//! ```
//!
//! Jobs are claimed in approximately the order they were enqueued. With more than one worker,
//! completion order is not guaranteed.

mod client;
mod db_writer;
mod error;
mod job;
mod job_registry;
mod job_status;
mod migrations;
mod queue;
mod retry;
mod shared_state;
#[cfg(test)]
mod test_util;
mod worker;

pub use client::{EnqueueLimits, QueueClient};
pub use error::{Error, ErrorKind, Result};
pub use job::ClaimedJob;
pub use job_registry::{JobRegistry, JobRunner, JobRunnerBuilder};
pub use job_status::{JobCounts, JobState, JobStatus};
pub use queue::{Queue, QueueOptions};
pub use retry::{RequeuedJob, RetryPolicy, RetrySupervisor};
pub use worker::{UnknownJobTypePolicy, WorkerCounts, WorkerPool, WorkerPoolBuilder};

/// The identifier the store assigns to a job. Ids are positive, strictly increasing in insertion
/// order, and never reused.
pub type JobId = i64;

pub(crate) type SmartString = smartstring::SmartString<smartstring::LazyCompact>;

/// How to treat jobs which are already marked as in progress when the queue starts.
/// This accounts for cases where the process is restarted unexpectedly while a worker held a
/// claim.
///
/// Opening a queue cannot tell a claim left behind by a dead process from one held by a live
/// process sharing the database file, so claims are left alone unless asked otherwise.
#[non_exhaustive]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum JobRecoveryBehavior {
    /// Don't touch the job. Other processes sharing the database file may still be running the
    /// jobs they claimed.
    #[default]
    LeaveInProgress,
    /// Mark the job as failed, recording that its claim was abandoned. A [RetrySupervisor] will
    /// pick it up like any other failed job. Only use this when this process is the sole user
    /// of the database file.
    FailAbandoned,
}
