use std::{fmt::Display, str::FromStr};

use rusqlite::{OptionalExtension, Row};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{Error, JobId, Queue, Result};

/// The current state of a job. Jobs only move forward through these states:
/// `Pending` to `InProgress`, then to either `Completed` or `Failed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// The job is waiting to be claimed.
    Pending,
    /// A worker has claimed the job and is running it.
    InProgress,
    /// The job finished successfully.
    Completed,
    /// The job's handler failed. Failed jobs are never retried by the queue itself.
    Failed,
}

impl JobState {
    /// Return a string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InProgress => "in_progress",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Returns true if the job will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "in_progress" => Ok(JobState::InProgress),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(Error::InvalidJobState(s.to_string())),
        }
    }
}

/// Status information about a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    /// The job's ID.
    pub id: JobId,
    /// The type of a job
    pub job_type: String,
    /// Where the job is in its lifecycle.
    pub state: JobState,
    /// The job's payload
    #[serde(skip)]
    pub payload: Vec<u8>,
    /// The worker holding the job, while it is in progress.
    pub claimed_by: Option<String>,
    /// When the current claim was taken, while the job is in progress.
    #[serde(with = "time::serde::timestamp::option")]
    pub claimed_at: Option<OffsetDateTime>,
    /// The failure reason, if the job failed.
    pub error_info: Option<String>,
    /// When the job was added to the queue.
    #[serde(with = "time::serde::timestamp")]
    pub added_at: OffsetDateTime,
    /// When a worker started the job.
    #[serde(with = "time::serde::timestamp::option")]
    pub started_at: Option<OffsetDateTime>,
    /// When the job reached a terminal state.
    #[serde(with = "time::serde::timestamp::option")]
    pub finished_at: Option<OffsetDateTime>,
    /// 1 for a newly enqueued job, and one more than the failed job's attempt for a retry.
    pub attempt: u32,
    /// The failed job this job was re-inserted from.
    pub retry_of: Option<JobId>,
    /// For a failed job, the job that was re-inserted to retry it.
    pub requeued_as: Option<JobId>,
}

/// Counts of jobs in each state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Jobs waiting to be claimed.
    pub pending: u64,
    /// Jobs currently claimed by a worker.
    pub in_progress: u64,
    /// Jobs that finished successfully.
    pub completed: u64,
    /// Jobs that failed.
    pub failed: u64,
}

fn timestamp_column(row: &Row, idx: usize, name: &'static str) -> Result<Option<OffsetDateTime>> {
    row.get_ref(idx)?
        .as_i64_or_null()
        .map_err(|e| Error::ColumnType(e.into(), name))?
        .map(|i| OffsetDateTime::from_unix_timestamp(i).map_err(|_| Error::TimestampOutOfRange(name)))
        .transpose()
}

impl Queue {
    pub(crate) fn run_job_status_query(
        conn: &rusqlite::Connection,
        job_id: JobId,
    ) -> Result<Option<JobStatus>> {
        let mut stmt = conn.prepare_cached(
            r##"
            SELECT job_id, job_type, state, payload, claimed_by, claimed_at, error_info,
                added_at, started_at, finished_at, attempt, retry_of, requeued_as
            FROM jobs
            WHERE job_id = ?1
            "##,
        )?;

        let status = stmt
            .query_and_then([job_id], |row| {
                let status = JobStatus {
                    id: row.get(0).map_err(|e| Error::ColumnType(e, "id"))?,
                    job_type: row.get(1).map_err(|e| Error::ColumnType(e, "job_type"))?,
                    state: row
                        .get_ref(2)?
                        .as_str()
                        .map_err(|e| Error::ColumnType(e.into(), "state"))?
                        .parse()?,
                    payload: row.get(3)?,
                    claimed_by: row.get(4)?,
                    claimed_at: timestamp_column(row, 5, "claimed_at")?,
                    error_info: row.get(6)?,
                    added_at: timestamp_column(row, 7, "added_at")?
                        .ok_or(Error::TimestampOutOfRange("added_at"))?,
                    started_at: timestamp_column(row, 8, "started_at")?,
                    finished_at: timestamp_column(row, 9, "finished_at")?,
                    attempt: row.get(10)?,
                    retry_of: row.get(11)?,
                    requeued_as: row.get(12)?,
                };

                Ok::<_, Error>(status)
            })?
            .next()
            .transpose()?;

        Ok(status)
    }

    /// Return information about a job
    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatus> {
        let conn = self.state.read_conn_pool.get().await?;

        let status = conn
            .interact(move |conn| Self::run_job_status_query(conn, job_id))
            .await??;

        status.ok_or(Error::NotFound)
    }

    /// Return counts of the jobs in each state.
    pub async fn job_counts(&self) -> Result<JobCounts> {
        let conn = self.state.read_conn_pool.get().await?;
        let counts = conn
            .interact(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r##"SELECT state, COUNT(*) FROM jobs GROUP BY state"##,
                )?;
                let rows = stmt.query_and_then([], |row| {
                    let state: JobState = row
                        .get_ref(0)?
                        .as_str()
                        .map_err(|e| Error::ColumnType(e.into(), "state"))?
                        .parse()?;
                    let count: i64 = row.get(1)?;
                    Ok::<_, Error>((state, count as u64))
                })?;

                let mut counts = JobCounts::default();
                for row in rows {
                    let (state, count) = row?;
                    match state {
                        JobState::Pending => counts.pending = count,
                        JobState::InProgress => counts.in_progress = count,
                        JobState::Completed => counts.completed = count,
                        JobState::Failed => counts.failed = count,
                    }
                }
                Ok::<_, Error>(counts)
            })
            .await??;

        Ok(counts)
    }

    /// Check that the store can be read and written. This fails with [Error::QueueClosed] once the
    /// queue is closing, and otherwise runs a trivial query against the jobs table through the
    /// read pool.
    pub async fn health_check(&self) -> Result<()> {
        if self.state.db_write_tx.is_closed() || self.state.close.has_changed().unwrap_or(true) {
            return Err(Error::QueueClosed);
        }

        let conn = self.state.read_conn_pool.get().await?;
        conn.interact(|conn| {
            conn.query_row("SELECT 1 FROM jobs LIMIT 1", [], |_| Ok(()))
                .optional()
        })
        .await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            JobState::Pending,
            JobState::InProgress,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }

    #[test]
    fn unknown_state() {
        let err = "running".parse::<JobState>().unwrap_err();
        assert!(matches!(err, Error::InvalidJobState(s) if s == "running"));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::InProgress.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let test = crate::test_util::TestEnvironment::new().await;
        let err = test.queue.get_job_status(12345).await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn health_check_on_empty_queue() {
        let test = crate::test_util::TestEnvironment::new().await;
        test.queue.health_check().await.unwrap();
        assert_eq!(test.queue.job_counts().await.unwrap(), JobCounts::default());
    }

    #[tokio::test]
    async fn health_check_fails_after_close() {
        let test = crate::test_util::TestEnvironment::new().await;
        test.queue.close(std::time::Duration::from_secs(1)).await.unwrap();

        let err = test.queue.health_check().await.unwrap_err();
        assert!(matches!(err, Error::QueueClosed));
        assert!(err.is_store_unavailable());
    }
}
