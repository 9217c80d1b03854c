use rusqlite::{named_params, Connection};
use tokio::sync::oneshot;

use super::{DbOperationResult, OperationResult};
use crate::{JobId, Result};

/// A validated job, ready to be written.
#[derive(Debug, Clone)]
pub(crate) struct NewJob {
    pub job_type: String,
    pub payload: Vec<u8>,
}

pub(crate) struct InsertJobsArgs {
    pub jobs: Vec<NewJob>,
    pub now: i64,
    pub result_tx: oneshot::Sender<Result<Vec<JobId>>>,
}

const INSERT_JOB_QUERY: &str = r##"
    INSERT INTO jobs
    (job_type, payload, state, added_at, attempt, retry_of)
    VALUES
    ($job_type, $payload, 'pending', $added_at, $attempt, $retry_of)
"##;

fn do_insert_jobs(tx: &Connection, jobs: Vec<NewJob>, now: i64) -> Result<Vec<JobId>> {
    let mut stmt = tx.prepare_cached(INSERT_JOB_QUERY)?;

    let mut ids = Vec::with_capacity(jobs.len());
    for job in jobs {
        stmt.execute(named_params! {
            "$job_type": job.job_type,
            "$payload": job.payload,
            "$added_at": now,
            "$attempt": 1,
            "$retry_of": None::<JobId>,
        })?;

        ids.push(tx.last_insert_rowid());
    }

    Ok(ids)
}

pub(super) fn insert_jobs(tx: &Connection, args: InsertJobsArgs) -> DbOperationResult {
    let InsertJobsArgs {
        jobs,
        now,
        result_tx,
    } = args;

    let result = do_insert_jobs(tx, jobs, now);
    DbOperationResult::InsertJobs(OperationResult { result, result_tx })
}
