use rusqlite::{named_params, Connection};
use tokio::sync::oneshot;

use super::{DbOperationResult, OperationResult};
use crate::{
    retry::{RequeuedJob, RetryPolicy},
    JobId, Result,
};

pub(crate) struct RequeueFailedArgs {
    pub policy: RetryPolicy,
    pub now: i64,
    pub limit: usize,
    pub result_tx: oneshot::Sender<Result<Vec<RequeuedJob>>>,
}

struct FailedJob {
    job_id: JobId,
    job_type: String,
    attempt: u32,
    finished_at: i64,
}

impl FailedJob {
    fn is_due(&self, policy: &RetryPolicy, now: i64) -> bool {
        let delay = i64::try_from(policy.delay_for_attempt(self.attempt).as_secs())
            .unwrap_or(i64::MAX);
        self.finished_at.saturating_add(delay) <= now
    }
}

// The payload is copied inside SQLite so the scan only reads the small columns.
const REQUEUE_JOB_QUERY: &str = r##"
    INSERT INTO jobs
    (job_type, payload, state, added_at, attempt, retry_of)
    SELECT job_type, payload, 'pending', $now, attempt + 1, job_id
    FROM jobs
    WHERE job_id = $job_id
"##;

fn do_requeue_failed(
    tx: &Connection,
    policy: RetryPolicy,
    now: i64,
    limit: usize,
) -> Result<Vec<RequeuedJob>> {
    let mut candidates_stmt = tx.prepare_cached(
        r##"SELECT job_id, job_type, attempt, finished_at
        FROM jobs
        WHERE state = 'failed' AND requeued_as IS NULL AND attempt < $max_attempts
            AND finished_at <= $now
        ORDER BY finished_at, job_id"##,
    )?;

    let mut due = Vec::new();
    let mut rows = candidates_stmt.query(named_params! {
        "$max_attempts": policy.max_attempts,
        "$now": now,
    })?;
    while let Some(row) = rows.next()? {
        let job = FailedJob {
            job_id: row.get(0)?,
            job_type: row.get(1)?,
            attempt: row.get(2)?,
            finished_at: row.get(3)?,
        };

        if job.is_due(&policy, now) {
            due.push(job);
            if due.len() >= limit {
                break;
            }
        }
    }
    drop(rows);

    let mut insert_stmt = tx.prepare_cached(REQUEUE_JOB_QUERY)?;
    let mut mark_stmt = tx.prepare_cached(
        r##"UPDATE jobs SET requeued_as = $new_job_id
        WHERE job_id = $job_id AND state = 'failed' AND requeued_as IS NULL"##,
    )?;

    let mut requeued = Vec::with_capacity(due.len());
    for job in due {
        insert_stmt.execute(named_params! {
            "$now": now,
            "$job_id": job.job_id,
        })?;
        let new_job_id = tx.last_insert_rowid();

        mark_stmt.execute(named_params! {
            "$new_job_id": new_job_id,
            "$job_id": job.job_id,
        })?;

        requeued.push(RequeuedJob {
            failed_job_id: job.job_id,
            new_job_id,
            job_type: job.job_type,
            attempt: job.attempt + 1,
        });
    }

    Ok(requeued)
}

pub(super) fn requeue_failed(tx: &Connection, args: RequeueFailedArgs) -> DbOperationResult {
    let RequeueFailedArgs {
        policy,
        now,
        limit,
        result_tx,
    } = args;

    let result = do_requeue_failed(tx, policy, now, limit);
    DbOperationResult::RequeueFailed(OperationResult { result, result_tx })
}
