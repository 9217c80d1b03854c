use rusqlite::{named_params, Connection, OptionalExtension};
use tokio::sync::oneshot;

use super::{DbOperationResult, OperationResult};
use crate::{job_status::JobState, Error, JobId, Result};

/// The terminal state a worker is moving its job into.
#[derive(Debug, Clone)]
pub(crate) enum JobOutcome {
    Completed,
    Failed(String),
}

pub(crate) struct FinishJobArgs {
    pub job_id: JobId,
    pub worker_id: String,
    pub outcome: JobOutcome,
    pub now: i64,
    pub result_tx: oneshot::Sender<Result<()>>,
}

pub(crate) fn do_finish_job(
    tx: &Connection,
    job_id: JobId,
    worker_id: &str,
    outcome: &JobOutcome,
    now: i64,
) -> Result<()> {
    let (state, error_info) = match outcome {
        JobOutcome::Completed => (JobState::Completed, None),
        JobOutcome::Failed(reason) => (JobState::Failed, Some(reason.as_str())),
    };

    let mut stmt = tx.prepare_cached(
        r##"UPDATE jobs
        SET state = $state,
            error_info = $error_info,
            claimed_by = NULL,
            claimed_at = NULL,
            finished_at = $now
        WHERE job_id = $job_id AND state = 'in_progress' AND claimed_by = $worker_id"##,
    )?;

    let altered = stmt.execute(named_params! {
        "$state": state.as_str(),
        "$error_info": error_info,
        "$now": now,
        "$job_id": job_id,
        "$worker_id": worker_id,
    })?;

    if altered == 0 {
        let mut exists_stmt = tx.prepare_cached("SELECT 1 FROM jobs WHERE job_id = ?1")?;
        let exists = exists_stmt
            .query_row([job_id], |_| Ok(()))
            .optional()?
            .is_some();

        return if exists {
            Err(Error::NotClaimed {
                job_id,
                worker_id: worker_id.to_string(),
            })
        } else {
            Err(Error::NotFound)
        };
    }

    Ok(())
}

pub(super) fn finish_job(tx: &Connection, args: FinishJobArgs) -> DbOperationResult {
    let FinishJobArgs {
        job_id,
        worker_id,
        outcome,
        now,
        result_tx,
    } = args;

    let result = do_finish_job(tx, job_id, &worker_id, &outcome, now);
    DbOperationResult::FinishJob(OperationResult { result, result_tx })
}
