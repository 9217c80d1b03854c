use std::{rc::Rc, sync::Arc};

use rusqlite::{named_params, types::Value, Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tokio::sync::oneshot;

use super::{DbOperationResult, OperationResult};
use crate::{job::ClaimedJob, Error, Result};

pub(crate) struct ClaimJobArgs {
    pub worker_id: Arc<str>,
    /// Only claim jobs of these types. `None` claims any type.
    pub job_types: Option<Arc<[String]>>,
    pub now: OffsetDateTime,
    pub result_tx: oneshot::Sender<Result<Option<ClaimedJob>>>,
}

// The subquery picks the oldest pending row and the UPDATE flips it in the same statement, inside
// a write transaction, so no other claimer can observe the row as pending in between.
const CLAIM_ANY_QUERY: &str = r##"
    UPDATE jobs
    SET state = 'in_progress', claimed_by = $worker_id, claimed_at = $now, started_at = $now
    WHERE job_id = (
        SELECT job_id FROM jobs
        WHERE state = 'pending'
        ORDER BY job_id
        LIMIT 1
    )
    RETURNING job_id, job_type, payload, attempt
"##;

const CLAIM_TYPED_QUERY: &str = r##"
    UPDATE jobs
    SET state = 'in_progress', claimed_by = $worker_id, claimed_at = $now, started_at = $now
    WHERE job_id = (
        SELECT job_id FROM jobs
        WHERE state = 'pending' AND job_type IN rarray($job_types)
        ORDER BY job_id
        LIMIT 1
    )
    RETURNING job_id, job_type, payload, attempt
"##;

fn do_claim_job(
    tx: &Connection,
    worker_id: Arc<str>,
    job_types: Option<Arc<[String]>>,
    now: OffsetDateTime,
) -> Result<Option<ClaimedJob>> {
    let now_ts = now.unix_timestamp();
    // Timestamps are stored with second resolution; report the claim time the way it was written.
    let claimed_at = OffsetDateTime::from_unix_timestamp(now_ts)
        .map_err(|_| Error::TimestampOutOfRange("claimed_at"))?;

    let build = |row: &Row| -> rusqlite::Result<ClaimedJob> {
        Ok(ClaimedJob {
            id: row.get(0)?,
            job_type: row.get(1)?,
            payload: row.get(2)?,
            attempt: row.get(3)?,
            claimed_by: worker_id.to_string(),
            claimed_at,
        })
    };

    let job = match job_types {
        None => {
            let mut stmt = tx.prepare_cached(CLAIM_ANY_QUERY)?;
            stmt.query_row(
                named_params! {
                    "$worker_id": worker_id.as_ref(),
                    "$now": now_ts,
                },
                build,
            )
            .optional()?
        }
        Some(job_types) if job_types.is_empty() => None,
        Some(job_types) => {
            let job_types = job_types
                .iter()
                .map(|s| Value::from(s.clone()))
                .collect::<Vec<_>>();
            let mut stmt = tx.prepare_cached(CLAIM_TYPED_QUERY)?;
            stmt.query_row(
                named_params! {
                    "$worker_id": worker_id.as_ref(),
                    "$now": now_ts,
                    "$job_types": Rc::new(job_types),
                },
                build,
            )
            .optional()?
        }
    };

    Ok(job)
}

pub(super) fn claim_job(tx: &Connection, args: ClaimJobArgs) -> DbOperationResult {
    let ClaimJobArgs {
        worker_id,
        job_types,
        now,
        result_tx,
    } = args;

    let result = do_claim_job(tx, worker_id, job_types, now);
    DbOperationResult::ClaimJob(OperationResult { result, result_tx })
}
