use rusqlite::Connection;
use tracing::{event, instrument, Level};

use super::finish::{do_finish_job, JobOutcome};
use crate::{error::Result, JobId, JobRecoveryBehavior};

/// Handle jobs that were still claimed when the process quit last time.
#[instrument(skip_all)]
pub(crate) fn handle_abandoned_jobs_at_startup(
    behavior: JobRecoveryBehavior,
    now: i64,
    conn: &mut Connection,
) -> Result<usize> {
    if matches!(behavior, JobRecoveryBehavior::LeaveInProgress) {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    let abandoned = {
        let mut stmt = tx.prepare_cached(
            r##"SELECT job_id, claimed_by
            FROM jobs
            WHERE state = 'in_progress'
            ORDER BY job_id"##,
        )?;

        let rows = stmt
            .query_map([], |row| {
                let job_id: JobId = row.get(0)?;
                let claimed_by: Option<String> = row.get(1)?;
                Ok((job_id, claimed_by.unwrap_or_default()))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (job_id, claimed_by) in &rows {
            event!(Level::WARN, %job_id, %claimed_by, "Failing job abandoned by a previous run");
            let reason = format!(
                "job abandoned: claim held by {claimed_by} when the queue restarted"
            );
            do_finish_job(&tx, *job_id, claimed_by, &JobOutcome::Failed(reason), now)?;
        }

        rows.len()
    };

    tx.commit()?;

    Ok(abandoned)
}
