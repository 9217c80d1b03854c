use rusqlite::{Connection, TransactionBehavior};
use tracing::{event, instrument, Level};

use self::{
    claim::{claim_job, ClaimJobArgs},
    finish::{finish_job, FinishJobArgs},
    insert::{insert_jobs, InsertJobsArgs},
    requeue::{requeue_failed, RequeueFailedArgs},
};
use crate::{
    error::Result, job::ClaimedJob, retry::RequeuedJob, worker::log_error, Error, JobId,
};

pub(crate) mod claim;
pub(crate) mod finish;
pub(crate) mod insert;
pub(crate) mod job_recovery;
pub(crate) mod requeue;

pub(crate) use job_recovery::handle_abandoned_jobs_at_startup;

pub(crate) struct DbOperation {
    pub operation: DbOperationType,
    pub span: tracing::Span,
}

pub(crate) enum DbOperationType {
    Close,
    InsertJobs(InsertJobsArgs),
    ClaimJob(ClaimJobArgs),
    FinishJob(FinishJobArgs),
    RequeueFailed(RequeueFailedArgs),
}

impl DbOperationType {
    /// Turn an operation that could not be attempted into a failed result for its caller.
    fn reject(self, message: &str) -> DbOperationResult {
        match self {
            DbOperationType::Close => DbOperationResult::Close,
            DbOperationType::InsertJobs(args) => DbOperationResult::InsertJobs(OperationResult {
                result: rejected(message),
                result_tx: args.result_tx,
            }),
            DbOperationType::ClaimJob(args) => DbOperationResult::ClaimJob(OperationResult {
                result: rejected(message),
                result_tx: args.result_tx,
            }),
            DbOperationType::FinishJob(args) => DbOperationResult::FinishJob(OperationResult {
                result: rejected(message),
                result_tx: args.result_tx,
            }),
            DbOperationType::RequeueFailed(args) => {
                DbOperationResult::RequeueFailed(OperationResult {
                    result: rejected(message),
                    result_tx: args.result_tx,
                })
            }
        }
    }
}

fn rejected<T>(message: &str) -> Result<T> {
    Err(Error::CommitFailed(message.to_string()))
}

pub(crate) struct OperationResult<T> {
    result: Result<T>,
    result_tx: tokio::sync::oneshot::Sender<Result<T>>,
}

impl<T> OperationResult<T> {
    /// The savepoint for this operation was released, but the enclosing transaction did not
    /// commit, so a successful result has to be turned into a failure.
    fn discard(&mut self, message: &str) {
        if self.result.is_ok() {
            self.result = Err(Error::CommitFailed(message.to_string()));
        }
    }
}

pub(crate) enum DbOperationResult {
    Close,
    InsertJobs(OperationResult<Vec<JobId>>),
    ClaimJob(OperationResult<Option<ClaimedJob>>),
    FinishJob(OperationResult<()>),
    RequeueFailed(OperationResult<Vec<RequeuedJob>>),
}

impl DbOperationResult {
    fn is_ok(&self) -> bool {
        match self {
            DbOperationResult::Close => true,
            DbOperationResult::InsertJobs(result) => result.result.is_ok(),
            DbOperationResult::ClaimJob(result) => result.result.is_ok(),
            DbOperationResult::FinishJob(result) => result.result.is_ok(),
            DbOperationResult::RequeueFailed(result) => result.result.is_ok(),
        }
    }

    fn discard(&mut self, message: &str) {
        match self {
            DbOperationResult::Close => {}
            DbOperationResult::InsertJobs(result) => result.discard(message),
            DbOperationResult::ClaimJob(result) => result.discard(message),
            DbOperationResult::FinishJob(result) => result.discard(message),
            DbOperationResult::RequeueFailed(result) => result.discard(message),
        }
    }

    fn send(self) {
        match self {
            DbOperationResult::Close => {}
            DbOperationResult::InsertJobs(result) => {
                result.result_tx.send(result.result).ok();
            }
            DbOperationResult::ClaimJob(result) => {
                result.result_tx.send(result.result).ok();
            }
            DbOperationResult::FinishJob(result) => {
                result.result_tx.send(result.result).ok();
            }
            DbOperationResult::RequeueFailed(result) => {
                result.result_tx.send(result.result).ok();
            }
        };
    }
}

#[instrument(level = "trace", skip_all, fields(count = %operations.len()))]
fn process_operations(conn: &mut Connection, operations: &mut Vec<DbOperation>) -> bool {
    let mut results = Vec::with_capacity(operations.len());
    let mut closed = false;

    // IMMEDIATE takes the database write lock up front. Another process sharing the file waits
    // on the busy timeout here instead of racing us between its read and its write.
    let mut tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(tx) => tx,
        Err(e) => {
            event!(Level::ERROR, %e, "failed to begin transaction");
            let message = e.to_string();
            for op in operations.drain(..) {
                if matches!(op.operation, DbOperationType::Close) {
                    closed = true;
                }
                op.operation.reject(&message).send();
            }
            return closed;
        }
    };

    for op in operations.drain(..) {
        let _span = op.span.enter();
        // Use savepoints within the batch to allow rollback as needed, but still a single
        // transaction for the whole batch since it's many times faster.
        match tx.savepoint() {
            Ok(mut sp) => {
                let result = match op.operation {
                    DbOperationType::InsertJobs(args) => insert_jobs(&sp, args),
                    DbOperationType::ClaimJob(args) => claim_job(&sp, args),
                    DbOperationType::FinishJob(args) => finish_job(&sp, args),
                    DbOperationType::RequeueFailed(args) => requeue_failed(&sp, args),
                    DbOperationType::Close => {
                        closed = true;
                        DbOperationResult::Close
                    }
                };

                let worked = result.is_ok();
                results.push(result);

                if worked {
                    log_error(sp.commit());
                } else {
                    log_error(sp.rollback());
                }
            }
            Err(e) => {
                event!(Level::ERROR, %e, "failed to create savepoint");
                results.push(op.operation.reject(&e.to_string()));
            }
        }
    }

    if let Err(e) = tx.commit() {
        event!(Level::ERROR, %e, "failed to commit batch");
        let message = e.to_string();
        for result in results.iter_mut() {
            result.discard(&message);
        }
    }

    for result in results {
        result.send();
    }

    closed
}

pub(crate) fn db_writer_worker(
    mut conn: Connection,
    mut operations_rx: tokio::sync::mpsc::Receiver<DbOperation>,
) {
    const BATCH_SIZE: usize = 50;
    let mut operations = Vec::with_capacity(BATCH_SIZE);
    loop {
        operations.truncate(0);

        match operations_rx.blocking_recv() {
            Some(op) => operations.push(op),
            None => break,
        }

        // Get additional operations, if any are waiting.
        // This lets us process multiple operations in a batch for better efficiency.
        while operations.len() < BATCH_SIZE {
            match operations_rx.try_recv() {
                Ok(operation) => operations.push(operation),
                // Treat "empty" and "closed" as the same here. If it's closed then
                // we'll leave the loop next time around, after processing the last jobs below.
                Err(_) => break,
            }
        }

        if process_operations(&mut conn, &mut operations) {
            break;
        }
    }

    // Anything still queued after a close is answered with QueueClosed when the channel drops.
    operations_rx.close();
    log_error(conn.close().map_err(|(_, e)| e));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::OffsetDateTime;
    use tokio::sync::oneshot;

    use super::*;
    use crate::{db_writer::finish::JobOutcome, retry::RetryPolicy};

    fn assert_rejected<T: std::fmt::Debug>(rx: oneshot::Receiver<Result<T>>) {
        let result = rx.blocking_recv().unwrap();
        assert!(
            matches!(&result, Err(Error::CommitFailed(message)) if message == "database is locked"),
            "unexpected result {result:?}"
        );
    }

    #[test]
    fn rejected_operations_report_failure() {
        let (insert_tx, insert_rx) = oneshot::channel();
        let (claim_tx, claim_rx) = oneshot::channel();
        let (finish_tx, finish_rx) = oneshot::channel();
        let (requeue_tx, requeue_rx) = oneshot::channel();

        let operations = vec![
            DbOperationType::InsertJobs(InsertJobsArgs {
                jobs: Vec::new(),
                now: 0,
                result_tx: insert_tx,
            }),
            DbOperationType::ClaimJob(ClaimJobArgs {
                worker_id: Arc::from("w"),
                job_types: None,
                now: OffsetDateTime::UNIX_EPOCH,
                result_tx: claim_tx,
            }),
            DbOperationType::FinishJob(FinishJobArgs {
                job_id: 1,
                worker_id: "w".to_string(),
                outcome: JobOutcome::Completed,
                now: 0,
                result_tx: finish_tx,
            }),
            DbOperationType::RequeueFailed(RequeueFailedArgs {
                policy: RetryPolicy::default(),
                now: 0,
                limit: 1,
                result_tx: requeue_tx,
            }),
        ];

        for op in operations {
            op.reject("database is locked").send();
        }

        assert_rejected(insert_rx);
        assert_rejected(claim_rx);
        assert_rejected(finish_rx);
        assert_rejected(requeue_rx);
    }
}
