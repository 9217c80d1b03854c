use std::ops::Deref;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::Span;

use crate::db_writer::{DbOperation, DbOperationType};
use crate::{Error, Result};

pub(crate) struct SharedStateData {
    pub db_write_tx: mpsc::Sender<DbOperation>,
    /// Separate pool for miscellaneous read-only calls so they won't block the writes.
    pub read_conn_pool: deadpool_sqlite::Pool,
    /// Wakes one idle worker in this process when a job is inserted.
    pub job_available: Notify,
    pub close: tokio::sync::watch::Receiver<()>,
    /// Number of worker routines currently attached to this queue.
    pub worker_count_tx: tokio::sync::watch::Sender<usize>,
    pub time: Time,
}

#[derive(Clone)]
pub(crate) struct SharedState(pub Arc<SharedStateData>);

impl Deref for SharedState {
    type Target = Arc<SharedStateData>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SharedState {
    pub(crate) fn worker_started(&self) {
        self.worker_count_tx.send_modify(|count| *count += 1);
    }

    pub(crate) fn worker_stopped(&self) {
        self.worker_count_tx
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Send an operation to the writer thread and wait for its result.
    pub(crate) async fn write<T>(
        &self,
        operation: impl FnOnce(oneshot::Sender<Result<T>>) -> DbOperationType,
    ) -> Result<T> {
        let (result_tx, result_rx) = oneshot::channel();
        self.db_write_tx
            .send(DbOperation {
                span: Span::current(),
                operation: operation(result_tx),
            })
            .await
            .map_err(|_| Error::QueueClosed)?;

        result_rx.await.map_err(|_| Error::QueueClosed)?
    }
}

#[derive(Clone)]
pub(crate) struct Time {
    start_instant: tokio::time::Instant,
    start_time: time::OffsetDateTime,
}

impl Time {
    pub fn new() -> Self {
        let start_instant = tokio::time::Instant::now();
        let start_time = time::OffsetDateTime::now_utc();

        Time {
            start_instant,
            start_time,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        let now = self.start_instant.elapsed();
        self.start_time + now
    }
}
