use std::{
    path::Path,
    sync::{Arc, PoisonError},
    time::Duration,
};

use deadpool_sqlite::{Hook, HookError};
use rusqlite::Connection;
use tracing::{event, instrument, Level};

use crate::{
    db_writer::{
        claim::ClaimJobArgs,
        db_writer_worker,
        finish::{FinishJobArgs, JobOutcome},
        handle_abandoned_jobs_at_startup,
        insert::NewJob,
        DbOperation, DbOperationType,
    },
    error::*,
    job::ClaimedJob,
    shared_state::{SharedState, SharedStateData, Time},
    worker::log_error,
    EnqueueLimits, JobId, JobRecoveryBehavior, QueueClient,
};

/// Options used to configure a [Queue] instance.
pub struct QueueOptions<'a> {
    path: &'a Path,
    job_recovery_behavior: JobRecoveryBehavior,
    busy_timeout: Duration,
}

impl<'a> QueueOptions<'a> {
    /// Create a new options object for a [Queue]
    pub fn new(path: &'a Path) -> Self {
        QueueOptions {
            path,
            job_recovery_behavior: JobRecoveryBehavior::default(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Configure how the [Queue] treats jobs that were already marked as in progress when it
    /// starts. This usually indicates jobs that were left unfinished due to an unexpected process
    /// restart.
    pub fn job_recovery_behavior(mut self, behavior: JobRecoveryBehavior) -> Self {
        self.job_recovery_behavior = behavior;
        self
    }

    /// How long a write waits for another process holding the database lock before giving up.
    /// Defaults to 5 seconds.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Build a [Queue] from this options object.
    pub async fn build(self) -> Result<Queue> {
        Queue::with_options(self).await
    }
}

struct Tasks {
    close: tokio::sync::watch::Sender<()>,
    worker_count_rx: tokio::sync::watch::Receiver<usize>,
    db_write_worker: std::thread::JoinHandle<()>,
}

/// The queue itself: the job store and the writer thread that owns its write connection.
///
/// Several [Queue] handles, in one process or in several, may open the same database file. Claims
/// are serialized by SQLite's write lock, so a pending job is only ever claimed once.
pub struct Queue {
    pub(crate) state: SharedState,
    tasks: std::sync::Mutex<Option<Tasks>>,
}

fn open_write_connection(options: &QueueOptions<'_>) -> Result<Connection> {
    let mut conn = Connection::open(options.path).map_err(Error::open_database)?;
    let journal_mode = conn
        .pragma_update_and_check(None, "journal_mode", "wal", |row| row.get::<_, String>(0))
        .map_err(Error::open_database)?;
    event!(Level::DEBUG, %journal_mode, "Opened database");
    conn.pragma_update(None, "synchronous", "normal")
        .map_err(Error::open_database)?;
    conn.busy_timeout(options.busy_timeout)
        .map_err(Error::open_database)?;
    rusqlite::vtab::array::load_module(&conn).map_err(Error::open_database)?;

    crate::migrations::migrate(&mut conn)?;
    Ok(conn)
}

impl Queue {
    /// Open or create a Queue database at the given path.
    pub async fn new(file: &Path) -> Result<Queue> {
        Queue::with_options(QueueOptions::new(file)).await
    }

    /// Create a builder object for a Queue
    pub fn builder(path: &Path) -> QueueOptions {
        QueueOptions::new(path)
    }

    /// Open or create a Queue database with the given [QueueOptions].
    #[instrument(skip_all, fields(path = %options.path.display()))]
    pub async fn with_options(options: QueueOptions<'_>) -> Result<Queue> {
        let mut conn = open_write_connection(&options)?;

        let (close_tx, close_rx) = tokio::sync::watch::channel(());

        let busy_timeout = options.busy_timeout;
        let read_conn_pool = deadpool_sqlite::Config::new(options.path)
            .builder(deadpool_sqlite::Runtime::Tokio1)
            .map_err(Error::open_database)?
            .recycle_timeout(Some(Duration::from_secs(5 * 60)))
            .post_create(Hook::async_fn(move |conn, _| {
                Box::pin(async move {
                    conn.interact(move |conn| conn.busy_timeout(busy_timeout))
                        .await
                        .map_err(|e| HookError::Message(e.to_string().into()))?
                        .map_err(HookError::Backend)?;

                    Ok(())
                })
            }))
            .build()
            .map_err(Error::open_database)?;

        let (worker_count_tx, worker_count_rx) = tokio::sync::watch::channel(0);
        let (db_write_tx, db_write_rx) = tokio::sync::mpsc::channel(50);

        let time = Time::new();

        // Handle any jobs that were not cleanly finished from a previous run.
        let abandoned = handle_abandoned_jobs_at_startup(
            options.job_recovery_behavior,
            time.now().unix_timestamp(),
            &mut conn,
        )?;
        if abandoned > 0 {
            event!(Level::WARN, %abandoned, "Failed jobs abandoned by a previous run");
        }

        let shared_state = SharedState(Arc::new(SharedStateData {
            read_conn_pool,
            job_available: tokio::sync::Notify::new(),
            close: close_rx,
            worker_count_tx,
            time,
            db_write_tx,
        }));

        let db_write_worker = std::thread::spawn(move || db_writer_worker(conn, db_write_rx));

        let q = Queue {
            state: shared_state,
            tasks: std::sync::Mutex::new(Some(Tasks {
                close: close_tx,
                worker_count_rx,
                db_write_worker,
            })),
        };

        Ok(q)
    }

    /// Create a [QueueClient] that enqueues jobs with the default [EnqueueLimits].
    pub fn client(&self) -> QueueClient {
        QueueClient::new(self, EnqueueLimits::default())
    }

    /// Create a [QueueClient] with custom [EnqueueLimits].
    pub fn client_with_limits(&self, limits: EnqueueLimits) -> QueueClient {
        QueueClient::new(self, limits)
    }

    /// Insert a job and return its id. Ids are assigned by the store and increase with each
    /// insert.
    ///
    /// This writes exactly what it is given. Use a [QueueClient] to validate the job first.
    pub async fn insert(&self, job_type: &str, payload: Vec<u8>) -> Result<JobId> {
        let ids = self
            .state
            .insert_jobs(vec![NewJob {
                job_type: job_type.to_string(),
                payload,
            }])
            .await?;

        ids.into_iter()
            .next()
            .ok_or_else(|| Error::CommitFailed("insert returned no id".to_string()))
    }

    /// Insert several jobs in one transaction. Either all of them are inserted or none are, and
    /// the returned ids are in the same order as the input.
    pub async fn insert_many(
        &self,
        jobs: impl IntoIterator<Item = (String, Vec<u8>)>,
    ) -> Result<Vec<JobId>> {
        let jobs = jobs
            .into_iter()
            .map(|(job_type, payload)| NewJob { job_type, payload })
            .collect();
        self.state.insert_jobs(jobs).await
    }

    /// Claim the oldest pending job of any type for `worker_id`, moving it to `in_progress`.
    /// Returns `None` if no job is pending.
    ///
    /// No two callers can claim the same job, even across processes sharing the database.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>> {
        self.state.claim_next(&Arc::from(worker_id), None).await
    }

    /// Like [Queue::claim_next], but only considers jobs whose type is in `job_types`.
    pub async fn claim_next_of_types(
        &self,
        worker_id: &str,
        job_types: &[String],
    ) -> Result<Option<ClaimedJob>> {
        self.state
            .claim_next(&Arc::from(worker_id), Some(Arc::from(job_types)))
            .await
    }

    /// Mark a job held by `worker_id` as completed.
    ///
    /// Returns [Error::NotFound] if the job does not exist, or [Error::NotClaimed] if it is not
    /// currently in progress under `worker_id`.
    pub async fn complete(&self, job_id: JobId, worker_id: &str) -> Result<()> {
        self.state
            .finish_job(job_id, worker_id, JobOutcome::Completed)
            .await
    }

    /// Mark a job held by `worker_id` as failed, recording `reason`.
    ///
    /// Returns the same errors as [Queue::complete].
    pub async fn fail(&self, job_id: JobId, worker_id: &str, reason: impl Into<String>) -> Result<()> {
        self.state
            .finish_job(job_id, worker_id, JobOutcome::Failed(reason.into()))
            .await
    }

    async fn wait_for_workers_to_stop(tasks: &mut Tasks, timeout: Duration) -> Result<()> {
        if *tasks.worker_count_rx.borrow_and_update() == 0 {
            return Ok(());
        }

        let timeout = tokio::time::sleep(timeout);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => return Err(Error::Timeout),
                res = tasks.worker_count_rx.changed() => {
                    if res.is_err() || *tasks.worker_count_rx.borrow() == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn close_internal(mut tasks: Tasks, state: SharedState, timeout: Duration) -> Result<()> {
        tasks.close.send(()).ok();

        let res = Self::wait_for_workers_to_stop(&mut tasks, timeout).await;

        state
            .db_write_tx
            .send(DbOperation {
                span: tracing::Span::current(),
                operation: DbOperationType::Close,
            })
            .await
            .ok();

        log_error(tokio::task::spawn_blocking(|| tasks.db_write_worker.join()).await);
        event!(Level::INFO, "Queue closed");

        res
    }

    /// Stop the queue, and wait for attached workers to finish their current jobs. After this
    /// returns, every store operation on this handle fails with [Error::QueueClosed].
    #[instrument(skip(self))]
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let tasks = {
            let mut tasks_holder = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks_holder.take()
        };

        if let Some(tasks) = tasks {
            Self::close_internal(tasks, self.state.clone(), timeout).await?;
        }

        Ok(())
    }
}

impl Drop for Queue {
    /// Try to close the queue cleanly as it's dropped.
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tasks) = tasks.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(Self::close_internal(
                    tasks,
                    self.state.clone(),
                    Duration::from_secs(60),
                ));
            }
        }
    }
}

impl SharedState {
    pub(crate) async fn insert_jobs(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>> {
        let now = self.time.now().unix_timestamp();
        let ids = self
            .write(|result_tx| {
                DbOperationType::InsertJobs(crate::db_writer::insert::InsertJobsArgs {
                    jobs,
                    now,
                    result_tx,
                })
            })
            .await?;

        for _ in &ids {
            self.job_available.notify_one();
        }

        Ok(ids)
    }

    pub(crate) async fn claim_next(
        &self,
        worker_id: &Arc<str>,
        job_types: Option<Arc<[String]>>,
    ) -> Result<Option<ClaimedJob>> {
        let now = self.time.now();
        self.write(|result_tx| {
            DbOperationType::ClaimJob(ClaimJobArgs {
                worker_id: worker_id.clone(),
                job_types,
                now,
                result_tx,
            })
        })
        .await
    }

    pub(crate) async fn finish_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> Result<()> {
        let now = self.time.now().unix_timestamp();
        self.write(|result_tx| {
            DbOperationType::FinishJob(FinishJobArgs {
                job_id,
                worker_id: worker_id.to_string(),
                outcome,
                now,
                result_tx,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, time::Duration};

    use temp_dir::TempDir;

    use crate::{
        test_util::{create_test_queue, queue_db_path, TestEnvironment},
        Error, ErrorKind, JobRecoveryBehavior, JobState, Queue,
    };

    #[tokio::test]
    async fn create_queue() {
        let dir = TempDir::new().unwrap();
        create_test_queue(dir).await;
    }

    #[tokio::test]
    async fn ids_increase() {
        let test = TestEnvironment::new().await;
        let mut last = 0;
        for i in 0..20 {
            let id = test
                .queue
                .insert("echo", format!("job {i}").into_bytes())
                .await
                .unwrap();
            assert!(id > last, "id {id} should be greater than {last}");
            last = id;
        }
    }

    #[tokio::test]
    async fn insert_many_keeps_input_order() {
        let test = TestEnvironment::new().await;
        let ids = test
            .queue
            .insert_many([
                ("echo".to_string(), b"a".to_vec()),
                ("boom".to_string(), b"b".to_vec()),
                ("echo".to_string(), b"c".to_vec()),
            ])
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        let status = test.queue.get_job_status(ids[1]).await.unwrap();
        assert_eq!(status.job_type, "boom");
        assert_eq!(status.payload, b"b");
    }

    #[tokio::test]
    async fn insert_many_is_all_or_nothing() {
        let test = TestEnvironment::new().await;
        // The schema rejects an empty job type, which rolls back the whole batch.
        let err = test
            .queue
            .insert_many([
                ("echo".to_string(), b"a".to_vec()),
                ("".to_string(), b"b".to_vec()),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);

        let counts = test.queue.job_counts().await.unwrap();
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_failure() {
        let test = TestEnvironment::new().await;
        let first = test.queue.insert("boom", b"x".to_vec()).await.unwrap();
        let job = test.queue.claim_next("w").await.unwrap().unwrap();
        test.queue.fail(job.id, "w", "nope").await.unwrap();

        let second = test.queue.insert("boom", b"x".to_vec()).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn claim_complete_lifecycle() {
        let test = TestEnvironment::new().await;
        let job_id = test.queue.insert("echo", b"hello".to_vec()).await.unwrap();

        let status = test.queue.get_job_status(job_id).await.unwrap();
        assert_eq!(status.state, JobState::Pending);
        assert_eq!(status.attempt, 1);
        assert!(status.claimed_by.is_none());

        let job = test.queue.claim_next("worker-a").await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(job.job_type, "echo");
        assert_eq!(job.payload, b"hello");
        assert_eq!(job.claimed_by, "worker-a");

        let status = test.queue.get_job_status(job_id).await.unwrap();
        assert_eq!(status.state, JobState::InProgress);
        assert_eq!(status.claimed_by.as_deref(), Some("worker-a"));
        assert!(status.claimed_at.is_some());
        assert!(status.started_at.is_some());

        assert!(test.queue.claim_next("worker-b").await.unwrap().is_none());

        test.queue.complete(job_id, "worker-a").await.unwrap();
        let status = test.queue.get_job_status(job_id).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert!(status.claimed_by.is_none());
        assert!(status.claimed_at.is_none());
        assert!(status.error_info.is_none());
        assert!(status.finished_at.is_some());
    }

    #[tokio::test]
    async fn fail_records_reason() {
        let test = TestEnvironment::new().await;
        let job_id = test.queue.insert("boom", b"x".to_vec()).await.unwrap();
        test.queue.claim_next("w").await.unwrap().unwrap();
        test.queue.fail(job_id, "w", "it broke").await.unwrap();

        let status = test.queue.get_job_status(job_id).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error_info.as_deref(), Some("it broke"));
        assert!(status.claimed_by.is_none());
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let test = TestEnvironment::new().await;
        let a = test.queue.insert("echo", b"a".to_vec()).await.unwrap();
        let b = test.queue.insert("echo", b"b".to_vec()).await.unwrap();

        assert_eq!(test.queue.claim_next("w").await.unwrap().unwrap().id, a);
        assert_eq!(test.queue.claim_next("w").await.unwrap().unwrap().id, b);
    }

    #[tokio::test]
    async fn claim_filtered_by_type() {
        let test = TestEnvironment::new().await;
        let other = test.queue.insert("other", b"".to_vec()).await.unwrap();
        let echo = test.queue.insert("echo", b"".to_vec()).await.unwrap();

        let job = test
            .queue
            .claim_next_of_types("w", &["echo".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, echo);

        assert!(test
            .queue
            .claim_next_of_types("w", &["echo".to_string()])
            .await
            .unwrap()
            .is_none());
        assert!(test
            .queue
            .claim_next_of_types("w", &[])
            .await
            .unwrap()
            .is_none());

        let status = test.queue.get_job_status(other).await.unwrap();
        assert_eq!(status.state, JobState::Pending);
    }

    #[tokio::test]
    async fn finishing_requires_the_claim() {
        let test = TestEnvironment::new().await;
        let job_id = test.queue.insert("echo", b"".to_vec()).await.unwrap();

        // Still pending
        let err = test.queue.complete(job_id, "w").await.unwrap_err();
        assert!(matches!(err, Error::NotClaimed { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        test.queue.claim_next("w").await.unwrap().unwrap();

        // Wrong worker
        let err = test.queue.fail(job_id, "someone-else", "x").await.unwrap_err();
        assert!(matches!(err, Error::NotClaimed { .. }));

        test.queue.complete(job_id, "w").await.unwrap();

        // Already finished
        let err = test.queue.complete(job_id, "w").await.unwrap_err();
        assert!(matches!(err, Error::NotClaimed { .. }));
        let status = test.queue.get_job_status(job_id).await.unwrap();
        assert_eq!(status.state, JobState::Completed);

        // Unknown id
        let err = test.queue.complete(job_id + 1000, "w").await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_are_unique() {
        let test = TestEnvironment::new().await;
        let jobs = (0..200).map(|i| ("echo".to_string(), format!("{i}").into_bytes()));
        let ids = test.queue.insert_many(jobs).await.unwrap();

        // Two independent handles on the same file stand in for two processes.
        let queues = [
            Arc::new(Queue::new(&test.queue.path).await.unwrap()),
            Arc::new(Queue::new(&test.queue.path).await.unwrap()),
        ];

        let mut tasks = Vec::new();
        for claimer in 0..10 {
            let queue = queues[claimer % 2].clone();
            tasks.push(tokio::spawn(async move {
                let worker_id = format!("claimer-{claimer}");
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim_next(&worker_id).await.unwrap() {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "job {id} was claimed twice");
            }
        }

        assert_eq!(seen, ids.into_iter().collect::<HashSet<_>>());
        for queue in queues {
            queue.close(Duration::from_secs(5)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn closed_queue_is_unavailable() {
        let test = TestEnvironment::new().await;
        test.queue.close(Duration::from_secs(1)).await.unwrap();

        let err = test.queue.insert("echo", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::QueueClosed));
        assert!(err.is_store_unavailable());

        let err = test.queue.claim_next("w").await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test]
    async fn open_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.child("missing").join("queue.sqlite");
        let err = Queue::new(&path).await.err().expect("open should fail");
        assert!(matches!(err, Error::OpenDatabase(_)));
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let queue = create_test_queue(dir).await;
        let job_id = queue.insert("echo", b"persist".to_vec()).await.unwrap();
        let dir = queue.close_and_persist().await;

        let queue = Queue::new(&queue_db_path(&dir)).await.unwrap();
        let status = queue.get_job_status(job_id).await.unwrap();
        assert_eq!(status.state, JobState::Pending);
        assert_eq!(status.payload, b"persist");

        let next = queue.insert("echo", b"".to_vec()).await.unwrap();
        assert!(next > job_id);
        queue.close(Duration::from_secs(1)).await.unwrap();
    }

    mod recovery {
        use super::*;

        #[tokio::test]
        async fn abandoned_jobs_fail_at_startup() {
            let dir = TempDir::new().unwrap();
            let queue = create_test_queue(dir).await;
            let job_id = queue.insert("echo", b"".to_vec()).await.unwrap();
            queue.claim_next("crashed-worker").await.unwrap().unwrap();
            let dir = queue.close_and_persist().await;

            let queue = Queue::builder(&queue_db_path(&dir))
                .job_recovery_behavior(JobRecoveryBehavior::FailAbandoned)
                .build()
                .await
                .unwrap();
            let status = queue.get_job_status(job_id).await.unwrap();
            assert_eq!(status.state, JobState::Failed);
            assert_eq!(
                status.error_info.as_deref(),
                Some("job abandoned: claim held by crashed-worker when the queue restarted")
            );
            queue.close(Duration::from_secs(1)).await.unwrap();
        }

        #[tokio::test]
        async fn opening_a_second_handle_keeps_live_claims() {
            let dir = TempDir::new().unwrap();
            let queue = create_test_queue(dir).await;
            let job_id = queue.insert("echo", b"".to_vec()).await.unwrap();
            queue.claim_next("live-worker").await.unwrap().unwrap();

            let second = Queue::new(&queue.path).await.unwrap();
            let status = second.get_job_status(job_id).await.unwrap();
            assert_eq!(status.state, JobState::InProgress);
            assert_eq!(status.error_info, None);

            queue.complete(job_id, "live-worker").await.unwrap();
            let status = second.get_job_status(job_id).await.unwrap();
            assert_eq!(status.state, JobState::Completed);

            second.close(Duration::from_secs(1)).await.unwrap();
            queue.close(Duration::from_secs(1)).await.unwrap();
        }

        #[tokio::test]
        async fn leave_in_progress() {
            let dir = TempDir::new().unwrap();
            let queue = create_test_queue(dir).await;
            let job_id = queue.insert("echo", b"".to_vec()).await.unwrap();
            queue.claim_next("other-process").await.unwrap().unwrap();
            let dir = queue.close_and_persist().await;

            let queue = Queue::builder(&queue_db_path(&dir))
                .job_recovery_behavior(JobRecoveryBehavior::LeaveInProgress)
                .build()
                .await
                .unwrap();
            let status = queue.get_job_status(job_id).await.unwrap();
            assert_eq!(status.state, JobState::InProgress);
            assert_eq!(status.claimed_by.as_deref(), Some("other-process"));

            queue.complete(job_id, "other-process").await.unwrap();
            queue.close(Duration::from_secs(1)).await.unwrap();
        }
    }
}
