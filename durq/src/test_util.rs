use std::{
    fmt::Display,
    ops::Deref,
    path::PathBuf,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use futures::Future;
use once_cell::sync::Lazy;
use temp_dir::TempDir;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::{
    job::ClaimedJob,
    job_registry::{JobRegistry, JobRunner},
    job_status::JobStatus,
    worker::{WorkerPool, WorkerPoolBuilder},
    JobId, JobState, Queue,
};

#[derive(Debug)]
pub struct TestContext {
    pub counter: AtomicUsize,
    pub values: Mutex<Vec<String>>,
    pub claims: Mutex<Vec<JobId>>,
    pub watch_rx: tokio::sync::watch::Receiver<usize>,
    pub watch_tx: tokio::sync::watch::Sender<usize>,
}

impl TestContext {
    pub fn new() -> Arc<TestContext> {
        let (watch_tx, watch_rx) = tokio::sync::watch::channel(0);
        Arc::new(TestContext {
            counter: AtomicUsize::new(0),
            values: Mutex::new(Vec::new()),
            claims: Mutex::new(Vec::new()),
            watch_rx,
            watch_tx,
        })
    }

    pub async fn push_str(&self, s: impl ToString) {
        let mut values = self.values.lock().await;
        values.push(s.to_string());
    }

    pub async fn get_values(&self) -> Vec<String> {
        let values = self.values.lock().await;
        values.clone()
    }

    pub async fn record_claim(&self, id: JobId) {
        self.claims.lock().await.push(id);
    }

    pub async fn get_claims(&self) -> Vec<JobId> {
        self.claims.lock().await.clone()
    }
}

pub struct TestQueue {
    queue: Queue,
    pub path: PathBuf,
    #[allow(dead_code)]
    dir: TempDir,
}

impl Deref for TestQueue {
    type Target = Queue;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

impl TestQueue {
    pub async fn close_and_persist(self) -> TempDir {
        self.queue
            .close(Duration::from_secs(1))
            .await
            .expect("closing queue");
        self.dir
    }
}

pub fn queue_db_path(dir: &TempDir) -> PathBuf {
    dir.child("test.sqlite")
}

pub async fn create_test_queue(dir: TempDir) -> TestQueue {
    let path = queue_db_path(&dir);
    let queue = crate::Queue::new(&path).await.unwrap();

    TestQueue { queue, path, dir }
}

pub fn job_list() -> Vec<JobRunner<Arc<TestContext>>> {
    // Succeeds, and records the payload.
    let echo = JobRunner::builder("echo", |job: ClaimedJob, context: Arc<TestContext>| async move {
        context.record_claim(job.id).await;
        context
            .push_str(String::from_utf8_lossy(&job.payload))
            .await;
        Ok::<_, String>(())
    })
    .build();

    let boom = JobRunner::builder("boom", |job: ClaimedJob, context: Arc<TestContext>| async move {
        context.record_claim(job.id).await;
        Err::<(), _>(format!(
            "boom: {}",
            String::from_utf8_lossy(&job.payload)
        ))
    })
    .build();

    let counter = JobRunner::builder(
        "counter",
        |job: ClaimedJob, context: Arc<TestContext>| async move {
            context.record_claim(job.id).await;
            let payload: usize = job.json_payload().unwrap_or(1);
            context
                .counter
                .fetch_add(payload, std::sync::atomic::Ordering::Relaxed);
            Ok::<_, String>("passed")
        },
    )
    .build();

    let wait_for_watch = JobRunner::builder(
        "wait_for_watch",
        |job: ClaimedJob, context: Arc<TestContext>| async move {
            let watch_value = job
                .json_payload::<usize>()
                .expect("payload is not a number");
            let mut watch_rx = context.watch_rx.clone();
            while watch_rx.borrow().deref() != &watch_value {
                watch_rx.changed().await.expect("watch_rx changed");
            }
            Ok::<_, String>(())
        },
    )
    .build();

    vec![echo, boom, counter, wait_for_watch]
}

pub(crate) struct TestEnvironment {
    pub queue: TestQueue,
    pub registry: JobRegistry<Arc<TestContext>>,
    pub context: Arc<TestContext>,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self::from_path(dir).await
    }

    pub async fn from_path(dir: TempDir) -> Self {
        Lazy::force(&TRACING);
        let queue = create_test_queue(dir).await;

        let registry = JobRegistry::new(job_list());

        TestEnvironment {
            queue,
            registry,
            context: TestContext::new(),
        }
    }

    /// A worker pool builder with every test job registered and a short poll interval.
    pub fn worker_pool(&self) -> WorkerPoolBuilder<Arc<TestContext>> {
        WorkerPool::builder(&self.queue, self.context.clone())
            .registry(&self.registry)
            .name("test")
            .poll_interval(Duration::from_millis(50))
    }
}

pub async fn wait_for<F, Fut, T, E>(label: impl Display, f: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let timeout = Duration::from_secs(5);
    let max_check = 1000;
    let mut check_interval = 10;
    let start_time = OffsetDateTime::now_utc();
    let final_time = start_time + timeout;
    let mut last_error: E;

    loop {
        tokio::task::yield_now().await;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                tracing::trace!(%label, %e, "Checking... not ready yet");
                last_error = e;
            }
        };

        let now = OffsetDateTime::now_utc();
        if now >= final_time {
            panic!(
                "Timed out waiting for {} after {}ms: {}",
                label,
                timeout.as_millis(),
                last_error
            );
        }

        check_interval = std::cmp::min(check_interval * 2, max_check);
        let sleep_time = std::cmp::min(
            (final_time - now).whole_milliseconds() as u64,
            check_interval,
        );

        tokio::time::sleep(Duration::from_millis(sleep_time)).await;
    }
}

pub async fn wait_for_job(label: impl Display, queue: &Queue, job_id: JobId) -> JobStatus {
    wait_for_job_status(label, queue, job_id, JobState::Completed).await
}

pub async fn wait_for_job_fn(
    label: impl Display,
    queue: &Queue,
    job_id: JobId,
    f: impl Fn(&JobStatus) -> bool,
) -> JobStatus {
    wait_for(label, || async {
        let status = match queue.get_job_status(job_id).await {
            Ok(status) => status,
            Err(crate::Error::NotFound) => return Err("Job status not found".to_string()),
            Err(e) => {
                panic!("{}", e);
            }
        };

        if f(&status) {
            Ok(status)
        } else {
            Err(format!("job status {:?}", status))
        }
    })
    .await
}

pub async fn wait_for_job_status(
    label: impl Display,
    queue: &Queue,
    job_id: JobId,
    desired_status: JobState,
) -> JobStatus {
    wait_for_job_fn(label, queue, job_id, |status| {
        status.state == desired_status
    })
    .await
}

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter};
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default()
        .with(EnvFilter::try_from_env("TEST_LOG").unwrap_or_else(|_| EnvFilter::new("debug")))
        .with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
