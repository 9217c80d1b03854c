use std::{
    borrow::Borrow,
    fmt::{Debug, Display},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use ahash::HashMap;
use futures::{future::BoxFuture, Future, FutureExt};
use tracing::{event, Level};

use crate::{job::ClaimedJob, SmartString};

pub(crate) type JobFn<CONTEXT> =
    Arc<dyn Fn(ClaimedJob, CONTEXT) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// The handlers a [WorkerPool](crate::WorkerPool) can dispatch to, keyed by job type.
///
/// The registry is built once at startup by the embedding application. Lookup is by exact match
/// on the job type.
pub struct JobRegistry<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    pub(crate) jobs: HashMap<SmartString, JobRunner<CONTEXT>>,
}

impl<CONTEXT> JobRegistry<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    /// Create a new job registry from a list of [JobRunners](JobRunner).
    ///
    /// Panics if two runners share a job type.
    pub fn new<JOBLIST>(jobs: JOBLIST) -> JobRegistry<CONTEXT>
    where
        JOBLIST: IntoIterator,
        JOBLIST::Item: Borrow<JobRunner<CONTEXT>>,
    {
        let mut registry = JobRegistry {
            jobs: HashMap::default(),
        };

        for job in jobs {
            registry.add(job.borrow());
        }

        registry
    }

    /// Add a [JobRunner] to an existing registry.
    ///
    /// Panics if a runner for the same job type is already registered.
    pub fn add(&mut self, job: &JobRunner<CONTEXT>) {
        self.jobs
            .entry(job.name.clone())
            .and_modify(|_| {
                panic!("Job {} already exists", job.name);
            })
            .or_insert_with(|| job.clone());
    }

    /// Look up the runner for a job type.
    pub fn get(&self, job_type: &str) -> Option<&JobRunner<CONTEXT>> {
        self.jobs.get(job_type)
    }

    /// The job types that have a registered runner.
    pub fn job_types(&self) -> Vec<String> {
        let mut types = self
            .jobs
            .keys()
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        types.sort();
        types
    }

    /// Returns true if no runners are registered.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// A handler for one job type: the name of the job type and the function that runs it.
///
/// The function should be an `async` function that takes a [ClaimedJob] and a context object, and
/// returns a `Result`. An `Err` value, a panic, or an elapsed [timeout](JobRunnerBuilder::timeout)
/// marks the job as failed, using the error's `Display` output as the failure reason.
///
/// ```
/// # use durq::*;
/// # use std::sync::Arc;
/// #[derive(Debug)]
/// pub struct JobContext {
///   // database pool or other things here
/// }
///
/// let job = JobRunner::builder("a_job", |job: ClaimedJob, context: Arc<JobContext>| async move {
///   // do some work
///   Ok::<_, Error>(())
/// }).build();
///
/// async fn another_job(job: ClaimedJob, context: Arc<JobContext>) -> Result<String, Error> {
///   Ok("optional info about the success".to_string())
/// }
///
/// let another_job = JobRunner::builder("another_job", another_job)
///     .timeout(std::time::Duration::from_secs(30))
///     .build();
/// ```
#[derive(Clone)]
pub struct JobRunner<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    pub(crate) name: SmartString,
    pub(crate) runner: JobFn<CONTEXT>,
    pub(crate) timeout: Option<Duration>,
}

impl<CONTEXT> JobRunner<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    /// Create a new [JobRunner] with no timeout. Use [JobRunner::builder] to set other options.
    pub fn new<F, Fut, T, E>(name: impl Into<SmartString>, runner: F) -> JobRunner<CONTEXT>
    where
        F: Fn(ClaimedJob, CONTEXT) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + Debug + 'static,
        E: Send + Display + 'static,
    {
        let f = move |job: ClaimedJob, context: CONTEXT| {
            let runner = runner.clone();
            async move {
                match runner(job, context).await {
                    Ok(info) => {
                        event!(Level::DEBUG, ?info, "handler succeeded");
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            }
            .boxed()
        };

        JobRunner {
            name: name.into(),
            runner: Arc::new(f),
            timeout: None,
        }
    }

    /// Create a [JobRunnerBuilder] for this job.
    pub fn builder<F, Fut, T, E>(
        name: impl Into<SmartString>,
        runner: F,
    ) -> JobRunnerBuilder<CONTEXT>
    where
        F: Fn(ClaimedJob, CONTEXT) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + Debug + 'static,
        E: Send + Display + 'static,
    {
        let def = JobRunner::new(name, runner);
        JobRunnerBuilder { def }
    }

    /// The job type this runner handles.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the handler, turning errors, panics, and an elapsed timeout into a failure reason.
    pub(crate) async fn run(&self, job: ClaimedJob, context: CONTEXT) -> Result<(), String> {
        let fut = AssertUnwindSafe((self.runner)(job, context)).catch_unwind();

        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => return Err(format!("handler timed out after {}ms", timeout.as_millis())),
            },
            None => fut.await,
        };

        match result {
            Ok(result) => result,
            Err(e) => {
                let msg = if let Some(s) = e.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = e.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Panic".to_string()
                };

                Err(format!("handler panicked: {msg}"))
            }
        }
    }
}

/// A builder object for a [JobRunner].
pub struct JobRunnerBuilder<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    def: JobRunner<CONTEXT>,
}

impl<CONTEXT> JobRunnerBuilder<CONTEXT>
where
    CONTEXT: Send + Sync + Debug + Clone + 'static,
{
    /// Fail the job if the handler runs longer than `timeout`. By default handlers have no
    /// deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.def.timeout = Some(timeout);
        self
    }

    /// Consume the builder, returning a [JobRunner].
    pub fn build(self) -> JobRunner<CONTEXT> {
        self.def
    }
}
