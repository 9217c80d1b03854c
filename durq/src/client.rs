use serde::Serialize;
use tracing::{event, instrument, Level};

use crate::{
    db_writer::insert::NewJob, shared_state::SharedState, Error, JobId, Queue, Result,
};

/// Bounds checked by a [QueueClient] before a job reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueLimits {
    /// The largest payload accepted, in bytes. Defaults to 1 MiB.
    pub max_payload_bytes: usize,
    /// The longest job type accepted, in bytes. Defaults to 255.
    pub max_job_type_len: usize,
}

impl Default for EnqueueLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            max_job_type_len: 255,
        }
    }
}

impl EnqueueLimits {
    /// Check a job against these limits.
    pub fn validate(&self, job_type: &str, payload: &[u8]) -> Result<()> {
        if job_type.is_empty() {
            return Err(Error::EmptyJobType);
        }

        if job_type.len() > self.max_job_type_len {
            return Err(Error::JobTypeTooLong {
                len: job_type.len(),
                limit: self.max_job_type_len,
            });
        }

        if payload.len() > self.max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        Ok(())
    }
}

/// The producer side of a [Queue]. Clients are cheap to clone and can be shared across tasks.
///
/// Every job is validated against the client's [EnqueueLimits] before it is written, so a
/// [Validation](crate::ErrorKind::Validation) error means nothing was stored.
#[derive(Clone)]
pub struct QueueClient {
    state: SharedState,
    limits: EnqueueLimits,
}

impl QueueClient {
    pub(crate) fn new(queue: &Queue, limits: EnqueueLimits) -> Self {
        Self {
            state: queue.state.clone(),
            limits,
        }
    }

    /// The limits this client enforces.
    pub fn limits(&self) -> EnqueueLimits {
        self.limits
    }

    /// Submit a job and return the id the store assigned to it.
    #[instrument(skip(self, payload))]
    pub async fn enqueue(&self, job_type: &str, payload: impl Into<Vec<u8>>) -> Result<JobId> {
        let payload = payload.into();
        self.limits.validate(job_type, &payload)?;

        let ids = self
            .state
            .insert_jobs(vec![NewJob {
                job_type: job_type.to_string(),
                payload,
            }])
            .await?;

        let id = ids
            .into_iter()
            .next()
            .ok_or_else(|| Error::CommitFailed("insert returned no id".to_string()))?;
        event!(Level::DEBUG, %id, "Enqueued job");
        Ok(id)
    }

    /// Serialize `payload` as JSON and submit it.
    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        job_type: &str,
        payload: &T,
    ) -> Result<JobId> {
        let payload = serde_json::to_vec(payload).map_err(Error::PayloadError)?;
        self.enqueue(job_type, payload).await
    }

    /// Submit several jobs at once. Every job is validated first, then all are inserted in a single
    /// transaction. The returned ids are in the same order as the input.
    #[instrument(skip_all, fields(count))]
    pub async fn enqueue_batch(
        &self,
        jobs: impl IntoIterator<Item = (String, Vec<u8>)>,
    ) -> Result<Vec<JobId>> {
        let jobs = jobs
            .into_iter()
            .map(|(job_type, payload)| {
                self.limits.validate(&job_type, &payload)?;
                Ok::<_, Error>(NewJob { job_type, payload })
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::Span::current().record("count", jobs.len());

        self.state.insert_jobs(jobs).await
    }
}
