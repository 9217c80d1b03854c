use std::fmt::{Debug, Display};

use serde::Deserialize;
use time::OffsetDateTime;

use crate::{Error, JobId, Result};

/// A job that a worker has claimed from the store. The claim is held until the worker records
/// the job as completed or failed.
#[derive(Clone)]
pub struct ClaimedJob {
    /// The id the store assigned when the job was enqueued.
    pub id: JobId,
    /// The type of the job, which selects the handler that runs it.
    pub job_type: String,
    /// The payload of the job. JSON payloads can be parsed using [ClaimedJob::json_payload].
    pub payload: Vec<u8>,
    /// 1 for a newly enqueued job. Jobs re-inserted by a
    /// [RetrySupervisor](crate::RetrySupervisor) count up from there.
    pub attempt: u32,
    /// The worker holding the claim.
    pub claimed_by: String,
    /// When the claim was taken.
    pub claimed_at: OffsetDateTime,
}

impl ClaimedJob {
    /// Deserialize a JSON payload into the requested type.
    pub fn json_payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        serde_json::from_slice(self.payload.as_slice()).map_err(Error::PayloadError)
    }
}

impl Debug for ClaimedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedJob")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .field("claimed_by", &self.claimed_by)
            .field("claimed_at", &self.claimed_at)
            .finish()
    }
}

impl Display for ClaimedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Job {{ id: {}, job_type: {}, attempt: {}, claimed_by: {} }}",
            self.id, self.job_type, self.attempt, self.claimed_by
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(payload: &[u8]) -> ClaimedJob {
        ClaimedJob {
            id: 7,
            job_type: "echo".to_string(),
            payload: payload.to_vec(),
            attempt: 1,
            claimed_by: "worker-0".to_string(),
            claimed_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn json_payload() {
        let job = job(br#"{"name": "hello"}"#);

        #[derive(Deserialize)]
        struct Payload<'a> {
            name: &'a str,
        }

        let payload: Payload = job.json_payload().unwrap();
        assert_eq!(payload.name, "hello");
    }

    #[test]
    fn bad_json_payload() {
        let job = job(b"not json");
        let err = job.json_payload::<String>().unwrap_err();
        assert!(matches!(err, Error::PayloadError(_)));
    }

    #[test]
    fn debug_omits_payload_bytes() {
        let job = job(b"secret");
        let debug = format!("{job:?}");
        assert!(debug.contains("payload_len: 6"));
        assert!(!debug.contains("secret"));
    }
}
