use std::convert::Infallible;

use durq::{ClaimedJob, JobRegistry, JobRunner};
use tracing::info;

/// Logs the payload of the job.
async fn print_job(job: ClaimedJob, _context: ()) -> Result<(), Infallible> {
    info!(
        job_id = job.id,
        attempt = job.attempt,
        "print: {}",
        String::from_utf8_lossy(&job.payload)
    );
    Ok(())
}

pub fn registry() -> JobRegistry<()> {
    JobRegistry::new([JobRunner::new("print", print_job)])
}
