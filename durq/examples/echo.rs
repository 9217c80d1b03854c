//! Run a worker pool with one handler that succeeds and one that always fails.

use std::{sync::Arc, time::Duration};

use durq::{ClaimedJob, Error, JobRegistry, JobRunner, JobState, Queue, WorkerPool};
use serde::{Deserialize, Serialize};
use temp_dir::TempDir;

#[derive(Debug)]
struct JobContext {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct Greeting {
    message: String,
}

async fn echo_job(job: ClaimedJob, context: Arc<JobContext>) -> Result<(), Error> {
    let greeting: Greeting = job.json_payload()?;
    println!("{} says: {}", context.name, greeting.message);
    Ok(())
}

async fn boom_job(job: ClaimedJob, _context: Arc<JobContext>) -> Result<(), String> {
    Err(format!("job {} always fails", job.id))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let dir = TempDir::new()?;
    let queue = Queue::new(&dir.child("durq.db")).await?;

    let registry = JobRegistry::new([
        JobRunner::new("echo", echo_job),
        JobRunner::new("boom", boom_job),
    ]);

    let context = Arc::new(JobContext {
        name: "durq".to_string(),
    });
    let pool = WorkerPool::builder(&queue, context)
        .registry(&registry)
        .size(2)
        .build()?;

    let client = queue.client();
    let echo = client
        .enqueue_json(
            "echo",
            &Greeting {
                message: "hello".to_string(),
            },
        )
        .await?;
    let boom = client.enqueue("boom", "x").await?;

    loop {
        let echo_status = queue.get_job_status(echo).await?;
        let boom_status = queue.get_job_status(boom).await?;
        if echo_status.state.is_terminal() && boom_status.state.is_terminal() {
            assert_eq!(echo_status.state, JobState::Completed);
            println!(
                "boom ended as {}: {}",
                boom_status.state,
                boom_status.error_info.unwrap_or_default()
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pool.drain(Duration::from_secs(5)).await?;
    queue.close(Duration::from_secs(5)).await?;
    Ok(())
}
