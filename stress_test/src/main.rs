use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use durq::{ClaimedJob, JobId, JobRegistry, JobRunner, JobState, Queue, QueueClient, WorkerPool};
use eyre::{eyre, Result};
use futures::future::try_join_all;
use temp_dir::TempDir;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long, default_value_t = 100000)]
    num_jobs: usize,

    #[arg(long, default_value_t = 4)]
    num_pools: usize,

    #[arg(long, default_value_t = 8)]
    workers_per_pool: usize,

    #[arg(long, default_value_t = 20)]
    new_job_batch_size: usize,

    #[arg(long, default_value_t = 10)]
    num_submit_tasks: usize,

    /// Open a separate queue handle on the same database for each pool.
    #[arg(long)]
    separate_handles: bool,
}

/// Every job id a handler has seen, to catch a job that was run twice.
#[derive(Debug, Clone, Default)]
struct Seen(Arc<Mutex<HashSet<JobId>>>);

async fn empty_task(job: ClaimedJob, seen: Seen) -> Result<(), String> {
    let mut seen = seen.0.lock().map_err(|e| e.to_string())?;
    if !seen.insert(job.id) {
        return Err(format!("job {} ran twice", job.id));
    }
    Ok(())
}

async fn submit_task(
    client: QueueClient,
    batch_size: usize,
    num_batches: usize,
) -> Result<Vec<JobId>> {
    let mut job_ids = Vec::with_capacity(batch_size * num_batches);
    for _ in 0..num_batches {
        let jobs = (0..batch_size).map(|_| ("empty".to_string(), Vec::new()));
        let ids = client.enqueue_batch(jobs).await?;
        job_ids.extend(ids);
    }
    Ok(job_ids)
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let dir = TempDir::new()?;
    let path = dir.path().join("durq.db");
    let queue = Arc::new(Queue::new(&path).await?);

    let seen = Seen::default();
    let empty_job = JobRunner::new("empty", empty_task);
    let registry = JobRegistry::new(&[empty_job]);

    let mut pool_queues = Vec::with_capacity(args.num_pools);
    for _ in 0..args.num_pools {
        if args.separate_handles {
            pool_queues.push(Arc::new(Queue::new(&path).await?));
        } else {
            pool_queues.push(queue.clone());
        }
    }

    let pools = pool_queues
        .iter()
        .map(|q| {
            WorkerPool::builder(q, seen.clone())
                .registry(&registry)
                .size(args.workers_per_pool)
                .poll_interval(Duration::from_millis(100))
                .build()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let jobs_per_task = args.num_jobs / args.num_submit_tasks;
    let batches_per_task = jobs_per_task / args.new_job_batch_size;

    let submit_tasks = (0..args.num_submit_tasks)
        .map(|_| {
            tokio::spawn(submit_task(
                queue.client(),
                args.new_job_batch_size,
                batches_per_task,
            ))
        })
        .collect::<Vec<_>>();

    let expected_total =
        (args.new_job_batch_size * batches_per_task * args.num_submit_tasks) as u64;
    let mut last_log_time = tokio::time::Instant::now();
    let mut last_total = 0;
    let log_interval = 10;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let total = pools
            .iter()
            .map(|p| {
                let counts = p.counts();
                counts.completed + counts.failed
            })
            .sum::<u64>();
        let since_last = last_log_time.elapsed();
        if since_last > Duration::from_secs(log_interval) || total >= expected_total {
            last_log_time = tokio::time::Instant::now();

            let rate = (total - last_total) * 1000 / (since_last.as_millis().max(1) as u64);
            println!("Finished {total} jobs ({}/sec)", rate);
            last_total = total;
        }

        if total >= expected_total {
            break;
        }
    }

    let values = try_join_all(submit_tasks).await?;

    println!("Verifying results...");
    let mut checked = 0;
    for ids in values {
        for id in ids? {
            let job = queue.get_job_status(id).await?;
            if job.state != JobState::Completed {
                return Err(eyre!(
                    "job {id} ended as {}: {:?}",
                    job.state,
                    job.error_info
                ));
            }
            checked += 1;
        }
    }

    println!("{checked} jobs ok");

    for pool in pools {
        pool.drain(Duration::from_secs(60)).await?;
    }
    for q in pool_queues {
        q.close(Duration::from_secs(60)).await?;
    }
    queue.close(Duration::from_secs(60)).await?;

    Ok(())
}

fn init() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    Ok(())
}

#[cfg(not(feature = "rt-multi-thread"))]
#[tokio::main(flavor = "current_thread")]
pub async fn main() -> Result<()> {
    init()?;
    run().await
}

#[cfg(feature = "rt-multi-thread")]
#[tokio::main(flavor = "multi_thread")]
pub async fn main() -> Result<()> {
    init()?;
    run().await
}
