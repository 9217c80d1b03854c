//! HTTP ingress for a durq queue, with an optional embedded worker pool.
use std::{path::Path, sync::Arc};

use axum::Router;
use durq::{EnqueueLimits, Queue, RetrySupervisor, WorkerPool};
use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;

mod config;
mod handlers;
mod jobs;
mod shutdown;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::signal_received())
        .await?;

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let queue = Arc::new(
        Queue::builder(Path::new(config.database_path.as_str()))
            .job_recovery_behavior(config.job_recovery.0)
            .build()
            .await?,
    );

    let registry = jobs::registry();
    let pool = if config.workers > 0 {
        Some(
            WorkerPool::builder(&queue, ())
                .registry(&registry)
                .name("durq-server")
                .size(config.workers)
                .poll_interval(config.poll_interval.0)
                .build()?,
        )
    } else {
        None
    };

    let supervisor = config.retry_policy.enabled().then(|| {
        RetrySupervisor::start(
            &queue,
            config.retry_policy.policy(),
            config.retry_policy.check_interval.0,
        )
    });

    let limits = EnqueueLimits {
        max_payload_bytes: config.max_payload_bytes,
        ..Default::default()
    };
    let app = handlers::app(handlers::AppState {
        client: queue.client_with_limits(limits),
        queue: queue.clone(),
    });

    let served = listen(app, config.bind()).await;
    if let Err(e) = &served {
        error!("failed to serve http: {}", e);
    }

    let timeout = config.shutdown_timeout.0;
    if let Some(pool) = pool {
        info!("draining worker pool");
        if let Err(e) = pool.drain(timeout).await {
            error!("failed to drain worker pool: {}", e);
        }
    }

    if let Some(supervisor) = supervisor {
        supervisor.stop().await?;
    }

    queue.close(timeout).await?;
    info!("shutdown complete");

    served
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env()?;

    run(config).await
}
