use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use grader::jobs::{process_grade_job, process_run_job, WorkerJob};
use grader::redis_manager::RedisManager;
use grader::{Engine, EngineConfig};

/// How long one BLPOP waits before the loop re-checks for shutdown
const POP_TIMEOUT: Duration = Duration::from_secs(1);
/// Back-off while the scheduler queue is full
const SATURATED_BACKOFF: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grader=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env().context("Invalid grader configuration")?;
    info!(
        "Starting grader worker: {} workers, {} sandbox slots, scopes under {}",
        config.scheduler.workers,
        config.scheduler.sandbox_slots,
        config.sandbox.scratch_root.display()
    );

    let engine = Arc::new(Engine::from_config(config).await?);
    let mut redis = RedisManager::from_env().await?;
    // BLPOP blocks its connection, so results go out on another one
    let results = redis.dedicated().await?;

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            stop.cancel();
        }
    });

    info!("Waiting for jobs...");

    let mut tasks = JoinSet::new();
    while !stop.is_cancelled() {
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!("Job task failed: {}", e);
            }
        }

        if engine.is_saturated() {
            sleep(SATURATED_BACKOFF).await;
            continue;
        }

        let Some(job) = redis.pop_job(POP_TIMEOUT).await? else {
            continue;
        };

        let engine = Arc::clone(&engine);
        let mut redis = results.clone();
        tasks.spawn(async move {
            let id = job.id().to_string();
            let stored = match job {
                WorkerJob::Grade(request) => {
                    let result = process_grade_job(&engine, request).await;
                    redis.store_grade_result(&result).await
                }
                WorkerJob::Run(request) => {
                    let report = process_run_job(&engine, request).await;
                    redis.store_run_result(&report).await
                }
            };
            if let Err(e) = stored {
                error!("Failed to store result for job {}: {:#}", id, e);
            }
        });
    }

    warn!("Shutdown requested, cancelling {} running jobs", tasks.len());
    engine.shutdown();
    while let Some(finished) = tasks.join_next().await {
        if let Err(e) = finished {
            error!("Job task failed: {}", e);
        }
    }
    info!("Grader worker stopped");

    Ok(())
}
