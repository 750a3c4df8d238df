use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use coderun::redis_manager::RedisManager;
use coderun::worker::process_job;
use coderun::{Dispatcher, RunnerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coderun=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting coderun worker...");

    let config = RunnerConfig::from_env();
    info!(
        "Compile service: {}, script limit: {}ms, fallback compiler: {}",
        config.compile_service_url, config.script_time_limit_ms, config.fallback_compiler
    );

    let dispatcher = Arc::new(Dispatcher::from_config(&config)?);
    info!(
        "Accepting languages: {}",
        dispatcher.languages().supported_identifiers().join(", ")
    );

    let mut redis = RedisManager::from_env().await?;

    info!("Waiting for jobs...");

    loop {
        let job = redis.pop_job().await?;
        info!(
            "Received job: job_id={}, language={}",
            job.job_id, job.language
        );

        let dispatcher = dispatcher.clone();
        let redis = redis.clone();
        tokio::spawn(async move {
            let job_id = job.job_id.clone();
            if let Err(e) = process_job(job, &dispatcher, redis).await {
                error!("Failed to process job {}: {:?}", job_id, e);
            }
        });
    }
}
