//! Job processing for the queue worker
//!
//! One job runs through the dispatcher while a publisher task forwards its
//! output events in emission order. The result is stored only after the
//! publisher has drained every event, so subscribers always see the terminal
//! event before the stored result appears.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::events::{ChannelSink, OutputEvent};
use crate::jobs::{ExecuteJob, JobResult};
use crate::redis_manager::RedisManager;

/// Destination for a job's events and final result
#[async_trait]
pub trait JobStore: Clone + Send + 'static {
    async fn publish_event(&mut self, job_id: &str, event: &OutputEvent) -> Result<()>;

    async fn store_result(&mut self, result: &JobResult) -> Result<()>;
}

#[async_trait]
impl JobStore for RedisManager {
    async fn publish_event(&mut self, job_id: &str, event: &OutputEvent) -> Result<()> {
        RedisManager::publish_event(self, job_id, event).await
    }

    async fn store_result(&mut self, result: &JobResult) -> Result<()> {
        RedisManager::store_result(self, result).await
    }
}

/// Run one job, streaming its events and storing the final result
pub async fn process_job<S: JobStore>(
    job: ExecuteJob,
    dispatcher: &Dispatcher,
    mut store: S,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Events are published in emission order until every sender is gone
    let publisher = {
        let mut store = store.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = store.publish_event(&job_id, &event).await {
                    warn!("Failed to publish event for job {}: {}", job_id, e);
                }
            }
        })
    };

    let result = dispatcher
        .execute_code(&job.code, &job.language, Some(Arc::new(ChannelSink(tx))))
        .await;

    if let Err(e) = publisher.await {
        warn!("Event publisher for job {} failed: {}", job.job_id, e);
    }

    info!(
        "Job {} finished: success={}, time_ms={}",
        job.job_id,
        result.is_success(),
        result.execution_time_ms()
    );

    store
        .store_result(&JobResult {
            job_id: job.job_id,
            result,
        })
        .await
}
