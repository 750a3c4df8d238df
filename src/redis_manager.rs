//! Redis Manager - queue, event and result operations for the worker
//!
//! This module handles:
//! - Job queue operations (BLPOP)
//! - Publishing output events per job
//! - Result storage and publishing

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::events::OutputEvent;
use crate::jobs::{ExecuteJob, JobResult};

/// Redis key constants
pub mod keys {
    /// Execution job queue key
    pub const QUEUE: &str = "coderun:queue";

    /// Result key prefix (for polling)
    pub const RESULT_PREFIX: &str = "coderun:result:";

    /// Result channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "coderun:results";

    /// Per-job output event channel prefix
    pub const EVENTS_PREFIX: &str = "coderun:events:";

    pub fn result_key(job_id: &str) -> String {
        format!("{}{}", RESULT_PREFIX, job_id)
    }

    pub fn events_channel(job_id: &str) -> String {
        format!("{}{}", EVENTS_PREFIX, job_id)
    }
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Redis handle shared by the job loop and per-job tasks
#[derive(Clone)]
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self { client, conn })
    }

    /// Connect using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    /// Block and wait for the next job from the queue.
    ///
    /// Reconnects on connection failure. Malformed jobs are logged and skipped.
    pub async fn pop_job(&mut self) -> Result<ExecuteJob> {
        loop {
            let result: Option<(String, String)> = match self.conn.blpop(keys::QUEUE, 0.0).await {
                Ok(res) => res,
                Err(e) => {
                    warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                    self.reconnect().await?;
                    continue;
                }
            };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<ExecuteJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }

    /// Publish one output event on the job's channel
    pub async fn publish_event(&mut self, job_id: &str, event: &OutputEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.conn
            .publish::<_, _, ()>(keys::events_channel(job_id), &json)
            .await
            .context("Failed to publish output event")?;
        Ok(())
    }

    /// Store a job result with a 1-hour expiration and publish it
    pub async fn store_result(&mut self, result: &JobResult) -> Result<()> {
        let key = keys::result_key(&result.job_id);
        let json = serde_json::to_string(result)?;

        // Try to store, reconnect on failure
        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish to channel (ignore errors as there may be no subscribers)
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::RESULT_CHANNEL, &json)
            .await;

        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in {} seconds...",
                    e,
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
