//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Job queue operations (BLPOP)
//! - Result storage and publishing

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{info, warn};

use crate::jobs::{GradeResult, WorkerJob};
use crate::judger::RunReport;

/// Redis key constants
pub mod keys {
    /// Job queue key
    pub const QUEUE: &str = "grader:queue";

    /// Grade result key prefix (for polling)
    pub const RESULT_PREFIX: &str = "grader:result:";

    /// Grade result channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "grader:results";

    /// Run result list prefix (the client waits with BLPOP)
    pub const RUN_RESULT_PREFIX: &str = "grader:run:";

    pub fn result_key(submission_id: &str) -> String {
        format!("{}{}", RESULT_PREFIX, submission_id)
    }

    pub fn run_key(request_id: &str) -> String {
        format!("{}{}", RUN_RESULT_PREFIX, request_id)
    }
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour
const RUN_RESULT_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Centralized Redis manager. Clones share the client and multiplexed
/// connection; commands on one connection are served in order, so a blocking
/// BLPOP holds back everything queued behind it. Use `dedicated()` to get a
/// manager for result writes that does not share the intake connection.
#[derive(Clone)]
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self { client, conn })
    }

    /// Create a new RedisManager using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    /// A manager on its own connection to the same server
    pub async fn dedicated(&self) -> Result<Self> {
        Ok(Self {
            client: self.client.clone(),
            conn: get_connection_with_retry(&self.client).await?,
        })
    }

    /// Wait up to `timeout` for the next job. Malformed jobs are logged and skipped.
    pub async fn pop_job(&mut self, timeout: Duration) -> Result<Option<WorkerJob>> {
        let result: Option<(String, String)> =
            match self.conn.blpop(keys::QUEUE, timeout.as_secs_f64()).await {
                Ok(res) => res,
                Err(e) => {
                    warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                    self.reconnect().await?;
                    return Ok(None);
                }
            };

        let Some((_, job_data)) = result else {
            return Ok(None);
        };
        match serde_json::from_str::<WorkerJob>(&job_data) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!("Failed to parse job data: {}", e);
                Ok(None)
            }
        }
    }

    /// Store a grade result with a 1-hour expiration and publish it
    pub async fn store_grade_result(&mut self, result: &GradeResult) -> Result<()> {
        self.store_result(
            &keys::result_key(&result.submission_id),
            Some(keys::RESULT_CHANNEL),
            result,
        )
        .await
    }

    /// Push a run result to its own list for the waiting client
    pub async fn store_run_result(&mut self, result: &RunReport) -> Result<()> {
        let key = keys::run_key(&result.request_id);
        let json = serde_json::to_string(result)?;

        if let Err(e) = self.conn.rpush::<_, _, ()>(&key, &json).await {
            warn!("Failed to push run result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn.rpush::<_, _, ()>(&key, &json).await?;
        }

        // Don't let the key linger if the client went away
        let _ = self
            .conn
            .expire::<_, ()>(&key, RUN_RESULT_EXPIRY_SECS)
            .await;

        Ok(())
    }

    /// Internal helper to store and publish a result
    async fn store_result<T: Serialize>(
        &mut self,
        key: &str,
        channel: Option<&str>,
        result: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(result)?;

        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish to channel (ignore errors as there may be no subscribers)
        if let Some(chan) = channel {
            let _ = self.conn.publish::<_, _, ()>(chan, &json).await;
        }

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
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::SubmissionResponse;
    use std::time::Instant;

    async fn local_manager() -> Option<RedisManager> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = redis::Client::open(url.as_str()).ok()?;
        let probe =
            tokio::time::timeout(Duration::from_secs(1), client.get_multiplexed_async_connection())
                .await;
        if !matches!(probe, Ok(Ok(_))) {
            return None;
        }
        RedisManager::with_url(&url).await.ok()
    }

    #[tokio::test]
    async fn test_result_writes_do_not_wait_for_intake() {
        let Some(intake) = local_manager().await else {
            eprintln!("redis not reachable, skipping");
            return;
        };
        let mut results = intake.dedicated().await.unwrap();

        let mut blocked = intake.clone();
        let idle = tokio::spawn(async move {
            blocked
                .conn
                .blpop::<_, Option<(String, String)>>("grader:test:idle-queue", 2.0)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = GradeResult {
            submission_id: "redis-test".into(),
            response: SubmissionResponse::system_error("redis-test", "stored"),
            faculty: None,
        };
        let started = Instant::now();
        results.store_grade_result(&result).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let stored: Option<String> = results.conn.get(keys::result_key("redis-test")).await.unwrap();
        assert!(stored.unwrap().contains("stored"));
        let _: () = results.conn.del(keys::result_key("redis-test")).await.unwrap();
        assert!(idle.await.unwrap().unwrap().is_none());
    }

    #[test]
    fn test_result_keys() {
        assert_eq!(keys::result_key("sub-1"), "grader:result:sub-1");
        assert_eq!(keys::run_key("r-9"), "grader:run:r-9");
        assert!(keys::result_key("x").starts_with(keys::RESULT_PREFIX));
        assert_ne!(keys::QUEUE, keys::RESULT_CHANNEL);
    }
}
