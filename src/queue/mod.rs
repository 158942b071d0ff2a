//! Durable job queue backed by the `jobs` table.
//!
//! Delivery is at-least-once: a claimed job that is neither completed nor
//! failed (process crash) is put back to `waiting` when the next worker pool
//! starts. Job ids are caller-supplied, so submitting the same id twice is a
//! no-op for as long as the first job is still stored.

mod worker;

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BackoffKind, QueueConfig};
use crate::storage::{Database, JobRecord, JobState, NewArticle, NewJob, PersistenceError, QueueCounts};

pub use worker::{process_chunk, ChunkReport, PoolReport, WorkerPool};

/// Queue carrying article chunks from the dispatcher to the worker pool
pub const ARTICLE_QUEUE: &str = "articles";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue store error: {0}")]
    Store(#[from] PersistenceError),

    #[error("Job payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Delay before the next attempt of a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Base delay doubled after every failed attempt
    Exponential(Duration),
}

impl Backoff {
    /// Delay after `attempts_made` failed attempts (1 for the first failure)
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential(base) => {
                let exp = attempts_made.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exp)
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Backoff::Fixed(_) => "fixed",
            Backoff::Exponential(_) => "exponential",
        }
    }

    fn base(&self) -> Duration {
        match *self {
            Backoff::Fixed(d) | Backoff::Exponential(d) => d,
        }
    }

    fn from_stored(kind: &str, base_ms: u64) -> Self {
        let base = Duration::from_millis(base_ms);
        match kind {
            "exponential" => Backoff::Exponential(base),
            _ => Backoff::Fixed(base),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first run included
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        let base = Duration::from_millis(config.backoff_ms);
        Self {
            attempts: config.attempts.max(1),
            backoff: match config.backoff {
                BackoffKind::Fixed => Backoff::Fixed(base),
                BackoffKind::Exponential => Backoff::Exponential(base),
            },
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Payload of one queued chunk: an ordered slice of a publisher's new articles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkJob {
    pub publisher_id: i64,
    pub publisher: String,
    /// 1-based
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub items: Vec<NewArticle>,
}

/// Deterministic job id of a publisher's chunk (1-based index)
pub fn chunk_job_id(publisher_id: i64, chunk_index: usize) -> String {
    format!("{publisher_id}-chunk-{chunk_index}")
}

// ============================================================================
// Queue Handle
// ============================================================================

/// Handle to one named queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    name: String,
    policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(db: Database, name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            db,
            name: name.into(),
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Submit a job under `job_id` with this queue's retry policy.
    ///
    /// Returns `false` when a job with that id already exists (nothing is enqueued).
    pub async fn submit<T: Serialize>(&self, job_id: &str, payload: &T) -> Result<bool, QueueError> {
        let job = NewJob {
            id: job_id.to_string(),
            queue: self.name.clone(),
            payload: serde_json::to_string(payload)?,
            max_attempts: self.policy.attempts,
            backoff_kind: self.policy.backoff.kind().to_string(),
            backoff_ms: self.policy.backoff.base().as_millis() as u64,
        };

        let created = self.db.enqueue_job(&job, now_ms()).await?;
        if !created {
            tracing::debug!(queue = %self.name, job = %job_id, "Job id already queued, skipping");
        }
        Ok(created)
    }

    /// Claim the next due job, if any
    pub async fn claim(&self) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.db.claim_next_job(&self.name, now_ms()).await?)
    }

    pub async fn complete<R: Serialize>(&self, job: &JobRecord, result: &R) -> Result<(), QueueError> {
        let result = serde_json::to_string(result)?;
        self.db.complete_job(&job.id, &result, now_ms()).await?;
        Ok(())
    }

    /// Record a failed attempt: re-queue with the job's backoff, or mark it
    /// `failed` once its attempts are used up.
    pub async fn fail(&self, job: &JobRecord, error: &str) -> Result<JobState, QueueError> {
        let now = now_ms();
        let retry_at = (job.attempts < job.max_attempts).then(|| {
            let delay = Backoff::from_stored(&job.backoff_kind, job.backoff_ms).delay_for(job.attempts);
            now.saturating_add(delay.as_millis() as i64)
        });

        let state = self.db.fail_job(&job.id, error, retry_at, now).await?;
        match state {
            JobState::Failed => tracing::error!(
                queue = %self.name,
                job = %job.id,
                attempts = job.attempts,
                error = %error,
                "Job failed permanently"
            ),
            _ => tracing::warn!(
                queue = %self.name,
                job = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                error = %error,
                "Job attempt failed, retrying"
            ),
        }
        Ok(state)
    }

    pub async fn status(&self) -> Result<QueueCounts, QueueError> {
        Ok(self.db.job_counts(&self.name).await?)
    }

    /// Remove every job, pending ones included
    pub async fn flush(&self) -> Result<u64, QueueError> {
        let removed = self.db.flush_jobs(&self.name).await?;
        tracing::info!(queue = %self.name, removed, "Queue flushed");
        Ok(removed)
    }

    /// Remove completed and failed jobs so their ids can be reused
    pub async fn prune_finished(&self) -> Result<u64, QueueError> {
        Ok(self.db.prune_finished_jobs(&self.name).await?)
    }

    /// Put jobs stranded in `active` back to `waiting`
    pub async fn recover_active(&self) -> Result<u64, QueueError> {
        let recovered = self.db.requeue_active_jobs(&self.name, now_ms()).await?;
        if recovered > 0 {
            tracing::warn!(queue = %self.name, recovered, "Re-queued jobs left active by a previous run");
        }
        Ok(recovered)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn queue(policy: RetryPolicy) -> JobQueue {
        let db = Database::open(":memory:").await.unwrap();
        JobQueue::new(db, ARTICLE_QUEUE, policy)
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed(Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = Backoff::Exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = QueueConfig::default();
        assert_eq!(RetryPolicy::from_config(&config), RetryPolicy::default());

        config.backoff = BackoffKind::Exponential;
        config.backoff_ms = 250;
        config.attempts = 0;
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.backoff, Backoff::Exponential(Duration::from_millis(250)));
    }

    #[test]
    fn test_chunk_job_id_format() {
        assert_eq!(chunk_job_id(42, 1), "42-chunk-1");
    }

    #[tokio::test]
    async fn test_submit_same_id_twice_enqueues_once() {
        let q = queue(RetryPolicy::default()).await;
        assert!(q.submit("7-chunk-1", &serde_json::json!({"n": 1})).await.unwrap());
        assert!(!q.submit("7-chunk-1", &serde_json::json!({"n": 2})).await.unwrap());

        assert_eq!(q.status().await.unwrap().waiting, 1);
        let job = q.claim().await.unwrap().unwrap();
        assert_eq!(job.payload, r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_fail_exhausts_attempts() {
        let q = queue(RetryPolicy {
            attempts: 2,
            backoff: Backoff::Fixed(Duration::ZERO),
        })
        .await;
        q.submit("job", &"payload").await.unwrap();

        let first = q.claim().await.unwrap().unwrap();
        assert_eq!(q.fail(&first, "boom").await.unwrap(), JobState::Waiting);

        let second = q.claim().await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(q.fail(&second, "boom").await.unwrap(), JobState::Failed);

        let counts = q.status().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending(), 0);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let q = queue(RetryPolicy {
            attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(60)),
        })
        .await;
        q.submit("job", &"payload").await.unwrap();

        let job = q.claim().await.unwrap().unwrap();
        q.fail(&job, "boom").await.unwrap();
        assert!(q.claim().await.unwrap().is_none());
        assert_eq!(q.status().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_complete_records_result() {
        let q = queue(RetryPolicy::default()).await;
        q.submit("job", &"payload").await.unwrap();
        let job = q.claim().await.unwrap().unwrap();
        q.complete(&job, &serde_json::json!({"saved": 3})).await.unwrap();

        let counts = q.status().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(q.prune_finished().await.unwrap(), 1);
        assert!(q.submit("job", &"payload").await.unwrap());
    }
}
