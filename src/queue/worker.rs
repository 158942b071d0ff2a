use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{ChunkJob, JobQueue, QueueError};
use crate::storage::{Database, JobRecord};

const ACK_ATTEMPTS: u32 = 3;
const ACK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Per-chunk tally stored as the job result.
///
/// `total - saved - failed` items were already stored and skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub saved: usize,
    pub failed: usize,
    pub total: usize,
}

/// Totals across every job a pool handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub jobs_completed: usize,
    /// Failed attempts, retried ones included
    pub job_attempts_failed: usize,
    pub saved: usize,
    pub failed: usize,
}

impl PoolReport {
    fn merge(&mut self, other: PoolReport) {
        self.jobs_completed += other.jobs_completed;
        self.job_attempts_failed += other.job_attempts_failed;
        self.saved += other.saved;
        self.failed += other.failed;
    }
}

/// Persists a chunk item by item, in order.
///
/// Each item is re-checked by link first, since another producer may have stored it
/// since the job was queued. A unique-constraint loss on insert counts as already
/// stored; any other store error counts the item as failed and the chunk continues.
pub async fn process_chunk(db: &Database, job: &ChunkJob) -> ChunkReport {
    let mut report = ChunkReport {
        total: job.items.len(),
        ..Default::default()
    };

    for item in &job.items {
        match db.article_exists(&item.link).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(link = %item.link, error = %e, "Existence check failed");
                report.failed += 1;
                continue;
            }
        }

        match db.insert_article(item).await {
            Ok(_) => report.saved += 1,
            Err(e) if e.is_conflict() => {
                tracing::debug!(link = %item.link, "Article stored concurrently, skipping");
            }
            Err(e) => {
                tracing::warn!(link = %item.link, error = %e, "Failed to save article");
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        publisher = %job.publisher,
        chunk = job.chunk_index,
        total_chunks = job.total_chunks,
        saved = report.saved,
        failed = report.failed,
        total = report.total,
        "Chunk processed"
    );
    report
}

/// Bounded pool of chunk handlers consuming [`ChunkJob`]s from a queue.
pub struct WorkerPool {
    queue: JobQueue,
    db: Database,
    concurrency: usize,
    poll_interval: Duration,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StopWhen {
    Cancelled,
    Idle,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, db: Database, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            queue,
            db,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Consume jobs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> PoolReport {
        self.spawn_workers(StopWhen::Cancelled, cancel).await
    }

    /// Consume jobs until none is waiting or active.
    pub async fn drain(&self) -> PoolReport {
        self.spawn_workers(StopWhen::Idle, CancellationToken::new()).await
    }

    async fn spawn_workers(&self, stop: StopWhen, cancel: CancellationToken) -> PoolReport {
        if let Err(e) = self.queue.recover_active().await {
            tracing::warn!(error = %e, "Could not recover stranded jobs");
        }

        tracing::info!(
            queue = %self.queue.name(),
            concurrency = self.concurrency,
            "Worker pool started"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency {
            let queue = self.queue.clone();
            let db = self.db.clone();
            let cancel = cancel.clone();
            let poll = self.poll_interval;
            workers.spawn(async move { worker_loop(worker_id, queue, db, poll, stop, cancel).await });
        }

        let mut total = PoolReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => total.merge(report),
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }

        tracing::info!(
            queue = %self.queue.name(),
            jobs_completed = total.jobs_completed,
            saved = total.saved,
            "Worker pool stopped"
        );
        total
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: JobQueue,
    db: Database,
    poll_interval: Duration,
    stop: StopWhen,
    cancel: CancellationToken,
) -> PoolReport {
    let mut report = PoolReport::default();

    while !cancel.is_cancelled() {
        match queue.claim().await {
            Ok(Some(job)) => {
                report.merge(handle_job(&queue, &db, &job).await);
                continue;
            }
            Ok(None) if stop == StopWhen::Idle => match queue.status().await {
                Ok(counts) if counts.pending() == 0 => break,
                Ok(_) => {}
                Err(e) => tracing::warn!(worker = worker_id, error = %e, "Queue status failed"),
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker = worker_id, error = %e, "Failed to claim job");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    tracing::debug!(worker = worker_id, "Worker exiting");
    report
}

async fn handle_job(queue: &JobQueue, db: &Database, job: &JobRecord) -> PoolReport {
    let mut report = PoolReport::default();

    let chunk: ChunkJob = match serde_json::from_str(&job.payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            report.job_attempts_failed += 1;
            let message = format!("invalid chunk payload: {e}");
            if let Err(qe) = queue.fail(job, &message).await {
                tracing::error!(job = %job.id, error = %qe, "Failed to record job failure");
            }
            return report;
        }
    };

    let result = process_chunk(db, &chunk).await;
    report.saved = result.saved;
    report.failed = result.failed;

    match acknowledge(queue, job, &result).await {
        Ok(()) => report.jobs_completed += 1,
        Err(e) => {
            // An active job would block `drain` and its id; hand it back to retry/backoff
            tracing::error!(job = %job.id, error = %e, "Failed to acknowledge job");
            report.job_attempts_failed += 1;
            let message = format!("could not record result: {e}");
            if let Err(qe) = queue.fail(job, &message).await {
                tracing::error!(job = %job.id, error = %qe, "Failed to record job failure");
            }
        }
    }
    report
}

/// Marks `job` completed, retrying a few times on store errors.
async fn acknowledge(queue: &JobQueue, job: &JobRecord, result: &ChunkReport) -> Result<(), QueueError> {
    let mut attempt = 1;
    loop {
        match queue.complete(job, result).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < ACK_ATTEMPTS => {
                tracing::warn!(job = %job.id, attempt, error = %e, "Acknowledge failed, retrying");
                tokio::time::sleep(ACK_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
