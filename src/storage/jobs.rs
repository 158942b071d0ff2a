use super::schema::Database;
use super::types::{JobDbRow, JobRecord, JobState, NewJob, PersistenceError, QueueCounts};

const JOB_COLUMNS: &str = "id, queue, payload, state, attempts, max_attempts, backoff_kind, \
                           backoff_ms, run_at, last_error, result";

impl Database {
    // ========================================================================
    // Job Queue Table
    // ========================================================================

    /// Insert a waiting job unless a job with the same id already exists.
    ///
    /// Returns `true` if the job was created, `false` if the id was taken.
    pub async fn enqueue_job(&self, job: &NewJob, now_ms: i64) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs
                (id, queue, payload, state, attempts, max_attempts, backoff_kind, backoff_ms,
                 run_at, created_at, updated_at)
            VALUES (?, ?, ?, 'waiting', 0, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&job.id)
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(i64::from(job.max_attempts))
        .bind(&job.backoff_kind)
        .bind(job.backoff_ms as i64)
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically move the next due waiting job to `active` and count the attempt.
    ///
    /// Single UPDATE ... RETURNING statement, so two workers never claim the same row.
    pub async fn claim_next_job(
        &self,
        queue: &str,
        now_ms: i64,
    ) -> Result<Option<JobRecord>, PersistenceError> {
        let row = sqlx::query_as::<_, JobDbRow>(&format!(
            r#"
            UPDATE jobs SET state = 'active', attempts = attempts + 1, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ? AND state = 'waiting' AND run_at <= ?
                ORDER BY run_at, rowid
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
        "#
        ))
        .bind(now_ms)
        .bind(queue)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(row.map(JobDbRow::into_record))
    }

    /// Mark an active job completed and store its JSON result
    pub async fn complete_job(
        &self,
        job_id: &str,
        result_json: &str,
        now_ms: i64,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE jobs SET state = 'completed', result = ?, last_error = NULL, updated_at = ? WHERE id = ? AND state = 'active'",
        )
        .bind(result_json)
        .bind(now_ms)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// `retry_at_ms = Some(t)` puts the job back to `waiting` until `t`;
    /// `None` marks it permanently `failed`.
    pub async fn fail_job(
        &self,
        job_id: &str,
        error: &str,
        retry_at_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<JobState, PersistenceError> {
        let (state, run_at) = match retry_at_ms {
            Some(at) => (JobState::Waiting, at),
            None => (JobState::Failed, now_ms),
        };

        sqlx::query(
            "UPDATE jobs SET state = ?, run_at = ?, last_error = ?, updated_at = ? WHERE id = ? AND state = 'active'",
        )
        .bind(state.as_str())
        .bind(run_at)
        .bind(error)
        .bind(now_ms)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(state)
    }

    /// Return jobs left `active` by a process that died mid-job to `waiting`
    pub async fn requeue_active_jobs(&self, queue: &str, now_ms: i64) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'waiting', run_at = ?, updated_at = ? WHERE queue = ? AND state = 'active'",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(queue)
        .execute(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(result.rows_affected())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, PersistenceError> {
        let row = sqlx::query_as::<_, JobDbRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(row.map(JobDbRow::into_record))
    }

    /// Job counts per state
    pub async fn job_counts(&self, queue: &str) -> Result<QueueCounts, PersistenceError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs WHERE queue = ? GROUP BY state")
                .bind(queue)
                .fetch_all(&self.pool)
                .await
                .map_err(PersistenceError::from_sqlx)?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let count = count.max(0) as u64;
            match JobState::parse(&state) {
                Some(JobState::Waiting) => counts.waiting = count,
                Some(JobState::Active) => counts.active = count,
                Some(JobState::Completed) => counts.completed = count,
                Some(JobState::Failed) => counts.failed = count,
                None => tracing::warn!(state = %state, count, "Unknown job state in queue table"),
            }
        }
        Ok(counts)
    }

    /// Delete every job of the queue, whatever its state
    pub async fn flush_jobs(&self, queue: &str) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM jobs WHERE queue = ?")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    /// Delete completed and failed jobs, keeping waiting and active ones
    pub async fn prune_finished_jobs(&self, queue: &str) -> Result<u64, PersistenceError> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE queue = ? AND state IN ('completed', 'failed')")
                .bind(queue)
                .execute(&self.pool)
                .await
                .map_err(PersistenceError::from_sqlx)?;
        Ok(result.rows_affected())
    }
}
