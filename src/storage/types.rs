use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Store errors, classified so callers can tell a lost uniqueness race from an outage.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// A UNIQUE constraint rejected the write (e.g. an article link already stored)
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Another process holds the database lock beyond the busy timeout
    #[error("Database is locked by another process")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl PersistenceError {
    /// Classify a sqlx error by SQLite error kind and message
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return PersistenceError::Conflict(db_err.message().to_string());
            }
        }

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        let error_string = err.to_string().to_lowercase();
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
        {
            return PersistenceError::Locked;
        }

        PersistenceError::Other(err)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PersistenceError::Conflict(_))
    }
}

// ============================================================================
// Publishers
// ============================================================================

/// A known feed source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Publisher {
    pub id: i64,
    pub title: String,
    pub feed_url: String,
}

/// A publisher candidate extracted from an outline document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    pub title: String,
    pub feed_url: String,
}

// ============================================================================
// Articles
// ============================================================================

/// Date stored when an entry carries neither a published nor an updated date (2010-01-01T00:00:00Z).
pub const SENTINEL_PUBLISHED_SECS: i64 = 1_262_304_000;

pub fn sentinel_published() -> DateTime<Utc> {
    Utc.timestamp_opt(SENTINEL_PUBLISHED_SECS, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// An article that has not been persisted yet.
///
/// This is also the wire format of queued chunk payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArticle {
    pub publisher_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub image_link: Option<String>,
    pub link: String,
    pub published_at: DateTime<Utc>,
}

/// Internal row type for article queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub publisher_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub image_link: Option<String>,
    pub link: String,
    pub published_at: i64,
    pub enrichment_attempted: bool,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            publisher_id: self.publisher_id,
            title: self.title,
            description: self.description,
            image_link: self.image_link,
            link: self.link,
            published_at: Utc
                .timestamp_opt(self.published_at, 0)
                .single()
                .unwrap_or_else(sentinel_published),
            enrichment_attempted: self.enrichment_attempted,
        }
    }
}

/// A stored article
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub id: i64,
    /// `None` once the publisher has been pruned
    pub publisher_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub image_link: Option<String>,
    pub link: String,
    pub published_at: DateTime<Utc>,
    /// Set once by enrichment, never cleared
    pub enrichment_attempted: bool,
}

// ============================================================================
// Jobs
// ============================================================================

/// Lifecycle of a queued job row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// A job to insert into the `jobs` table
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub queue: String,
    pub payload: String,
    pub max_attempts: u32,
    pub backoff_kind: String,
    pub backoff_ms: u64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobDbRow {
    pub id: String,
    pub queue: String,
    pub payload: String,
    pub state: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub backoff_kind: String,
    pub backoff_ms: i64,
    pub run_at: i64,
    pub last_error: Option<String>,
    pub result: Option<String>,
}

impl JobDbRow {
    pub(crate) fn into_record(self) -> JobRecord {
        JobRecord {
            state: JobState::parse(&self.state).unwrap_or(JobState::Failed),
            id: self.id,
            queue: self.queue,
            payload: self.payload,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            backoff_kind: self.backoff_kind,
            backoff_ms: self.backoff_ms.max(0) as u64,
            run_at_ms: self.run_at,
            last_error: self.last_error,
            result: self.result,
        }
    }
}

/// A job row as stored
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub payload: String,
    pub state: JobState,
    /// Attempts started so far, the current one included once claimed
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_kind: String,
    pub backoff_ms: u64,
    /// Earliest time (unix millis) the job may be claimed
    pub run_at_ms: i64,
    pub last_error: Option<String>,
    /// JSON result recorded on completion
    pub result: Option<String>,
}

/// Job counts per state for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    /// Jobs that still have work ahead of them
    pub fn pending(&self) -> u64 {
        self.waiting + self.active
    }
}
