//! SQLite persistence: publishers, articles and the durable job queue table.
//!
//! [`Database`] is split across one file per table; every query method maps
//! sqlx errors into [`PersistenceError`].

mod articles;
mod jobs;
mod publishers;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    sentinel_published, Article, JobRecord, JobState, NewArticle, NewJob, OutlineEntry,
    PersistenceError, Publisher, QueueCounts, SENTINEL_PUBLISHED_SECS,
};
