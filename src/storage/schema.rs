use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::PersistenceError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the SQLite store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database shared by every
    /// connection of this pool.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError::Locked` if another process holds the database lock.
    /// Returns `PersistenceError::Migration` if the schema could not be created.
    pub async fn open(path: &str) -> Result<Self, PersistenceError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-010: Pre-create the DB file owner-only so it never exists with umask permissions
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() {
                if let Some(parent) = db_path.parent().filter(|p| p.exists()) {
                    tracing::debug!(dir = %parent.display(), "Creating database file");
                    // If creation fails, SQLite reports the error at connect_with.
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok();
                }
            }
        }

        // busy_timeout=5000: queue workers and the enrichment processor write concurrently;
        // SQLite waits up to 5 seconds for the write lock before returning SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(PersistenceError::from_sqlx)?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(PersistenceError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| match PersistenceError::from_sqlx(e) {
            PersistenceError::Other(inner) => PersistenceError::Migration(inner.to_string()),
            other => other,
        })?;
        Ok(db)
    }

    /// Round-trip a trivial query; used at startup to verify the store answers.
    pub async fn ping(&self) -> Result<(), PersistenceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)?;
        Ok(())
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS publishers (
                id INTEGER PRIMARY KEY,
                title TEXT UNIQUE NOT NULL,
                feed_url TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Pruning a publisher keeps its articles; the reference is cleared instead.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                publisher_id INTEGER REFERENCES publishers(id) ON DELETE SET NULL,
                title TEXT NOT NULL,
                description TEXT,
                image_link TEXT,
                link TEXT UNIQUE NOT NULL,
                published_at INTEGER NOT NULL,
                enrichment_attempted INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_publisher ON articles(publisher_id)",
        )
        .execute(&mut *tx)
        .await?;

        // Partial index: the enrichment backlog scan only ever looks at unattempted rows
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_pending ON articles(id) WHERE enrichment_attempted = 0",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'waiting',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                backoff_kind TEXT NOT NULL,
                backoff_ms INTEGER NOT NULL,
                run_at INTEGER NOT NULL,
                last_error TEXT,
                result TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Covers the claim query: WHERE queue = ? AND state = 'waiting' AND run_at <= ? ORDER BY run_at
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, state, run_at)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
