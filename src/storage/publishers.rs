use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{OutlineEntry, PersistenceError, Publisher};

impl Database {
    // ========================================================================
    // Publisher Operations
    // ========================================================================

    /// Upsert publishers keyed on title, `batch_size` rows per statement.
    ///
    /// An existing title gets its feed URL overwritten. Returns the number of
    /// entries written (inserted or updated).
    pub async fn upsert_publishers(
        &self,
        entries: &[OutlineEntry],
        batch_size: usize,
    ) -> Result<u64, PersistenceError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(PersistenceError::from_sqlx)?;
        let mut written = 0;

        for chunk in entries.chunks(batch_size.max(1)) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO publishers (title, feed_url) ");

            builder.push_values(chunk, |mut b, entry| {
                b.push_bind(&entry.title).push_bind(&entry.feed_url);
            });

            builder.push(" ON CONFLICT(title) DO UPDATE SET feed_url = excluded.feed_url");

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(PersistenceError::from_sqlx)?;
            written += result.rows_affected();
        }

        tx.commit().await.map_err(PersistenceError::from_sqlx)?;
        Ok(written)
    }

    /// Upsert a single publisher, returning its id
    pub async fn upsert_publisher(
        &self,
        title: &str,
        feed_url: &str,
    ) -> Result<i64, PersistenceError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO publishers (title, feed_url) VALUES (?, ?)
            ON CONFLICT(title) DO UPDATE SET feed_url = excluded.feed_url
            RETURNING id
        "#,
        )
        .bind(title)
        .bind(feed_url)
        .fetch_one(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(id)
    }

    /// All publishers, ordered by id
    pub async fn list_publishers(&self) -> Result<Vec<Publisher>, PersistenceError> {
        sqlx::query_as::<_, Publisher>("SELECT id, title, feed_url FROM publishers ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)
    }

    /// Delete a publisher. Its articles stay, with `publisher_id` cleared.
    pub async fn delete_publisher(&self, publisher_id: i64) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM publishers WHERE id = ?")
            .bind(publisher_id)
            .execute(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }
}
