use std::collections::HashSet;

use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Article, ArticleDbRow, NewArticle, PersistenceError};

/// Bind parameters per `IN (...)` lookup, kept well under SQLite's variable limit
const LOOKUP_CHUNK: usize = 500;

/// Rows per multi-row INSERT (6 columns * 50 = 300 parameters)
const INSERT_CHUNK: usize = 50;

const ARTICLE_COLUMNS: &str =
    "id, publisher_id, title, description, image_link, link, published_at, enrichment_attempted";

impl Database {
    // ========================================================================
    // Article Lookups
    // ========================================================================

    /// Returns the subset of `links` already stored.
    ///
    /// One `SELECT link FROM articles WHERE link IN (...)` per `LOOKUP_CHUNK` links,
    /// so a normal feed batch costs a single query.
    pub async fn existing_links(&self, links: &[&str]) -> Result<HashSet<String>, PersistenceError> {
        let mut found = HashSet::new();

        for chunk in links.chunks(LOOKUP_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("SELECT link FROM articles WHERE link IN (");
            let mut separated = builder.separated(", ");
            for link in chunk {
                separated.push_bind(*link);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String,)> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(PersistenceError::from_sqlx)?;
            found.extend(rows.into_iter().map(|(link,)| link));
        }

        Ok(found)
    }

    pub async fn article_exists(&self, link: &str) -> Result<bool, PersistenceError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM articles WHERE link = ?")
            .bind(link)
            .fetch_optional(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)?;

        Ok(row.is_some())
    }

    pub async fn get_article_by_link(&self, link: &str) -> Result<Option<Article>, PersistenceError> {
        let row = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE link = ?"
        ))
        .bind(link)
        .fetch_optional(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(row.map(ArticleDbRow::into_article))
    }

    pub async fn count_articles(&self) -> Result<i64, PersistenceError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await
            .map_err(PersistenceError::from_sqlx)?;
        Ok(count)
    }

    // ========================================================================
    // Article Inserts
    // ========================================================================

    /// Insert one article, returning its id.
    ///
    /// A link that is already stored yields `PersistenceError::Conflict`.
    pub async fn insert_article(&self, article: &NewArticle) -> Result<i64, PersistenceError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO articles (publisher_id, title, description, image_link, link, published_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(article.publisher_id)
        .bind(&article.title)
        .bind(&article.description)
        .bind(&article.image_link)
        .bind(&article.link)
        .bind(article.published_at.timestamp())
        .fetch_one(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(id)
    }

    /// Bulk insert in one transaction, silently skipping links already stored.
    ///
    /// Returns the number of rows actually inserted. Any other constraint
    /// failure (e.g. an unknown publisher id) rolls back the whole call.
    pub async fn insert_articles_ignoring_duplicates(
        &self,
        articles: &[NewArticle],
    ) -> Result<u64, PersistenceError> {
        if articles.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(PersistenceError::from_sqlx)?;
        let mut inserted = 0;

        for chunk in articles.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO articles (publisher_id, title, description, image_link, link, published_at) ",
            );

            builder.push_values(chunk, |mut b, article| {
                b.push_bind(article.publisher_id)
                    .push_bind(&article.title)
                    .push_bind(&article.description)
                    .push_bind(&article.image_link)
                    .push_bind(&article.link)
                    .push_bind(article.published_at.timestamp());
            });

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(PersistenceError::from_sqlx)?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(PersistenceError::from_sqlx)?;
        Ok(inserted)
    }

    // ========================================================================
    // Enrichment Backlog
    // ========================================================================

    /// Ids of every article whose enrichment has not been attempted, oldest first
    pub async fn pending_article_ids(&self) -> Result<Vec<i64>, PersistenceError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM articles WHERE enrichment_attempted = 0 ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(PersistenceError::from_sqlx)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Unattempted articles among `ids`, in id order
    pub async fn pending_articles_by_ids(
        &self,
        ids: &[i64],
    ) -> Result<Vec<Article>, PersistenceError> {
        let mut articles = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
                "SELECT {ARTICLE_COLUMNS} FROM articles WHERE enrichment_attempted = 0 AND id IN ("
            ));
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(") ORDER BY id");

            let rows: Vec<ArticleDbRow> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(PersistenceError::from_sqlx)?;
            articles.extend(rows.into_iter().map(ArticleDbRow::into_article));
        }

        Ok(articles)
    }

    /// Unattempted articles among `links`, in the order the links were given
    pub async fn pending_articles_by_links(
        &self,
        links: &[&str],
    ) -> Result<Vec<Article>, PersistenceError> {
        let mut found = Vec::with_capacity(links.len());

        for chunk in links.chunks(LOOKUP_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
                "SELECT {ARTICLE_COLUMNS} FROM articles WHERE enrichment_attempted = 0 AND link IN ("
            ));
            let mut separated = builder.separated(", ");
            for link in chunk {
                separated.push_bind(*link);
            }
            separated.push_unseparated(")");

            let rows: Vec<ArticleDbRow> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(PersistenceError::from_sqlx)?;
            found.extend(rows.into_iter().map(ArticleDbRow::into_article));
        }

        found.sort_by_key(|a| links.iter().position(|l| *l == a.link));
        Ok(found)
    }

    /// Store the enrichment outcome and set the attempted flag.
    ///
    /// Only applies while the flag is still unset, so the flag flips exactly
    /// once. Returns whether this call performed the transition.
    pub async fn record_enrichment(
        &self,
        article_id: i64,
        description: &str,
    ) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            "UPDATE articles SET description = ?, enrichment_attempted = 1 WHERE id = ? AND enrichment_attempted = 0",
        )
        .bind(description)
        .bind(article_id)
        .execute(&self.pool)
        .await
        .map_err(PersistenceError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }
}
