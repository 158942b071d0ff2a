//! Collection pipeline: fetch every publisher's feed, drop known items, then
//! hand the rest to the queue or to the sequential enrichment processor.

mod dedup;
mod dispatch;

use std::time::Duration;

use serde::Serialize;

pub use dedup::dedupe;
pub use dispatch::{chunk, dispatch_to_queue};

use crate::config::DispatchMode;
use crate::enrich::{RunSummary, SequentialProcessor};
use crate::feed::{fetch_feed, normalize_feed};
use crate::queue::JobQueue;
use crate::storage::{Database, NewArticle, PersistenceError, Publisher, QueueCounts};

/// Outcome of one collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectReport {
    pub publishers: usize,
    /// Publishers whose feed could not be fetched, parsed or dispatched
    pub failed_publishers: usize,
    pub items_seen: usize,
    /// Items left after deduplication
    pub items_new: usize,
    pub jobs_created: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<RunSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueCounts>,
}

pub struct FeedCollector {
    db: Database,
    client: reqwest::Client,
    feed_timeout: Duration,
    queue: JobQueue,
    processor: SequentialProcessor,
    chunk_size: usize,
}

impl FeedCollector {
    pub fn new(
        db: Database,
        client: reqwest::Client,
        feed_timeout: Duration,
        queue: JobQueue,
        processor: SequentialProcessor,
        chunk_size: usize,
    ) -> Self {
        Self {
            db,
            client,
            feed_timeout,
            queue,
            processor,
            chunk_size,
        }
    }

    /// Runs one pass over every registered publisher.
    ///
    /// One publisher failing never stops the pass. Only a failure to list the
    /// publishers is returned as an error.
    pub async fn collect_all(&self, mode: DispatchMode) -> Result<CollectReport, PersistenceError> {
        let publishers = self.db.list_publishers().await?;
        let mut report = CollectReport {
            publishers: publishers.len(),
            ..Default::default()
        };

        if mode == DispatchMode::Queue {
            match self.queue.prune_finished().await {
                Ok(pruned) if pruned > 0 => tracing::debug!(pruned, "Pruned finished jobs"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to prune finished jobs"),
            }
        }

        tracing::info!(publishers = publishers.len(), mode = ?mode, "Collection started");

        let mut drafts: Vec<NewArticle> = Vec::new();
        for publisher in &publishers {
            match self.collect_publisher(publisher).await {
                Ok((seen, fresh)) => {
                    report.items_seen += seen;
                    report.items_new += fresh.len();
                    if fresh.is_empty() {
                        continue;
                    }
                    match mode {
                        DispatchMode::Queue => {
                            match dispatch_to_queue(&self.queue, publisher, fresh, self.chunk_size).await {
                                Ok(created) => report.jobs_created += created,
                                Err(e) => {
                                    report.failed_publishers += 1;
                                    tracing::error!(publisher = %publisher.title, error = %e, "Dispatch failed");
                                }
                            }
                        }
                        DispatchMode::Sequential => drafts.extend(fresh),
                    }
                }
                Err(e) => {
                    report.failed_publishers += 1;
                    tracing::warn!(
                        publisher = %publisher.title,
                        feed = %publisher.feed_url,
                        error = %e,
                        "Publisher skipped"
                    );
                }
            }
        }

        match mode {
            DispatchMode::Queue => match self.queue.status().await {
                Ok(counts) => report.queue = Some(counts),
                Err(e) => tracing::warn!(error = %e, "Queue status unavailable"),
            },
            DispatchMode::Sequential => {
                // Dedup already ran per publisher; a second publisher can still
                // repeat a link, which the store ignores on insert.
                match self.processor.process_new(drafts).await {
                    Ok(summary) => report.enrichment = Some(summary),
                    Err(e) => tracing::error!(error = %e, "Sequential enrichment failed"),
                }
            }
        }

        tracing::info!(
            publishers = report.publishers,
            failed = report.failed_publishers,
            seen = report.items_seen,
            new = report.items_new,
            jobs = report.jobs_created,
            "Collection finished"
        );
        Ok(report)
    }

    /// Items seen in the publisher's feed, and the ones not yet stored
    async fn collect_publisher(
        &self,
        publisher: &Publisher,
    ) -> anyhow::Result<(usize, Vec<NewArticle>)> {
        let feed = fetch_feed(&self.client, &publisher.feed_url, self.feed_timeout).await?;
        let normalized = normalize_feed(&feed, Some(publisher.id));
        if normalized.skipped_without_link > 0 {
            tracing::debug!(
                publisher = %publisher.title,
                skipped = normalized.skipped_without_link,
                "Entries without a link dropped"
            );
        }

        let seen = normalized.articles.len();
        let fresh = dedupe(&self.db, normalized.articles).await?;
        Ok((seen, fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnrichConfig;
    use crate::queue::{RetryPolicy, ARTICLE_QUEUE};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss(base: &str, slugs: &[&str]) -> String {
        let items: String = slugs
            .iter()
            .map(|s| {
                format!(
                    "<item><title>{s}</title><link>{base}/posts/{s}</link>\
                     <description>About {s}</description></item>"
                )
            })
            .collect();
        format!(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Blog</title>{items}</channel></rss>"#)
    }

    async fn collector(db: &Database) -> FeedCollector {
        let client = reqwest::Client::new();
        let queue = JobQueue::new(db.clone(), ARTICLE_QUEUE, RetryPolicy::default());
        let settings = EnrichConfig {
            item_delay_ms: 0,
            batch_delay_ms: 0,
            item_timeout_ms: 1000,
            ..EnrichConfig::default()
        };
        let processor = SequentialProcessor::new(db.clone(), client.clone(), settings);
        FeedCollector::new(db.clone(), client, Duration::from_secs(5), queue, processor, 2)
    }

    #[tokio::test]
    async fn test_queue_mode_dispatches_new_items_only() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&base, &["a", "b", "c"])))
            .mount(&server)
            .await;

        let db = Database::open(":memory:").await.unwrap();
        db.upsert_publisher("Blog", &format!("{base}/feed.xml")).await.unwrap();
        db.upsert_publisher("Gone", &format!("{base}/missing.xml")).await.unwrap();

        let c = collector(&db).await;
        let report = c.collect_all(DispatchMode::Queue).await.unwrap();
        assert_eq!(report.publishers, 2);
        assert_eq!(report.failed_publishers, 1);
        assert_eq!(report.items_seen, 3);
        assert_eq!(report.items_new, 3);
        assert_eq!(report.jobs_created, 2);
        assert_eq!(report.queue.unwrap().waiting, 2);
        assert!(report.enrichment.is_none());
    }

    #[tokio::test]
    async fn test_sequential_mode_stores_and_enriches() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&base, &["a", "b"])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/posts/a"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<main>Body A</main>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/posts/b"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<main>Body B</main>"))
            .mount(&server)
            .await;

        let db = Database::open(":memory:").await.unwrap();
        db.upsert_publisher("Blog", &format!("{base}/feed.xml")).await.unwrap();

        let c = collector(&db).await;
        let report = c.collect_all(DispatchMode::Sequential).await.unwrap();
        let summary = report.enrichment.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(report.jobs_created, 0);

        let a = db
            .get_article_by_link(&format!("{base}/posts/a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.description.as_deref(), Some("Body A"));
        assert!(a.enrichment_attempted);

        // Second pass finds nothing new
        let again = c.collect_all(DispatchMode::Sequential).await.unwrap();
        assert_eq!(again.items_new, 0);
        assert_eq!(again.enrichment.unwrap().processed, 0);
    }
}
