//! Application facade shared by the CLI and the HTTP trigger surface.
//!
//! Owns the store handle, the HTTP client, the article queue and the single
//! sequential processor; every inbound trigger is a method here.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{Config, ConfigError, DispatchMode};
use crate::enrich::{RunSummary, SequentialProcessor};
use crate::pipeline::{CollectReport, FeedCollector};
use crate::queue::{JobQueue, RetryPolicy, WorkerPool, ARTICLE_QUEUE};
use crate::registry::{self, OutlineReport, PruneReport};
use crate::storage::{Database, QueueCounts};

/// Ingest, prune and collect, in that order
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub outline: OutlineReport,
    pub prune: PruneReport,
    pub collect: CollectReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub queue: QueueCounts,
    pub publishers: usize,
    pub articles: i64,
    pub pending_enrichment: usize,
    /// A sequential enrichment run is in progress
    pub processing: bool,
}

pub struct App {
    config: Config,
    db: Database,
    client: reqwest::Client,
    queue: JobQueue,
    processor: SequentialProcessor,
}

impl App {
    /// Opens the store and wires the components.
    ///
    /// An unreachable store is fatal: the error is [`ConfigError::StoreUnreachable`].
    pub async fn open(config: Config) -> Result<Self> {
        let path = config.database_path.display().to_string();
        let unreachable = |reason: String| ConfigError::StoreUnreachable {
            path: path.clone(),
            reason,
        };

        let db = Database::open(&path)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        db.ping().await.map_err(|e| unreachable(e.to_string()))?;

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self::with_parts(config, db, client))
    }

    /// Wires the components around an already-open store.
    pub fn with_parts(config: Config, db: Database, client: reqwest::Client) -> Self {
        let queue = JobQueue::new(
            db.clone(),
            ARTICLE_QUEUE,
            RetryPolicy::from_config(&config.queue),
        );
        let processor = SequentialProcessor::new(db.clone(), client.clone(), config.enrich.clone());

        Self {
            config,
            db,
            client,
            queue,
            processor,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub async fn ingest_outline_document(&self, raw: &str) -> OutlineReport {
        registry::ingest_outline_document(&self.db, raw, self.config.registry.upsert_batch_size).await
    }

    /// Ingests the outline at `url`, or the configured `outline_url`.
    pub async fn ingest_outline_url(&self, url: Option<&str>) -> OutlineReport {
        let url = url.unwrap_or(&self.config.outline_url);
        if url.trim().is_empty() {
            return OutlineReport {
                processed: 0,
                errors: vec!["no outline URL given or configured".to_string()],
            };
        }

        registry::ingest_outline_from_url(
            &self.db,
            &self.client,
            url,
            self.config.feed_timeout(),
            self.config.registry.upsert_batch_size,
        )
        .await
    }

    pub async fn prune_publishers(&self) -> Result<PruneReport> {
        registry::prune_unreachable(
            &self.db,
            &self.client,
            self.config.feed_timeout(),
            self.config.registry.prune_group_size,
        )
        .await
        .context("Failed to prune publishers")
    }

    // ========================================================================
    // Collection
    // ========================================================================

    fn collector(&self) -> FeedCollector {
        FeedCollector::new(
            self.db.clone(),
            self.client.clone(),
            self.config.feed_timeout(),
            self.queue.clone(),
            self.processor.clone(),
            self.config.queue.chunk_size,
        )
    }

    /// Collects every publisher's feed; `None` uses the configured dispatch mode.
    pub async fn collect(&self, mode: Option<DispatchMode>) -> Result<CollectReport> {
        let mode = mode.unwrap_or(self.config.dispatch_mode);
        self.collector()
            .collect_all(mode)
            .await
            .context("Failed to collect feeds")
    }

    pub async fn update(&self) -> Result<UpdateReport> {
        let outline = self.ingest_outline_url(None).await;
        let prune = self.prune_publishers().await?;
        let collect = self.collect(None).await?;
        Ok(UpdateReport {
            outline,
            prune,
            collect,
        })
    }

    // ========================================================================
    // Queue and enrichment
    // ========================================================================

    pub async fn queue_status(&self) -> Result<QueueCounts> {
        self.queue.status().await.context("Failed to read queue status")
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let queue = self.queue_status().await?;
        let publishers = self.db.list_publishers().await?.len();
        let articles = self.db.count_articles().await?;
        let pending_enrichment = self.db.pending_article_ids().await?.len();
        Ok(StatusReport {
            queue,
            publishers,
            articles,
            pending_enrichment,
            processing: self.processor.is_processing(),
        })
    }

    /// Removes every job from the article queue, returning how many were removed.
    pub async fn flush_queue(&self) -> Result<u64> {
        self.queue.flush().await.context("Failed to flush queue")
    }

    pub async fn enrich_backlog(&self) -> Result<RunSummary> {
        self.processor
            .process_backlog()
            .await
            .context("Enrichment run failed")
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.queue.clone(),
            self.db.clone(),
            self.config.queue.concurrency,
            self.config.queue.poll_interval(),
        )
    }
}
