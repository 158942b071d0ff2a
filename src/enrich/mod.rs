//! Sequential enrichment: fetch each article page, extract its body, store it
//! as the description and set the attempted flag.
//!
//! The processor is single-flight. At most one run is in progress; a caller
//! arriving meanwhile waits for it. If the in-flight run already covers the
//! caller's backlog the caller receives that run's [`RunSummary`], otherwise it
//! starts its own run once the first one ends (already-attempted items are
//! filtered out by the store, so only the remainder is processed).
//!
//! Inside a run, work is an explicit worklist of batches, and each batch a
//! queue of items; the driver pulls one batch, then one item, at a time.

mod extract;

pub use extract::extract_article_text;

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::EnrichConfig;
use crate::feed::{fetch_bytes, FetchError};
use crate::storage::{Article, Database, NewArticle, PersistenceError};
use crate::util::truncate_chars;

const PAGE_ACCEPT: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("{0}")]
    Fetch(#[from] FetchError),

    /// The extraction task died before producing text
    #[error("Extraction failed: {0}")]
    Parse(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("Store error: {0}")]
    Store(#[from] PersistenceError),
}

// ============================================================================
// Summaries
// ============================================================================

/// How one item's enrichment ended, when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Extracted text stored
    Processed,
    /// Deadline hit; timeout notice stored
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: u64,
    pub batches: usize,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Batches that could not be loaded or stored at all
    pub failed_batches: usize,
}

#[derive(Debug, Default)]
struct BatchTally {
    processed: usize,
    failed: usize,
    skipped: usize,
}

// ============================================================================
// Worklist
// ============================================================================

enum WorkBatch {
    /// Not yet stored; inserted (duplicates ignored) before processing
    Drafts(Vec<NewArticle>),
    /// Already stored, by id
    Stored(Vec<i64>),
}

/// Ordered batches still to process.
struct Worklist {
    batches: VecDeque<WorkBatch>,
}

impl Worklist {
    fn from_drafts(drafts: Vec<NewArticle>, batch_size: usize) -> Self {
        Self {
            batches: crate::pipeline::chunk(drafts, batch_size)
                .into_iter()
                .map(WorkBatch::Drafts)
                .collect(),
        }
    }

    fn from_ids(ids: Vec<i64>, batch_size: usize) -> Self {
        Self {
            batches: crate::pipeline::chunk(ids, batch_size)
                .into_iter()
                .map(WorkBatch::Stored)
                .collect(),
        }
    }

    fn len(&self) -> usize {
        self.batches.len()
    }

    fn next_batch(&mut self) -> Option<WorkBatch> {
        self.batches.pop_front()
    }
}

// ============================================================================
// Single-flight State
// ============================================================================

#[derive(Clone)]
enum Backlog {
    Links(Arc<HashSet<String>>),
    Stored,
}

impl Backlog {
    fn covers(&self, other: &Backlog) -> bool {
        match (self, other) {
            (Backlog::Links(mine), Backlog::Links(theirs)) => theirs.is_subset(mine),
            (Backlog::Stored, Backlog::Stored) => true,
            _ => false,
        }
    }
}

struct InFlight {
    run_id: u64,
    backlog: Backlog,
    done: watch::Receiver<Option<RunSummary>>,
}

enum RunState {
    Idle,
    Processing(InFlight),
}

/// What a caller does on arrival: lead a new run, or wait on the current one
enum Entry {
    Lead(u64, watch::Sender<Option<RunSummary>>),
    Wait {
        run_id: u64,
        covered: bool,
        done: watch::Receiver<Option<RunSummary>>,
    },
}

/// Owns the `Processing` state for one run; dropping it returns the state to
/// `Idle`, whether the run finished, failed or panicked.
struct FlightGuard<'a> {
    state: &'a Mutex<RunState>,
    done: watch::Sender<Option<RunSummary>>,
    summary: Option<RunSummary>,
}

impl FlightGuard<'_> {
    /// Records the summary handed to waiters once the guard drops.
    fn publish(&mut self, summary: &RunSummary) {
        self.summary = Some(summary.clone());
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        // Reset before waking waiters so they find the state Idle
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = RunState::Idle;
        if let Some(summary) = self.summary.take() {
            self.done.send_replace(Some(summary));
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

struct Inner {
    db: Database,
    client: reqwest::Client,
    settings: EnrichConfig,
    state: Mutex<RunState>,
    next_run_id: AtomicU64,
}

/// Single-flight sequential enrichment processor. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SequentialProcessor {
    inner: Arc<Inner>,
}

impl SequentialProcessor {
    pub fn new(db: Database, client: reqwest::Client, settings: EnrichConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                client,
                settings,
                state: Mutex::new(RunState::Idle),
                next_run_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner),
            RunState::Processing(_)
        )
    }

    /// Store `drafts` (existing links ignored) and enrich them, in batches.
    pub async fn process_new(&self, drafts: Vec<NewArticle>) -> Result<RunSummary, EnrichError> {
        let links: HashSet<String> = drafts.iter().map(|d| d.link.clone()).collect();
        let batch_size = self.inner.settings.batch_size;

        self.single_flight(Backlog::Links(Arc::new(links)), |run_id| async move {
            Ok(self
                .drive(run_id, Worklist::from_drafts(drafts, batch_size))
                .await)
        })
        .await
    }

    /// Enrich every stored article whose enrichment has not been attempted.
    pub async fn process_backlog(&self) -> Result<RunSummary, EnrichError> {
        self.single_flight(Backlog::Stored, |run_id| async move {
            let ids = self.inner.db.pending_article_ids().await?;
            tracing::info!(run = run_id, pending = ids.len(), "Enrichment backlog loaded");
            Ok(self
                .drive(run_id, Worklist::from_ids(ids, self.inner.settings.batch_size))
                .await)
        })
        .await
    }

    async fn single_flight<F, Fut>(&self, backlog: Backlog, run: F) -> Result<RunSummary, EnrichError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<RunSummary, EnrichError>>,
    {
        let (run_id, mut guard) = loop {
            let entry = {
                let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let RunState::Processing(flight) = &*state {
                    Entry::Wait {
                        run_id: flight.run_id,
                        covered: flight.backlog.covers(&backlog),
                        done: flight.done.clone(),
                    }
                } else {
                    let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    *state = RunState::Processing(InFlight {
                        run_id,
                        backlog: backlog.clone(),
                        done: rx,
                    });
                    Entry::Lead(run_id, tx)
                }
            };

            match entry {
                Entry::Lead(run_id, done) => {
                    let guard = FlightGuard {
                        state: &self.inner.state,
                        done,
                        summary: None,
                    };
                    break (run_id, guard);
                }
                Entry::Wait {
                    run_id,
                    covered,
                    mut done,
                } => {
                    tracing::info!(run = run_id, covered, "Enrichment run in progress, waiting");
                    let finished = done
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|summary| (*summary).clone());
                    if let (true, Some(summary)) = (covered, finished) {
                        return Ok(summary);
                    }
                }
            }
        };

        tracing::info!(run = run_id, "Enrichment run started");
        let result = run(run_id).await;
        match &result {
            Ok(summary) => {
                guard.publish(summary);
                tracing::info!(
                    run = run_id,
                    batches = summary.batches,
                    processed = summary.processed,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    failed_batches = summary.failed_batches,
                    "Enrichment run finished"
                );
            }
            Err(e) => tracing::error!(run = run_id, error = %e, "Enrichment run aborted"),
        }
        drop(guard);
        result
    }

    /// Pull batches off the worklist one at a time; a failed batch is counted and skipped.
    async fn drive(&self, run_id: u64, mut worklist: Worklist) -> RunSummary {
        let mut summary = RunSummary {
            run_id,
            ..Default::default()
        };
        let total = worklist.len();

        while let Some(batch) = worklist.next_batch() {
            if summary.batches > 0 {
                pause(self.inner.settings.batch_delay()).await;
            }
            summary.batches += 1;

            match self.run_batch(batch).await {
                Ok(tally) => {
                    tracing::debug!(
                        run = run_id,
                        batch = summary.batches,
                        total,
                        processed = tally.processed,
                        skipped = tally.skipped,
                        failed = tally.failed,
                        "Batch done"
                    );
                    summary.processed += tally.processed;
                    summary.skipped += tally.skipped;
                    summary.failed += tally.failed;
                }
                Err(e) => {
                    summary.failed_batches += 1;
                    tracing::error!(run = run_id, batch = summary.batches, total, error = %e, "Batch failed");
                }
            }
        }

        summary
    }

    async fn run_batch(&self, batch: WorkBatch) -> Result<BatchTally, EnrichError> {
        let mut items: VecDeque<Article> = self.load_batch(batch).await?.into();
        let mut tally = BatchTally::default();
        let mut first = true;

        while let Some(article) = items.pop_front() {
            if !first {
                pause(self.inner.settings.item_delay()).await;
            }
            first = false;

            match self.enrich_item(&article).await {
                Ok(ItemOutcome::Processed) => tally.processed += 1,
                Ok(ItemOutcome::Skipped) => tally.skipped += 1,
                Err(e) => {
                    tally.failed += 1;
                    tracing::warn!(link = %article.link, error = %e, "Enrichment failed");
                }
            }
        }

        Ok(tally)
    }

    /// Stored, not-yet-attempted articles for a batch
    async fn load_batch(&self, batch: WorkBatch) -> Result<Vec<Article>, EnrichError> {
        let db = &self.inner.db;
        match batch {
            WorkBatch::Drafts(drafts) => {
                let inserted = db.insert_articles_ignoring_duplicates(&drafts).await?;
                tracing::debug!(drafts = drafts.len(), inserted, "Batch saved");
                let links: Vec<&str> = drafts.iter().map(|d| d.link.as_str()).collect();
                Ok(db.pending_articles_by_links(&links).await?)
            }
            WorkBatch::Stored(ids) => Ok(db.pending_articles_by_ids(&ids).await?),
        }
    }

    /// Enrich one stored article and record the outcome.
    ///
    /// Every path sets the attempted flag: extracted text on success, a timeout
    /// notice on deadline, `Failed to process: ...` on error (the error is then
    /// returned too).
    pub async fn enrich_item(&self, article: &Article) -> Result<ItemOutcome, EnrichError> {
        let settings = &self.inner.settings;
        let max_chars = settings.max_description_chars;

        match fetch_with_deadline(&self.inner.client, &article.link, settings.item_timeout(), max_chars)
            .await
        {
            Ok(text) => {
                self.inner.db.record_enrichment(article.id, &text).await?;
                Ok(ItemOutcome::Processed)
            }
            Err(EnrichError::Timeout(ms)) => {
                tracing::debug!(link = %article.link, timeout_ms = ms, "Enrichment timed out");
                self.inner
                    .db
                    .record_enrichment(article.id, &format!("skipped: timeout after {ms}ms"))
                    .await?;
                Ok(ItemOutcome::Skipped)
            }
            Err(e) => {
                let description = format!("Failed to process: {e}");
                self.inner
                    .db
                    .record_enrichment(article.id, &truncate_chars(&description, max_chars))
                    .await?;
                Err(e)
            }
        }
    }
}

/// Races the page fetch against `deadline`. The losing fetch is cancelled and has
/// no side effects: nothing is written until the race is decided.
async fn fetch_with_deadline(
    client: &reqwest::Client,
    link: &str,
    deadline: Duration,
    max_chars: usize,
) -> Result<String, EnrichError> {
    let deadline_ms = deadline.as_millis() as u64;
    let cancel = CancellationToken::new();
    let token = cancel.child_token();
    let client = client.clone();
    let link = link.to_string();

    let mut fetch = tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => None,
            text = fetch_article_text(&client, &link, deadline, max_chars) => Some(text),
        }
    });

    tokio::select! {
        joined = &mut fetch => match joined {
            Ok(Some(result)) => result,
            Ok(None) => Err(EnrichError::Timeout(deadline_ms)),
            Err(e) => Err(EnrichError::Parse(e.to_string())),
        },
        _ = tokio::time::sleep(deadline) => {
            cancel.cancel();
            Err(EnrichError::Timeout(deadline_ms))
        }
    }
}

async fn fetch_article_text(
    client: &reqwest::Client,
    link: &str,
    deadline: Duration,
    max_chars: usize,
) -> Result<String, EnrichError> {
    // The outer race owns the deadline; the request timeout only backs it up.
    let request_timeout = deadline.saturating_add(Duration::from_secs(1));
    let bytes = match fetch_bytes(client, link, PAGE_ACCEPT, request_timeout).await {
        Ok(bytes) => bytes,
        Err(FetchError::Timeout) => return Err(EnrichError::Timeout(deadline.as_millis() as u64)),
        Err(e) => return Err(e.into()),
    };

    let html = String::from_utf8_lossy(&bytes);
    Ok(extract_article_text(&html, max_chars))
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
