//! Publisher roster maintenance: outline ingestion and unreachable-feed pruning.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::feed::{fetch_bytes, fetch_feed, parse_outline};
use crate::storage::{Database, PersistenceError, Publisher};

const OUTLINE_ACCEPT: &str = "text/x-opml,application/xml,text/xml;q=0.9,*/*;q=0.8";

/// Outcome of an outline ingestion. Never an error: failures land in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutlineReport {
    /// Valid entries upserted
    pub processed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub checked: usize,
    pub deleted: usize,
}

/// Parses `raw` as OPML and upserts the valid entries keyed on title.
pub async fn ingest_outline_document(db: &Database, raw: &str, batch_size: usize) -> OutlineReport {
    let entries = match parse_outline(raw) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "Outline document rejected");
            return OutlineReport {
                processed: 0,
                errors: vec![e.to_string()],
            };
        }
    };

    match db.upsert_publishers(&entries, batch_size).await {
        Ok(_) => {
            tracing::info!(publishers = entries.len(), "Outline ingested");
            OutlineReport {
                processed: entries.len(),
                errors: Vec::new(),
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to store outline publishers");
            OutlineReport {
                processed: 0,
                errors: vec![e.to_string()],
            }
        }
    }
}

/// Downloads an outline document and ingests it. Download failures are reported, not raised.
pub async fn ingest_outline_from_url(
    db: &Database,
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    batch_size: usize,
) -> OutlineReport {
    let bytes = match fetch_bytes(client, url, OUTLINE_ACCEPT, timeout).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Outline download failed");
            return OutlineReport {
                processed: 0,
                errors: vec![format!("{url}: {e}")],
            };
        }
    };

    let raw = String::from_utf8_lossy(&bytes);
    ingest_outline_document(db, &raw, batch_size).await
}

/// Fetches every publisher's feed and deletes publishers whose fetch fails.
///
/// At most `group_size` fetches run at once. A failed delete is logged and the
/// sweep continues.
pub async fn prune_unreachable(
    db: &Database,
    client: &reqwest::Client,
    timeout: Duration,
    group_size: usize,
) -> Result<PruneReport, PersistenceError> {
    let publishers = db.list_publishers().await?;
    let checked = publishers.len();

    let deleted: usize = stream::iter(publishers)
        .map(|publisher| async move { check_publisher(db, client, &publisher, timeout).await })
        .buffer_unordered(group_size.max(1))
        .filter(|removed| std::future::ready(*removed))
        .count()
        .await;

    tracing::info!(checked, deleted, "Publisher prune complete");
    Ok(PruneReport { checked, deleted })
}

/// Returns `true` if the publisher was unreachable and has been deleted.
async fn check_publisher(
    db: &Database,
    client: &reqwest::Client,
    publisher: &Publisher,
    timeout: Duration,
) -> bool {
    let Err(e) = fetch_feed(client, &publisher.feed_url, timeout).await else {
        return false;
    };

    tracing::info!(
        publisher = %publisher.title,
        feed = %publisher.feed_url,
        error = %e,
        "Feed unreachable, removing publisher"
    );

    match db.delete_publisher(publisher.id).await {
        Ok(removed) => removed,
        Err(db_err) => {
            tracing::warn!(publisher = %publisher.title, error = %db_err, "Failed to delete publisher");
            false
        }
    }
}
