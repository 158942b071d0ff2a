//! HTTP trigger surface. Every route runs one facade operation and answers
//! with its JSON summary.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::app::{App, StatusReport, UpdateReport};
use crate::config::DispatchMode;
use crate::enrich::RunSummary;
use crate::pipeline::CollectReport;
use crate::registry::{OutlineReport, PruneReport};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Body of `POST /process/opml`. With neither field set the configured outline URL is used.
#[derive(Debug, Default, Deserialize)]
pub struct OutlineRequest {
    pub url: Option<String>,
    /// Raw OPML text, preferred over `url`
    pub document: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CollectParams {
    pub mode: Option<DispatchMode>,
}

#[derive(Debug, Serialize)]
pub struct FlushReport {
    pub removed: u64,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

pub fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/process/opml", post(ingest_outline))
        .route("/process/publishers", post(prune_publishers))
        .route("/process/articles", post(collect_articles))
        .route("/process/flush", post(flush_queue))
        .route("/process/update", post(update))
        .route("/process/enrich", post(enrich_backlog))
        .route("/process/status", get(status))
        .with_state(app)
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!(error = %format!("{e:#}"), "Request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
}

async fn health(State(app): State<Arc<App>>) -> (StatusCode, Json<Health>) {
    match app.database().ping().await {
        Ok(()) => (StatusCode::OK, Json(Health { status: "ok" })),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(Health { status: "unavailable" }))
        }
    }
}

async fn ingest_outline(State(app): State<Arc<App>>, body: Bytes) -> ApiResult<OutlineReport> {
    let request: OutlineRequest = if body.iter().all(u8::is_ascii_whitespace) {
        OutlineRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    };

    let report = match (request.document, request.url) {
        (Some(document), _) => app.ingest_outline_document(&document).await,
        (None, url) => app.ingest_outline_url(url.as_deref()).await,
    };
    Ok(Json(report))
}

async fn prune_publishers(State(app): State<Arc<App>>) -> ApiResult<PruneReport> {
    app.prune_publishers().await.map(Json).map_err(internal)
}

async fn collect_articles(
    State(app): State<Arc<App>>,
    Query(params): Query<CollectParams>,
) -> ApiResult<CollectReport> {
    app.collect(params.mode).await.map(Json).map_err(internal)
}

async fn flush_queue(State(app): State<Arc<App>>) -> ApiResult<FlushReport> {
    app.flush_queue()
        .await
        .map(|removed| Json(FlushReport { removed }))
        .map_err(internal)
}

async fn update(State(app): State<Arc<App>>) -> ApiResult<UpdateReport> {
    app.update().await.map(Json).map_err(internal)
}

async fn enrich_backlog(State(app): State<Arc<App>>) -> ApiResult<RunSummary> {
    app.enrich_backlog().await.map(Json).map_err(internal)
}

async fn status(State(app): State<Arc<App>>) -> ApiResult<StatusReport> {
    app.status().await.map(Json).map_err(internal)
}
