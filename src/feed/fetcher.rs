use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

use super::parser::parse_feed;

/// Body cap for feeds, outline documents and article pages
pub const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// `Accept` header sent with feed requests
pub const FEED_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// Errors that can occur while retrieving a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Body could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
}

/// Fetches and parses one feed.
///
/// Any non-2xx status is a failure; there is no retry here. Callers decide
/// whether a failure skips the publisher (collection) or removes it (pruning).
///
/// # Errors
///
/// - [`FetchError::Network`] - Connection or TLS errors
/// - [`FetchError::Timeout`] - Request plus body exceeded `timeout`
/// - [`FetchError::HttpStatus`] - Non-2xx HTTP response
/// - [`FetchError::ResponseTooLarge`] - Response exceeded 10MB
/// - [`FetchError::Parse`] - Body is not a recognizable feed
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<feed_rs::model::Feed, FetchError> {
    let bytes = fetch_bytes(client, url, FEED_ACCEPT, timeout).await?;
    let feed = parse_feed(&bytes)?;
    tracing::debug!(feed = %url, entries = feed.entries.len(), "Fetched feed");
    Ok(feed)
}

/// GET `url` and return the body, bounded by `timeout` and [`MAX_RESPONSE_SIZE`].
pub(crate) async fn fetch_bytes(
    client: &reqwest::Client,
    url: &str,
    accept: &str,
    timeout: Duration,
) -> Result<Vec<u8>, FetchError> {
    let request = async {
        let response = client
            .get(url)
            .header(reqwest::header::ACCEPT, accept)
            .send()
            .await
            .map_err(classify)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, MAX_RESPONSE_SIZE).await
    };

    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| FetchError::Timeout)?
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
