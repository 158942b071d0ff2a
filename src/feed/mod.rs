//! Feed retrieval and parsing.
//!
//! - [`fetcher`] - HTTP GET with timeout, body cap and status checks
//! - [`parser`] - prologue cleanup and RSS/Atom/JSON Feed parsing via `feed-rs`
//! - [`normalize`] - entry to [`NewArticle`](crate::storage::NewArticle) mapping
//! - [`opml`] - outline documents listing publishers
//!
//! # Example
//!
//! ```ignore
//! use feedmill::feed::{fetch_feed, normalize_feed};
//!
//! let feed = fetch_feed(&client, &publisher.feed_url, timeout).await?;
//! let drafts = normalize_feed(&feed, Some(publisher.id)).articles;
//! ```

mod fetcher;
mod normalize;
mod opml;
mod parser;

pub(crate) use fetcher::fetch_bytes;
pub use fetcher::{fetch_feed, FetchError, FEED_ACCEPT, MAX_RESPONSE_SIZE};
pub use normalize::{normalize_entry, normalize_feed, Normalized};
pub use opml::{parse_outline, OpmlError};
pub use parser::parse_feed;
