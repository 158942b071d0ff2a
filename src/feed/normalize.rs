//! Mapping of parsed feed entries to [`NewArticle`] drafts.
//!
//! Image and description each come from an ordered list of strategies; the
//! first strategy yielding a non-empty value wins.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed};
use regex::Regex;

use crate::storage::{sentinel_published, NewArticle};
use crate::util::{sanitize, strip_markup, FALLBACK_DESCRIPTION};

const UNTITLED: &str = "Untitled";

static INLINE_IMG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<img[^>]+src="([^">]+)""#).expect("valid regex"));

type ImageStrategy = fn(&Entry) -> Option<String>;
type DescriptionStrategy = for<'a> fn(&'a Entry, &'a Feed) -> Option<&'a str>;

/// Image sources, most specific first.
const IMAGE_STRATEGIES: &[(&str, ImageStrategy)] = &[
    ("media_content", media_content_image as ImageStrategy),
    ("enclosure", enclosure_image as ImageStrategy),
    ("inline_img", inline_image as ImageStrategy),
    ("media_thumbnail", media_thumbnail_image as ImageStrategy),
];

/// Description sources. The fallback literal applies when all of them are empty.
const DESCRIPTION_STRATEGIES: &[(&str, DescriptionStrategy)] = &[
    ("snippet", entry_summary as DescriptionStrategy),
    ("content", entry_content as DescriptionStrategy),
    ("feed_description", feed_description as DescriptionStrategy),
];

/// Result of normalizing one feed
#[derive(Debug, Default)]
pub struct Normalized {
    pub articles: Vec<NewArticle>,
    /// Entries dropped because they carry no link to dedupe on
    pub skipped_without_link: usize,
}

/// Normalizes every entry of `feed`, preserving feed order.
pub fn normalize_feed(feed: &Feed, publisher_id: Option<i64>) -> Normalized {
    let mut out = Normalized::default();

    for entry in &feed.entries {
        match normalize_entry(entry, feed, publisher_id) {
            Some(article) => out.articles.push(article),
            None => out.skipped_without_link += 1,
        }
    }

    out
}

/// Returns `None` for entries without a usable link.
pub fn normalize_entry(entry: &Entry, feed: &Feed, publisher_id: Option<i64>) -> Option<NewArticle> {
    let link = select_link(entry)?;

    let title = entry
        .title
        .as_ref()
        .map(|t| strip_markup(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    Some(NewArticle {
        publisher_id,
        title,
        description: Some(select_description(entry, feed)),
        image_link: Some(select_image(entry)),
        link,
        published_at: select_published(entry),
    })
}

/// First non-empty alternate link, else the first non-enclosure link.
fn select_link(entry: &Entry) -> Option<String> {
    let candidates = || {
        entry.links.iter().filter(|l| {
            !l.href.trim().is_empty()
                && !l
                    .rel
                    .as_deref()
                    .is_some_and(|rel| rel.eq_ignore_ascii_case("enclosure"))
        })
    };

    candidates()
        .find(|l| {
            l.rel
                .as_deref()
                .map_or(true, |rel| rel.is_empty() || rel.eq_ignore_ascii_case("alternate"))
        })
        .or_else(|| candidates().next())
        .map(|l| l.href.trim().to_string())
}

fn select_image(entry: &Entry) -> String {
    IMAGE_STRATEGIES
        .iter()
        .find_map(|(name, strategy)| {
            strategy(entry).inspect(|url| {
                tracing::trace!(strategy = name, url = %url, "Selected image");
            })
        })
        .unwrap_or_default()
}

fn select_description(entry: &Entry, feed: &Feed) -> String {
    DESCRIPTION_STRATEGIES
        .iter()
        .filter_map(|(_, strategy)| strategy(entry, feed))
        .find(|raw| !raw.trim().is_empty())
        .map(sanitize)
        .unwrap_or_else(|| FALLBACK_DESCRIPTION.to_string())
}

fn select_published(entry: &Entry) -> DateTime<Utc> {
    entry
        .published
        .or(entry.updated)
        .unwrap_or_else(sentinel_published)
}

// ============================================================================
// Image strategies
// ============================================================================

fn media_content_image(entry: &Entry) -> Option<String> {
    entry
        .media
        .iter()
        .flat_map(|m| &m.content)
        .filter_map(|c| c.url.as_ref())
        .map(|u| u.as_str().trim())
        .find(|u| !u.is_empty())
        .map(str::to_string)
}

fn enclosure_image(entry: &Entry) -> Option<String> {
    entry
        .links
        .iter()
        .filter(|l| {
            l.rel
                .as_deref()
                .is_some_and(|rel| rel.eq_ignore_ascii_case("enclosure"))
        })
        .map(|l| l.href.trim())
        .find(|href| !href.is_empty())
        .map(str::to_string)
}

fn inline_image(entry: &Entry) -> Option<String> {
    let content = entry.content.as_ref().and_then(|c| c.body.as_deref());
    let summary = entry.summary.as_ref().map(|s| s.content.as_str());

    [content, summary]
        .into_iter()
        .flatten()
        .find_map(|html| INLINE_IMG.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn media_thumbnail_image(entry: &Entry) -> Option<String> {
    entry
        .media
        .iter()
        .flat_map(|m| &m.thumbnails)
        .map(|t| t.image.uri.trim())
        .find(|uri| !uri.is_empty())
        .map(str::to_string)
}

// ============================================================================
// Description strategies
// ============================================================================

fn entry_summary<'a>(entry: &'a Entry, _feed: &'a Feed) -> Option<&'a str> {
    entry.summary.as_ref().map(|s| s.content.as_str())
}

fn entry_content<'a>(entry: &'a Entry, _feed: &'a Feed) -> Option<&'a str> {
    entry.content.as_ref().and_then(|c| c.body.as_deref())
}

fn feed_description<'a>(_entry: &'a Entry, feed: &'a Feed) -> Option<&'a str> {
    feed.description.as_ref().map(|d| d.content.as_str())
}
