use std::collections::HashSet;

use feed_rs::model::{Feed, Link, MediaContent};
use feed_rs::parser;
use quick_xml::events::Event;
use quick_xml::Reader;
use url::Url;

use super::fetcher::FetchError;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Parses RSS, Atom or JSON Feed bytes.
///
/// Feeds in the wild often carry junk before the document: a byte-order
/// mark, blank lines, or stray bytes emitted by a misbehaving CMS. Everything
/// before the first `<` is dropped before parsing.
pub fn parse_feed(bytes: &[u8]) -> Result<Feed, FetchError> {
    let cleaned = clean_prologue(bytes);
    if cleaned.is_empty() {
        return Err(FetchError::Parse("document contains no markup".to_string()));
    }
    let mut feed = parser::parse(cleaned).map_err(|e| FetchError::Parse(e.to_string()))?;
    relocate_enclosures(&mut feed, cleaned);
    Ok(feed)
}

/// Moves RSS `<enclosure>` items out of `media` into `links` with `rel="enclosure"`.
///
/// feed-rs files enclosures and `media:content` under one media object in
/// document order, so an enclosure listed first would otherwise shadow the
/// item's media content.
fn relocate_enclosures(feed: &mut Feed, document: &[u8]) {
    let enclosures = enclosure_urls(document);
    if enclosures.is_empty() {
        return;
    }

    for entry in &mut feed.entries {
        for media in &mut entry.media {
            let (moved, kept): (Vec<MediaContent>, Vec<MediaContent>) =
                std::mem::take(&mut media.content)
                    .into_iter()
                    .partition(|c| c.url.as_ref().is_some_and(|u| enclosures.contains(u)));
            media.content = kept;

            entry.links.extend(moved.into_iter().filter_map(|c| {
                Some(Link {
                    href: c.url?.to_string(),
                    rel: Some("enclosure".to_string()),
                    media_type: c.content_type.map(|t| t.to_string()),
                    href_lang: None,
                    title: None,
                    length: c.size,
                })
            }));
        }
    }
}

/// URLs of every unprefixed `<enclosure>` element in the document.
fn enclosure_urls(document: &[u8]) -> HashSet<Url> {
    let mut reader = Reader::from_reader(document);
    let mut buf = Vec::new();
    let mut urls = HashSet::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e) | Event::Empty(e)) if e.name().as_ref() == b"enclosure" => {
                let url = e
                    .try_get_attribute("url")
                    .ok()
                    .flatten()
                    .and_then(|attr| attr.decode_and_unescape_value(reader.decoder()).ok())
                    .and_then(|raw| Url::parse(raw.trim()).ok());
                urls.extend(url);
            }
            // feed-rs already accepted the document; a late error only ends the scan
            Ok(Event::Eof) | Err(_) => break,
            Ok(_) => {}
        }
        buf.clear();
    }

    urls
}

/// Strips a leading BOM, leading whitespace and any leading non-`<` bytes.
fn clean_prologue(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match bytes.iter().position(|&b| b == b'<') {
        Some(start) => &bytes[start..],
        None => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title>
    <item><title>One</title><link>https://example.com/1</link></item>
</channel></rss>"#;

    #[test]
    fn test_parse_plain_feed() {
        let feed = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(feed.entries.len(), 1);
    }

    #[test]
    fn test_parse_strips_bom_and_junk_prologue() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"\n\n  garbage from a plugin\n");
        bytes.extend_from_slice(RSS.as_bytes());

        let feed = parse_feed(&bytes).unwrap();
        assert_eq!(feed.entries.len(), 1);
    }

    #[test]
    fn test_clean_prologue_without_markup_is_empty() {
        assert!(clean_prologue(b"no tags here").is_empty());
        assert!(matches!(
            parse_feed(b"no tags here"),
            Err(FetchError::Parse(_))
        ));
    }

    #[test]
    fn test_enclosure_moved_to_links_and_media_content_kept() {
        let feed = parse_feed(
            br#"<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/"><channel><title>T</title>
  <item><title>Ep</title><link>https://example.com/ep</link>
    <enclosure url="https://cdn.example.com/ep.mp3" length="1024" type="audio/mpeg"/>
    <media:content url="https://cdn.example.com/cover.jpg" medium="image"/>
  </item>
</channel></rss>"#,
        )
        .unwrap();

        let entry = &feed.entries[0];
        let media: Vec<_> = entry
            .media
            .iter()
            .flat_map(|m| &m.content)
            .filter_map(|c| c.url.as_ref().map(Url::as_str))
            .collect();
        assert_eq!(media, vec!["https://cdn.example.com/cover.jpg"]);

        let enclosure = entry
            .links
            .iter()
            .find(|l| l.rel.as_deref() == Some("enclosure"))
            .unwrap();
        assert_eq!(enclosure.href, "https://cdn.example.com/ep.mp3");
        assert_eq!(enclosure.length, Some(1024));
        assert_eq!(enclosure.media_type.as_deref(), Some("audio/mpeg"));
    }

    #[test]
    fn test_clean_prologue_keeps_clean_input() {
        assert_eq!(clean_prologue(b"<rss/>"), b"<rss/>");
    }
}
