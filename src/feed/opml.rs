use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::storage::OutlineEntry;
use crate::util::{validate_url, MAX_SOURCE_FIELD_LEN};

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
/// Prevents stack overflow attacks from maliciously crafted deeply nested OPMLs.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Well-formed XML, but no `<opml>` root element.
    #[error("Document is not an OPML outline")]
    NotOpml,
}

/// Parses an OPML document into publisher candidates.
///
/// Every `<outline>` carrying an `xmlUrl` is considered, at any nesting depth;
/// folder outlines are traversed but not returned. Candidates are dropped (with a
/// log line) when the title or URL is missing, longer than 255 characters, or the
/// URL is not HTTP(S).
///
/// # Security
///
/// XXE (XML External Entity) attacks are mitigated because `quick-xml` (0.37) does not
/// parse `<!ENTITY>` declarations. Custom entities cause `EscapeError::UnrecognizedEntity`.
pub fn parse_outline(content: &str) -> Result<Vec<OutlineEntry>, OpmlError> {
    // SEC-002: decode_and_unescape_value() (not `_with()`) only resolves the 5 XML builtins.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut seen_root = false;
    // SEC-003: Track nesting depth to prevent stack overflow from malicious OPMLs
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"opml" => seen_root = true,
            Ok(Event::Empty(e)) if e.name().as_ref() == b"opml" => seen_root = true,
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                entries.extend(outline_entry(&e, &reader)?);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                // Self-closing outline doesn't affect depth
                entries.extend(outline_entry(&e, &reader)?);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
    }

    if !seen_root {
        return Err(OpmlError::NotOpml);
    }

    Ok(entries)
}

/// Extracts a candidate from an outline element.
///
/// `title` wins over `text` regardless of attribute order.
fn outline_entry(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<OutlineEntry>, OpmlError> {
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || {
            attr.decode_and_unescape_value(reader.decoder())
                .map(|v| v.trim().to_string())
                .map_err(|e| OpmlError::XmlParse(e.to_string()))
        };
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value()?),
            b"title" => title = Some(value()?),
            b"text" => text = Some(value()?),
            _ => {}
        }
    }

    let Some(feed_url) = xml_url.filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    let Some(title) = title.filter(|t| !t.is_empty()).or(text.filter(|t| !t.is_empty())) else {
        tracing::warn!(url = %feed_url, "Skipping OPML outline without title");
        return Ok(None);
    };

    if title.chars().count() > MAX_SOURCE_FIELD_LEN || feed_url.chars().count() > MAX_SOURCE_FIELD_LEN {
        tracing::warn!(title = %title, "Skipping OPML outline with oversized title or URL");
        return Ok(None);
    }

    if let Err(e) = validate_url(&feed_url) {
        tracing::warn!(url = %feed_url, error = %e, "Skipping invalid feed URL");
        return Ok(None);
    }

    Ok(Some(OutlineEntry { title, feed_url }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(title: &str, url: &str) -> OutlineEntry {
        OutlineEntry {
            title: title.into(),
            feed_url: url.into(),
        }
    }

    #[test]
    fn test_flat_outline() {
        let opml = r#"<?xml version="1.0"?>
<opml version="2.0"><head><title>Blogs</title></head><body>
  <outline type="rss" text="Alpha" title="Alpha" xmlUrl="https://alpha.example.com/rss"/>
  <outline type="rss" text="Beta" xmlUrl="https://beta.example.com/atom.xml"/>
</body></opml>"#;

        assert_eq!(
            parse_outline(opml).unwrap(),
            vec![
                entry("Alpha", "https://alpha.example.com/rss"),
                entry("Beta", "https://beta.example.com/atom.xml"),
            ]
        );
    }

    #[test]
    fn test_nested_folders_are_traversed() {
        let opml = r#"<opml version="1.0"><body>
  <outline text="Engineering Blogs">
    <outline text="Companies">
      <outline text="Gamma" xmlUrl="https://gamma.example.com/feed"/>
    </outline>
    <outline text="Delta" xmlUrl="https://delta.example.com/feed"></outline>
  </outline>
</body></opml>"#;

        let entries = parse_outline(opml).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Gamma");
        assert_eq!(entries[1].title, "Delta");
    }

    #[test]
    fn test_title_preferred_over_text_in_any_order() {
        let opml = r#"<opml><body>
  <outline text="Short" title="Full Title" xmlUrl="https://a.example.com/rss"/>
</body></opml>"#;
        assert_eq!(parse_outline(opml).unwrap()[0].title, "Full Title");
    }

    #[test]
    fn test_drops_incomplete_and_oversized_entries() {
        let long_title = "t".repeat(256);
        let long_url = format!("https://example.com/{}", "p".repeat(255));
        let opml = format!(
            r#"<opml><body>
  <outline text="No URL"/>
  <outline xmlUrl="https://untitled.example.com/rss"/>
  <outline text="{long_title}" xmlUrl="https://long.example.com/rss"/>
  <outline text="Long URL" xmlUrl="{long_url}"/>
  <outline text="Local file" xmlUrl="file:///etc/passwd"/>
  <outline text="Keep" xmlUrl="https://keep.example.com/rss"/>
</body></opml>"#
        );

        assert_eq!(
            parse_outline(&opml).unwrap(),
            vec![entry("Keep", "https://keep.example.com/rss")]
        );
    }

    #[test]
    fn test_boundary_length_is_accepted() {
        let title = "t".repeat(255);
        let opml = format!(
            r#"<opml><body><outline text="{title}" xmlUrl="https://a.example.com/rss"/></body></opml>"#
        );
        assert_eq!(parse_outline(&opml).unwrap().len(), 1);
    }

    #[test]
    fn test_entities_are_decoded() {
        let opml = r#"<opml><body>
  <outline text="Q&amp;A" xmlUrl="https://a.example.com/rss?x=1&amp;y=2"/>
</body></opml>"#;
        assert_eq!(
            parse_outline(opml).unwrap(),
            vec![entry("Q&A", "https://a.example.com/rss?x=1&y=2")]
        );
    }

    #[test]
    fn test_mismatched_tags_are_errors() {
        let err = parse_outline("<opml><body></head></opml>").unwrap_err();
        assert!(matches!(err, OpmlError::XmlParse(_)), "got {err:?}");
    }

    #[test]
    fn test_non_opml_document_is_error() {
        assert!(matches!(
            parse_outline("just some text"),
            Err(OpmlError::NotOpml)
        ));
        assert!(matches!(
            parse_outline("<rss><channel/></rss>"),
            Err(OpmlError::NotOpml)
        ));
    }

    #[test]
    fn test_depth_limit() {
        let mut opml = String::from("<opml><body>");
        for _ in 0..=MAX_OPML_DEPTH {
            opml.push_str("<outline text=\"f\">");
        }
        for _ in 0..=MAX_OPML_DEPTH {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        assert!(matches!(
            parse_outline(&opml),
            Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH))
        ));
    }
}
