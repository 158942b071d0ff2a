use std::sync::LazyLock;

use scraper::{Html, Selector};

use crate::util::{collapse_whitespace, truncate_chars, FALLBACK_DESCRIPTION};

/// Elements removed before any text is read
static NOISE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script, style, iframe, img").expect("valid selector"));

/// Likely article containers; the first match in document order is used
static CONTENT_REGION: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("article, .article, .post, .content, main").expect("valid selector")
});

/// Extracts the readable body of an article page.
///
/// Drops `script, style, iframe, img` nodes, takes the text of the first
/// `article, .article, .post, .content, main` element, collapses whitespace and
/// truncates to `max_chars`. Pages without a content region (or with an empty
/// one) yield the fallback description.
pub fn extract_article_text(html: &str, max_chars: usize) -> String {
    let mut doc = Html::parse_document(html);

    let noise: Vec<_> = doc.select(&NOISE).map(|el| el.id()).collect();
    for id in noise {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }

    let text: String = doc
        .select(&CONTENT_REGION)
        .next()
        .map(|region| region.text().collect())
        .unwrap_or_default();

    let text = collapse_whitespace(&text);
    if text.is_empty() {
        return FALLBACK_DESCRIPTION.to_string();
    }
    truncate_chars(&text, max_chars).into_owned()
}
