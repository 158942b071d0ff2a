use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Literal stored when an item has no usable description text.
pub const FALLBACK_DESCRIPTION: &str =
    "No description data is available, please click the link to read more.";

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid regex"));

static IFRAME_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<iframe\b[^>]*>.*?</iframe\s*>").expect("valid regex"));

static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Reduces feed markup to plain text, substituting [`FALLBACK_DESCRIPTION`]
/// when nothing readable is left.
///
/// Passes, in order:
/// 1. `<script>` and `<iframe>` blocks are removed together with their content
///    (lazy match, so two blocks never swallow the text between them)
/// 2. every remaining tag is replaced by a space
/// 3. space entities (`&nbsp;`, `&#160;`) become spaces
/// 4. whitespace runs collapse to a single space
/// 5. `&quot;`, `&lt;`, `&gt;` and finally `&amp;` are decoded
/// 6. the result is trimmed
///
/// Never fails: malformed markup degrades to whatever text survives the passes.
///
/// # Examples
///
/// ```
/// use feedmill::util::{sanitize, FALLBACK_DESCRIPTION};
///
/// assert_eq!(sanitize("<b>Rust</b>&nbsp;1.80 &gt; 1.79"), "Rust 1.80 > 1.79");
/// assert_eq!(sanitize("<script>alert(1)</script>"), FALLBACK_DESCRIPTION);
/// assert_eq!(sanitize(""), FALLBACK_DESCRIPTION);
/// ```
pub fn sanitize(raw: &str) -> String {
    let text = strip_markup(raw);
    if text.is_empty() {
        FALLBACK_DESCRIPTION.to_string()
    } else {
        text
    }
}

/// Same pipeline as [`sanitize`] without the fallback literal.
///
/// Used for titles, where an empty result is handled by the caller.
pub fn strip_markup(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let without_blocks = SCRIPT_BLOCK.replace_all(raw, "");
    let without_blocks = IFRAME_BLOCK.replace_all(&without_blocks, "");
    let without_tags = ANY_TAG.replace_all(&without_blocks, " ");

    let spaced = without_tags.replace("&nbsp;", " ").replace("&#160;", " ");
    let collapsed = collapse_whitespace(&spaced);

    // &amp; last so "&amp;lt;" decodes to the literal "&lt;" rather than "<"
    collapsed
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// Collapses every whitespace run (spaces, tabs, newlines) into one space and trims.
///
/// Returns `Cow::Borrowed` when the input is already normalized.
pub fn collapse_whitespace(s: &str) -> Cow<'_, str> {
    let trimmed = s.trim();
    let needs_collapse = trimmed
        .as_bytes()
        .windows(2)
        .any(|w| w[0].is_ascii_whitespace() && w[1].is_ascii_whitespace())
        || trimmed.chars().any(|c| c.is_whitespace() && c != ' ');

    if !needs_collapse {
        return Cow::Borrowed(trimmed);
    }

    Cow::Owned(WHITESPACE_RUN.replace_all(trimmed, " ").into_owned())
}

/// Truncates a string to at most `max_chars` characters.
///
/// Cuts on a char boundary so multi-byte text never produces invalid UTF-8.
/// Returns `Cow::Borrowed` when no truncation is needed.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => Cow::Owned(s[..byte_idx].to_string()),
        None => Cow::Borrowed(s),
    }
}
