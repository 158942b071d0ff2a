//! Utility functions for common operations.
//!
//! This module provides reusable utilities for:
//!
//! - **URL validation**: scheme and host checks for feed and article links
//! - **Text processing**: markup sanitization, entity decoding and char-safe truncation
//!
//! # Examples
//!
//! ```
//! use feedmill::util::{sanitize, truncate_chars, validate_url};
//!
//! // Validate a feed URL
//! let url = validate_url("https://example.com/feed.xml").unwrap();
//!
//! // Reduce feed markup to plain text
//! assert_eq!(sanitize("<p>Hello &amp; welcome</p>"), "Hello & welcome");
//!
//! // Cap stored descriptions without splitting a character
//! assert_eq!(truncate_chars("héllo", 2), "hé");
//! ```

mod text;
mod url_validator;

pub use text::{collapse_whitespace, sanitize, strip_markup, truncate_chars, FALLBACK_DESCRIPTION};
pub use url_validator::{validate_url, UrlValidationError};

/// Maximum length of publisher titles and feed URLs accepted from outline documents
pub const MAX_SOURCE_FIELD_LEN: usize = 255;
