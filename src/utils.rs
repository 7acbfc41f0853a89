//! Utility functions for string shaping and file system preparation.
//!
//! This module provides helper functions used throughout the crate:
//! - String truncation for logging and abstracts
//! - Whitespace normalization for scraped text
//! - Directory preparation for the session mirror

use std::io;
use std::path::Path;
use tokio::fs;
use tracing::{debug, instrument};

/// Truncate a string for logging purposes.
///
/// Long strings are truncated to `max` characters with an ellipsis and
/// byte count indicator appended. Cuts on character boundaries, so Turkish
/// text never splits a code point.
///
/// # Arguments
///
/// * `s` - The string to potentially truncate
/// * `max` - Maximum number of characters to keep
///
/// # Returns
///
/// The original string if it has at most `max` characters, otherwise a
/// truncated version with `"…(+N bytes)"` appended.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}…(+{} bytes)", &s[..cut], s.len() - cut),
    }
}

/// Collapse every whitespace run to a single space and trim the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keep the first `max` words, marking a cut with a trailing `...`.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_words("bir iki üç", 2), "bir iki...");
/// assert_eq!(truncate_words("bir iki", 2), "bir iki");
/// ```
pub fn truncate_words(s: &str, max: usize) -> String {
    let words: Vec<&str> = s.split_whitespace().collect();
    if words.len() <= max {
        words.join(" ")
    } else {
        format!("{}...", words[..max].join(" "))
    }
}

/// Make sure the parent directory of `path` exists.
///
/// # Errors
///
/// Returns the underlying I/O error if the directory cannot be created.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).await?;
            debug!("Parent directory ready");
            Ok(())
        }
        _ => Ok(()),
    }
}
