//! Reverse-chronological activity keys.
//!
//! Keys must sort ascending-lexicographic = newest-first. Layout: a
//! microsecond timestamp subtracted from `i64::MAX`, zero-padded to 20
//! digits, then `_` and a sanitized message id for uniqueness when two
//! records share a timestamp.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

static SUFFIX_SANITIZER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]").unwrap());

/// Build the storage key for an activity record.
pub fn activity_key(processed_at: DateTime<Utc>, message_id: &str) -> String {
    let inverted = i64::MAX.saturating_sub(processed_at.timestamp_micros());
    let suffix = SUFFIX_SANITIZER.replace_all(message_id, "_");
    format!("{inverted:020}_{suffix}")
}
