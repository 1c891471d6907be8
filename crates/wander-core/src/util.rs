//! Shared utility functions used across multiple modules.

use chrono::{DateTime, Utc};

/// Normalize a record identifier for comparison.
///
/// Server and client may disagree on identifier case, so every lookup,
/// ledger entry and map key goes through this.
pub fn normalize_id(id: &str) -> String {
    id.trim().to_lowercase()
}

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current UTC time truncated to microsecond precision, the resolution
/// timestamps are persisted with.
pub fn now_utc() -> DateTime<Utc> {
    truncate_to_micros(Utc::now())
}

/// Drop sub-microsecond precision so stored and in-memory values compare equal.
pub fn truncate_to_micros(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(value.timestamp_micros()).unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_id_lowercases_and_trims() {
        assert_eq!(normalize_id(" LOG-1A "), "log-1a");
        assert_eq!(normalize_id("ABC-def"), normalize_id("abc-DEF"));
    }

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" https://example.com ".to_string())),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
        assert!(!is_http_url("example.com"));
    }

    #[test]
    fn now_utc_has_micro_precision() {
        let now = now_utc();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000, 0);
    }
}
