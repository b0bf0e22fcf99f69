//! Forgiving input normalization.
//!
//! Hosts hand the kernel loosely typed arguments; this layer turns them
//! into real absent values and typed ids so downstream code never sees a
//! literal `"None"` or a stringly-typed number.

use serde_json::Value as JsonValue;
use teambook_core::{ErrorCode, NoteId, RecordIdType, TeambookError};

/// Treat `null`, `""`, `"none"`, `"null"` (case-insensitive) as absent.
pub fn normalize_opt_str(value: Option<&str>) -> Option<String> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.to_ascii_lowercase().as_str() {
        "none" | "null" => None,
        _ => Some(raw.to_string()),
    }
}

/// Same tolerance applied to a JSON value.
pub fn normalize_json_str(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => normalize_opt_str(Some(s)),
        other => Some(other.to_string()),
    }
}

/// Integers accept both JSON numbers and decimal strings.
pub fn normalize_int(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => normalize_opt_str(Some(s))?.parse().ok(),
        _ => None,
    }
}

/// An item reference as hosts are allowed to spell it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdRef {
    /// The last successful write in this process.
    Last,
    Note(NoteId),
    Evolution(NoteId),
    Raw(i64),
}

/// Parse id references: `"last"`, `"note:N"`, `"evo:N"`, or a bare number.
pub fn parse_id_ref(raw: &str) -> Result<IdRef, TeambookError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("last") {
        return Ok(IdRef::Last);
    }
    if let Some(rest) = raw.strip_prefix("note:") {
        return rest
            .parse::<i64>()
            .map(|n| IdRef::Note(NoteId::new(n)))
            .map_err(|_| invalid_item(raw));
    }
    if let Some(rest) = raw.strip_prefix("evo:") {
        return rest
            .parse::<i64>()
            .map(|n| IdRef::Evolution(NoteId::new(n)))
            .map_err(|_| invalid_item(raw));
    }
    raw.parse::<i64>()
        .map(IdRef::Raw)
        .map_err(|_| invalid_item(raw))
}

fn invalid_item(raw: &str) -> TeambookError {
    TeambookError::new(ErrorCode::InvalidItem, format!("cannot parse id '{}'", raw))
}

/// Parse a `since` argument: a unix timestamp or a human window like
/// `"5m"`, `"1h"`, `"2d"`. Defaults to the given fallback window.
pub fn parse_since(
    raw: Option<&str>,
    default_window: chrono::Duration,
) -> Result<teambook_core::Timestamp, TeambookError> {
    let now = chrono::Utc::now();
    let Some(raw) = normalize_opt_str(raw) else {
        return Ok(now - default_window);
    };

    if let Ok(epoch) = raw.parse::<i64>() {
        return chrono::DateTime::from_timestamp(epoch, 0)
            .ok_or_else(|| invalid_item(&raw));
    }

    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let count: i64 = digits.parse().map_err(|_| invalid_item(&raw))?;
    let window = match unit {
        "s" => chrono::Duration::seconds(count),
        "m" => chrono::Duration::minutes(count),
        "h" => chrono::Duration::hours(count),
        "d" => chrono::Duration::days(count),
        _ => return Err(invalid_item(&raw)),
    };
    Ok(now - window)
}

/// Clamp text to a limit, flagging truncation.
pub fn clamp_text(text: &str, limit: usize) -> (String, bool) {
    if text.chars().count() <= limit {
        (text.to_string(), false)
    } else {
        (text.chars().take(limit).collect(), true)
    }
}

/// Collapse runs of whitespace, trim ends.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

/// First sentence or word-bounded prefix, for auto-summaries.
pub fn simple_summary(text: &str, limit: usize) -> String {
    let cleaned = clean_text(text);
    if let Some(end) = cleaned.find(['.', '!', '?']) {
        let sentence = &cleaned[..=end];
        if sentence.chars().count() <= limit {
            return sentence.to_string();
        }
    }
    if cleaned.chars().count() <= limit {
        return cleaned;
    }
    let mut cut: String = cleaned.chars().take(limit).collect();
    if let Some(space) = cut.rfind(' ') {
        cut.truncate(space);
    }
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_none_string_tolerance() {
        assert_eq!(normalize_opt_str(Some("None")), None);
        assert_eq!(normalize_opt_str(Some("null")), None);
        assert_eq!(normalize_opt_str(Some("  ")), None);
        assert_eq!(normalize_opt_str(Some("general")), Some("general".to_string()));
    }

    #[test]
    fn test_int_accepts_decimal_strings() {
        assert_eq!(normalize_int(&serde_json::json!("42")), Some(42));
        assert_eq!(normalize_int(&serde_json::json!(42)), Some(42));
        assert_eq!(normalize_int(&serde_json::json!("x")), None);
    }

    #[test]
    fn test_id_ref_forms() {
        assert_eq!(parse_id_ref("last").unwrap(), IdRef::Last);
        assert_eq!(parse_id_ref("note:7").unwrap(), IdRef::Note(NoteId::new(7)));
        assert_eq!(
            parse_id_ref("evo:10").unwrap(),
            IdRef::Evolution(NoteId::new(10))
        );
        assert_eq!(parse_id_ref("3").unwrap(), IdRef::Raw(3));
        assert!(parse_id_ref("note:x").is_err());
    }

    #[test]
    fn test_parse_since_windows() {
        let now = chrono::Utc::now();
        let hour = parse_since(Some("1h"), chrono::Duration::hours(24)).unwrap();
        assert!((now - hour).num_minutes() >= 59);
        let default = parse_since(None, chrono::Duration::hours(24)).unwrap();
        assert!((now - default).num_hours() >= 23);
        assert!(parse_since(Some("1w"), chrono::Duration::hours(1)).is_err());
    }

    #[test]
    fn test_clamp_boundary() {
        let exactly = "x".repeat(5000);
        assert_eq!(clamp_text(&exactly, 5000).1, false);
        let over = "x".repeat(5001);
        let (cut, truncated) = clamp_text(&over, 5000);
        assert!(truncated);
        assert_eq!(cut.chars().count(), 5000);
    }

    #[test]
    fn test_simple_summary_sentence() {
        assert_eq!(simple_summary("Hello there. More text.", 80), "Hello there.");
        let long = "word ".repeat(40);
        let summary = simple_summary(&long, 20);
        assert!(summary.chars().count() <= 20);
        assert!(!summary.ends_with(' '));
    }

    proptest! {
        #[test]
        fn prop_clamp_never_exceeds_limit(s in ".{0,600}", limit in 1usize..200) {
            let (out, _) = clamp_text(&s, limit);
            prop_assert!(out.chars().count() <= limit);
        }

        #[test]
        fn prop_clean_text_has_no_doubled_spaces(s in ".{0,300}") {
            let cleaned = clean_text(&s);
            prop_assert!(!cleaned.contains("  "));
        }
    }
}
