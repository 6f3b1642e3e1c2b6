//! Timestamp normalization, date keys, and small collection helpers.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Epoch values above this are treated as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1.0e12;

/// Normalize a timestamp value into an RFC 3339 UTC string with millisecond
/// precision (`2026-02-22T10:00:00.000Z`).
///
/// Accepts RFC 3339 / ISO 8601 strings (with or without zone), bare dates,
/// Unix epochs in seconds or milliseconds (number or numeric string), and the
/// legacy wrapper objects some exporters emit: `{"$date": ...}`,
/// `{"$numberLong": "..."}`, and `{"date": ...}`, nested arbitrarily.
pub fn normalize_timestamp(value: &Value) -> Option<String> {
    parse_timestamp_value(value).map(format_iso)
}

fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::Object(map) => ["$date", "$numberLong", "date"]
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(parse_timestamp_value),
        _ => None,
    }
}

/// Parse a timestamp string in any of the supported textual forms.
pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    s.parse::<f64>().ok().and_then(from_epoch)
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value >= EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    Utc.timestamp_millis_opt(millis as i64).single()
}

pub fn format_iso(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// `YYYY-MM-DD` for the given instant in the machine's local time zone.
pub fn local_date_key(dt: DateTime<Utc>) -> String {
    dt.with_timezone(&Local).format("%Y-%m-%d").to_string()
}

/// Local date key for today.
pub fn today_key() -> String {
    local_date_key(Utc::now())
}

/// Deduplicate case-insensitively, keeping the casing of the first
/// occurrence. Entries are trimmed and empty ones dropped.
pub fn dedupe_case_insensitive<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let trimmed = item.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Truncate to at most `max_chars` characters, appending `…` when clipped.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_rfc3339_and_naive() {
        assert_eq!(
            normalize_timestamp(&json!("2026-02-22T10:00:00+02:00")).unwrap(),
            "2026-02-22T08:00:00.000Z"
        );
        assert_eq!(
            normalize_timestamp(&json!("2026-02-22 10:00:00")).unwrap(),
            "2026-02-22T10:00:00.000Z"
        );
    }

    #[test]
    fn normalizes_epoch_seconds_and_millis() {
        let secs = normalize_timestamp(&json!(1_771_754_400)).unwrap();
        let millis = normalize_timestamp(&json!(1_771_754_400_000i64)).unwrap();
        assert_eq!(secs, millis);
        assert!(secs.starts_with("2026-02-22"));
    }

    #[test]
    fn normalizes_nested_legacy_wrappers() {
        let wrapped = json!({"$date": {"$numberLong": "1771754400000"}});
        assert_eq!(
            normalize_timestamp(&wrapped),
            normalize_timestamp(&json!(1_771_754_400))
        );
        assert_eq!(normalize_timestamp(&json!({"other": 1})), None);
        assert_eq!(normalize_timestamp(&json!("not a date")), None);
    }

    #[test]
    fn dedupe_keeps_first_casing() {
        let out = dedupe_case_insensitive(["Rust", "rust", " Go ", "", "RUST", "go"]);
        assert_eq!(out, vec!["Rust", "Go"]);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo wörld", 5), "héll…");
    }
}
