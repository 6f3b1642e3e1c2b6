//! Schema decoding shared by state loading, subagent responses, and
//! scheduler status output.
//!
//! Every untrusted JSON document is decoded through [`decode`] into a typed
//! shape, so callers get one [`ValidationError`] instead of field-by-field
//! narrowing.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{what}: not valid JSON: {source}")]
    Syntax {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{what}: unexpected shape: {source}")]
    Shape {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{what}: no JSON object found")]
    NoObject { what: &'static str },
    #[error("{what}: unsupported version {found} (expected {expected})")]
    Version {
        what: &'static str,
        found: u64,
        expected: u64,
    },
    #[error("{what}: field '{field}' {problem}")]
    Field {
        what: &'static str,
        field: &'static str,
        problem: &'static str,
    },
}

/// Decode an already-parsed JSON value into `T`.
pub fn decode<T: DeserializeOwned>(what: &'static str, value: Value) -> Result<T, ValidationError> {
    serde_json::from_value(value).map_err(|source| ValidationError::Shape { what, source })
}

/// Parse text as JSON, then decode into `T`.
pub fn decode_str<T: DeserializeOwned>(what: &'static str, text: &str) -> Result<T, ValidationError> {
    let value: Value =
        serde_json::from_str(text).map_err(|source| ValidationError::Syntax { what, source })?;
    decode(what, value)
}

/// Parse `text` as a JSON object, falling back to the first balanced
/// `{...}` span embedded in surrounding noise (log lines, prose).
pub fn parse_object_lenient(what: &'static str, text: &str) -> Result<Value, ValidationError> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    find_object_span(trimmed)
        .and_then(|span| serde_json::from_str::<Value>(span).ok())
        .filter(Value::is_object)
        .ok_or(ValidationError::NoObject { what })
}

/// First balanced `{...}` span, aware of JSON string literals.
fn find_object_span(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..=i];
                        if serde_json::from_str::<Value>(candidate).is_ok() {
                            return Some(candidate);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Job {
        id: String,
    }

    #[test]
    fn lenient_parse_skips_log_noise() {
        let text = "[info] scheduling\n{\"id\": \"job-1\", \"note\": \"a } brace\"}\ntrailing";
        let value = parse_object_lenient("job", text).unwrap();
        let job: Job = decode("job", value).unwrap();
        assert_eq!(job.id, "job-1");
    }

    #[test]
    fn lenient_parse_rejects_text_without_object() {
        let err = parse_object_lenient("job", "nothing here { broken").unwrap_err();
        assert!(matches!(err, ValidationError::NoObject { .. }));
    }

    #[test]
    fn shape_errors_name_the_document() {
        let err = decode_str::<Job>("job status", r#"{"id": 5}"#).unwrap_err();
        assert!(err.to_string().starts_with("job status: unexpected shape"));
    }
}
