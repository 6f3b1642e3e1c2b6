//! Subagent response parsing and summary cleaning.
//!
//! Parsing never fails: a reply that cannot be understood yields an empty
//! summary, and the batch still counts as processed. The cleaning rules below
//! are a policy tuned against observed model output (meta-commentary, file
//! paths, disclaimers, half-written lines); they are kept together here so
//! they can be replaced without touching the pipeline.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use crate::models::SubagentExtraction;
use crate::signals::{classify_line, split_candidates, SignalTag};
use crate::validate::{decode, parse_object_lenient};

pub const MAX_SUMMARY_LINES: usize = 8;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*```[A-Za-z0-9_-]*\s*$").expect("static regex"));

static BLOCKED: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // meta-commentary about the extraction itself
        r"(?i)\b(saved|written|wrote|appended|stored|recorded|logged)\s+(it\s+|this\s+|them\s+|these\s+)?(to|in|into)\b",
        r"(?i)^(here (is|are)|below (is|are)|the following|i (have|will|am)|i've|i'll|let me)\b",
        r"(?i)\b(this|the) (summary|extraction|batch|conversation log)\b.*\b(contains|includes|covers)\b",
        // filesystem paths
        r"(?:^|[\s(`])(?:~|\.{1,2})?/[\w.-]+/[\w./-]*",
        r"[A-Za-z]:\\",
        r"(?i)\b[\w-]+\.(md|json|jsonl|txt)\b",
        // disclaimers and empty-result chatter
        r"(?i)general knowledge",
        r"(?i)\bas an ai\b",
        r"(?i)\bno (new |durable |notable )?(information|signals?|memories|facts|insights)\b",
        r"(?i)\bnothing (durable|notable|new|significant)\b",
        r"(?i)\bnot (enough|sufficient) (information|context)\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static regex"))
    .collect()
});

static DANGLING_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s(and|or|but|the|a|an|to|of|with|for|because|that|which|than)$")
        .expect("static regex")
});

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    summary: Value,
}

/// Parse raw subagent output into a cleaned extraction.
pub fn parse_response(raw: &str) -> SubagentExtraction {
    let text = strip_code_fences(raw);
    let summary = match parse_object_lenient("subagent response", &text)
        .and_then(|value| decode::<RawExtraction>("subagent response", value))
    {
        Ok(parsed) => summary_text(parsed.summary),
        Err(e) => {
            log::warn!("discarding unparseable subagent reply: {}", e);
            String::new()
        }
    };
    SubagentExtraction {
        summary: clean_summary(&summary),
    }
}

fn strip_code_fences(raw: &str) -> String {
    CODE_FENCE.replace_all(raw, "").trim().to_string()
}

fn summary_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Normalize summary text to at most [`MAX_SUMMARY_LINES`] `Tag: value`
/// lines, highest-priority tags first.
pub fn clean_summary(summary: &str) -> String {
    let mut seen = HashSet::new();
    let mut lines: Vec<(SignalTag, String)> = Vec::new();

    for candidate in split_candidates(summary) {
        let classified = classify_line(&candidate);
        let value = classified.value.trim().to_string();
        if value.is_empty() || is_blocked(&value) {
            continue;
        }
        if !seen.insert(value.to_lowercase()) {
            continue;
        }
        lines.push((classified.tag.unwrap_or(SignalTag::Fact), value));
    }

    // stable: original order within a tag
    lines.sort_by_key(|(tag, _)| *tag);
    lines
        .into_iter()
        .take(MAX_SUMMARY_LINES)
        .map(|(tag, value)| format!("{}: {}", tag.label(), value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// True when a candidate value should never reach memory.
pub fn is_blocked(value: &str) -> bool {
    BLOCKED.iter().any(|pattern| pattern.is_match(value))
        || has_unbalanced_markup(value)
        || looks_truncated(value)
}

fn has_unbalanced_markup(value: &str) -> bool {
    let count = |c: char| value.chars().filter(|&x| x == c).count();
    count('(') != count(')')
        || count('[') != count(']')
        || count('{') != count('}')
        || value.matches("**").count() % 2 == 1
        || count('`') % 2 == 1
}

fn looks_truncated(value: &str) -> bool {
    let trimmed = value.trim_end();
    trimmed.ends_with("...")
        || trimmed.ends_with('…')
        || trimmed.ends_with(['-', ',', ':', '/', '('])
        || DANGLING_WORD.is_match(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let extraction = parse_response(r#"{"summary":"decision: Ship v1"}"#);
        assert_eq!(extraction.summary, "Decision: Ship v1");
    }

    #[test]
    fn strips_fences_and_surrounding_prose() {
        let raw = "Here you go:\n```json\n{\"summary\": \"fact: Lives in Oslo\\ntodo: Renew passport\"}\n```";
        let extraction = parse_response(raw);
        assert_eq!(extraction.summary, "Fact: Lives in Oslo\nTodo: Renew passport");
    }

    #[test]
    fn unparseable_reply_yields_empty_summary() {
        assert_eq!(parse_response("I could not finish the task").summary, "");
        assert_eq!(parse_response("").summary, "");
    }

    #[test]
    fn tagged_text_outside_json_is_discarded() {
        let raw = "Note: I was unable to complete the extraction because the tool timed out";
        assert_eq!(parse_response(raw).summary, "");
        assert_eq!(parse_response("Decision: Move to Postgres\nInterest: Databases").summary, "");
    }

    #[test]
    fn short_and_complete_claims_survive() {
        for line in [
            "Project: Building a Figma plug-in",
            "Interest: Go",
            "Preference: Keeps notifications on",
            "Fact: Lives in Berlin",
            "Fact: Works at home",
        ] {
            assert_eq!(clean_summary(line), line);
        }
        assert_eq!(clean_summary("Fact: Moving to Rust because"), "");
        assert_eq!(clean_summary("Fact: Prefers tea and"), "");
    }

    #[test]
    fn sorts_by_priority_and_defaults_untagged_to_fact() {
        let cleaned = clean_summary("todo: Call Bob\nUses a standing desk\ndecision: Adopt Rust");
        assert_eq!(
            cleaned,
            "Decision: Adopt Rust\nFact: Uses a standing desk\nTodo: Call Bob"
        );
    }

    #[test]
    fn filters_blocked_lines() {
        let cleaned = clean_summary(
            "Fact: Saved to memory/2026-02-22.md\n\
             Fact: Config lives in /Users/me/.config/app\n\
             Fact: Based on general knowledge, Rust is fast\n\
             Fact: Enjoys (long walks\n\
             Fact: Working on the migration of the\n\
             Fact: Was debugging the parser and...\n\
             Fact: Keeps a **bold note\n\
             Fact: Runs a small bakery",
        );
        assert_eq!(cleaned, "Fact: Runs a small bakery");
    }

    #[test]
    fn dedupes_and_caps_lines() {
        let text = (0..12)
            .map(|i| format!("fact: Item {}", i))
            .chain(std::iter::once("fact: item 0".to_string()))
            .collect::<Vec<_>>()
            .join("\n");
        let cleaned = clean_summary(&text);
        assert_eq!(cleaned.lines().count(), MAX_SUMMARY_LINES);
        assert!(cleaned.starts_with("Fact: Item 0\nFact: Item 1"));
    }

    #[test]
    fn summary_array_is_joined() {
        let extraction = parse_response(r#"{"summary": ["decision: A plan", "fact: B fact"]}"#);
        assert_eq!(extraction.summary, "Decision: A plan\nFact: B fact");
    }
}
