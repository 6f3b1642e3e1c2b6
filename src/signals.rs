//! Tagged signal extraction from free-text subagent summaries.
//!
//! Summaries arrive as loosely formatted lines such as
//! `Decision: Ship v1; Fact: Uses tests`. Each line (and each `;` sub-clause)
//! is stripped of list markers, matched against the tag alias table, and
//! bucketed. The same table drives response cleaning in [`crate::response`].

use once_cell::sync::Lazy;
use regex::Regex;

use crate::util::dedupe_case_insensitive;

static LIST_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*+•]|\d+[.)])\s+").expect("static regex"));

static COLON_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\*\*|__)?\[?([A-Za-z][A-Za-z _/-]{0,23}?)\]?(?:\*\*|__)?\s*:\s*(?:\*\*|__)?\s*(.*)$")
        .expect("static regex")
});

static BRACKET_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[([A-Za-z][A-Za-z _/-]{0,23})\]\s*(.*)$").expect("static regex")
});

/// Durable-memory categories, in output priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignalTag {
    Decision,
    Project,
    Fact,
    Preference,
    Person,
    Interest,
    Todo,
}

impl SignalTag {
    pub fn label(&self) -> &'static str {
        match self {
            SignalTag::Decision => "Decision",
            SignalTag::Project => "Project",
            SignalTag::Fact => "Fact",
            SignalTag::Preference => "Preference",
            SignalTag::Person => "Person",
            SignalTag::Interest => "Interest",
            SignalTag::Todo => "Todo",
        }
    }
}

/// Resolve a tag name (case-insensitive, `-`/`_` tolerant) to its category.
pub fn resolve_tag(name: &str) -> Option<SignalTag> {
    let normalized = name
        .trim()
        .to_ascii_lowercase()
        .replace(['_', '-'], " ");
    let tag = match normalized.as_str() {
        "decision" | "decisions" | "decided" | "choice" => SignalTag::Decision,
        "project" | "projects" | "initiative" | "working on" => SignalTag::Project,
        "fact" | "facts" | "note" | "notes" | "context" | "info" => SignalTag::Fact,
        "preference" | "preferences" | "prefers" | "likes" | "dislikes" | "style" => {
            SignalTag::Preference
        }
        "person" | "people" | "contact" | "contacts" | "relationship" => SignalTag::Person,
        "interest" | "interests" | "topic" | "topics" | "hobby" | "hobbies" => {
            SignalTag::Interest
        }
        "todo" | "todos" | "to do" | "open" | "open item" | "open items" | "action"
        | "action item" | "action items" | "next step" | "next steps" | "follow up"
        | "followup" | "task" | "tasks" => SignalTag::Todo,
        _ => return None,
    };
    Some(tag)
}

/// A candidate line after tag resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedLine {
    pub tag: Option<SignalTag>,
    pub value: String,
}

/// Split summary text into candidate lines: newline first, then `;`
/// sub-clauses, with list and numeric prefixes removed.
pub fn split_candidates(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| LIST_PREFIX.replace(line, "").to_string())
        .flat_map(|line| {
            line.split(';')
                .map(|part| part.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|part| !part.is_empty())
        .collect()
}

/// Classify a single candidate line against the alias table.
pub fn classify_line(line: &str) -> ClassifiedLine {
    let trimmed = LIST_PREFIX.replace(line.trim(), "").trim().to_string();
    for pattern in [&*COLON_TAG, &*BRACKET_TAG] {
        if let Some(caps) = pattern.captures(&trimmed) {
            if let Some(tag) = resolve_tag(&caps[1]) {
                return ClassifiedLine {
                    tag: Some(tag),
                    value: caps[2].trim().to_string(),
                };
            }
        }
    }
    ClassifiedLine {
        tag: None,
        value: trimmed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalOptions {
    /// Bucket lines without a recognized tag as facts instead of dropping them.
    pub allow_untagged_facts: bool,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            allow_untagged_facts: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub interests: Vec<String>,
    pub projects: Vec<String>,
    pub facts: Vec<String>,
    pub preferences: Vec<String>,
    pub people: Vec<String>,
    pub decisions: Vec<String>,
    pub todo: Vec<String>,
}

impl Signals {
    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
            && self.projects.is_empty()
            && self.facts.is_empty()
            && self.preferences.is_empty()
            && self.people.is_empty()
            && self.decisions.is_empty()
            && self.todo.is_empty()
    }

    fn bucket(&mut self, tag: SignalTag) -> &mut Vec<String> {
        match tag {
            SignalTag::Decision => &mut self.decisions,
            SignalTag::Project => &mut self.projects,
            SignalTag::Fact => &mut self.facts,
            SignalTag::Preference => &mut self.preferences,
            SignalTag::Person => &mut self.people,
            SignalTag::Interest => &mut self.interests,
            SignalTag::Todo => &mut self.todo,
        }
    }

    fn dedupe(&mut self) {
        for list in [
            &mut self.interests,
            &mut self.projects,
            &mut self.facts,
            &mut self.preferences,
            &mut self.people,
            &mut self.decisions,
            &mut self.todo,
        ] {
            *list = dedupe_case_insensitive(list.iter());
        }
    }
}

/// Extract tagged signals from a summary blob.
pub fn extract_signals(summary: &str, options: SignalOptions) -> Signals {
    let mut signals = Signals::default();
    for candidate in split_candidates(summary) {
        let line = classify_line(&candidate);
        if line.value.is_empty() {
            continue;
        }
        match line.tag {
            Some(tag) => signals.bucket(tag).push(line.value),
            None if options.allow_untagged_facts => signals.facts.push(line.value),
            None => {}
        }
    }
    signals.dedupe();
    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_semicolon_separated_tags() {
        let signals = extract_signals(
            "decision: Ship v1; fact: Uses tests; interest: Reliability",
            SignalOptions::default(),
        );
        assert_eq!(signals.decisions, vec!["Ship v1"]);
        assert_eq!(signals.facts, vec!["Uses tests"]);
        assert_eq!(signals.interests, vec!["Reliability"]);
        assert!(signals.todo.is_empty());
    }

    #[test]
    fn strips_list_prefixes_and_bold_tags() {
        let text = "- **Decision:** Adopt Rust\n2. **Todo**: Write docs\n* [person] Alice (designer)";
        let signals = extract_signals(text, SignalOptions::default());
        assert_eq!(signals.decisions, vec!["Adopt Rust"]);
        assert_eq!(signals.todo, vec!["Write docs"]);
        assert_eq!(signals.people, vec!["Alice (designer)"]);
    }

    #[test]
    fn untagged_policy_toggle() {
        let text = "Prefers dark roast coffee\nProject: Garden planner";
        let kept = extract_signals(text, SignalOptions::default());
        assert_eq!(kept.facts, vec!["Prefers dark roast coffee"]);

        let dropped = extract_signals(
            text,
            SignalOptions {
                allow_untagged_facts: false,
            },
        );
        assert!(dropped.facts.is_empty());
        assert_eq!(dropped.projects, vec!["Garden planner"]);
    }

    #[test]
    fn dedupes_case_insensitively() {
        let signals = extract_signals(
            "Interest: Rust\ninterest: rust\nTopic: RUST; hobby: Chess",
            SignalOptions::default(),
        );
        assert_eq!(signals.interests, vec!["Rust", "Chess"]);
    }

    #[test]
    fn resolves_aliases() {
        assert_eq!(resolve_tag("Next-Steps"), Some(SignalTag::Todo));
        assert_eq!(resolve_tag("follow_up"), Some(SignalTag::Todo));
        assert_eq!(resolve_tag("likes"), Some(SignalTag::Preference));
        assert_eq!(resolve_tag("summary"), None);
    }

    #[test]
    fn unknown_colon_prefix_stays_untagged() {
        let line = classify_line("Note to self: buy milk");
        assert_eq!(line.tag, None);
        assert_eq!(line.value, "Note to self: buy milk");
    }
}
