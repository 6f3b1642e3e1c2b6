//! Zettelclaw journal merge (`03 Journal/<date>.md`).
//!
//! A journal note looks like:
//!
//! ```text
//! ---
//! type: journal
//! tags:
//!   - journal
//! created: 2026-02-22
//! updated: 2026-02-23
//! ---
//!
//! ## Log
//! - Ship v1
//!
//! ## Todo
//! - [ ] Tag the release
//!
//! ---
//!
//! ## Sessions
//! - chatgpt:conv-1 — 2026-02-22T10:00:00.000Z
//! ```
//!
//! Merging is incremental: only bullets whose dedup key is not present yet
//! are appended (normalized text for Log/Todo, the `provider:id` token for
//! Sessions). Prior layouts are repaired on the way through: `## Log` and
//! `## Todo` live above the divider and `## Sessions` below it, a legacy
//! `## Open` section is folded into Todo, managed sections left without
//! bullets are dropped, and blank-line runs collapse to one. `updated` moves
//! only when the body changes, and an unchanged note is never rewritten.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::aggregate::{output_path_for, rollup_by_date, DailyRollup};
use crate::daily_notes::NoteOptions;
use crate::models::{BatchExtractionResult, ExtractionMode};
use crate::signals::SignalOptions;
use crate::util::today_key;

const LOG: &str = "Log";
const TODO: &str = "Todo";
const SESSIONS: &str = "Sessions";
const LEGACY_OPEN: &str = "Open";
const DIVIDER: &str = "---";

/// Merge every date's results into its journal note. Returns the files written.
pub fn merge_journals(
    target: &Path,
    results: &[BatchExtractionResult],
    options: NoteOptions,
) -> Result<Vec<PathBuf>> {
    let signal_options = SignalOptions {
        allow_untagged_facts: options.allow_untagged_facts,
    };
    let today = today_key();
    let mut written = Vec::new();
    for day in rollup_by_date(results, signal_options) {
        let path = output_path_for(ExtractionMode::Zettelclaw, target, &day.date);
        let existing = match std::fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let Some(updated) = merge_journal_text(existing.as_deref(), &day, options, &today) else {
            continue;
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, updated)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!("wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}

/// Merge `day` into an existing note (or a new one). Returns the new file
/// contents, or `None` when nothing would change.
pub fn merge_journal_text(
    existing: Option<&str>,
    day: &DailyRollup,
    options: NoteOptions,
    today: &str,
) -> Option<String> {
    let incoming = Incoming::from_day(day, options);
    if existing.is_none() && incoming.is_empty() {
        return None;
    }

    let (frontmatter, old_body) = match existing {
        Some(text) => split_frontmatter(text),
        None => (None, ""),
    };

    let mut body = parse_body(old_body);
    body.repair();
    body.merge(&incoming);
    let new_body = body.render();
    let body_changed = new_body != old_body;

    let created = if is_date_key(&day.date) {
        day.date.as_str()
    } else {
        today
    };
    let mut fm = Frontmatter::new(frontmatter.unwrap_or_default());
    fm.ensure("type", "journal");
    fm.ensure_tags();
    fm.ensure("created", created);
    if body_changed {
        fm.set("updated", today);
    } else {
        fm.ensure("updated", today);
    }

    let rendered = format!("{}{}", fm.render(), new_body);
    match existing {
        Some(text) if text == rendered => None,
        _ => Some(rendered),
    }
}

fn is_date_key(date: &str) -> bool {
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok()
}

/// Bullets a day contributes to each managed section.
struct Incoming {
    log: Vec<String>,
    todo: Vec<String>,
    sessions: Vec<String>,
}

impl Incoming {
    fn from_day(day: &DailyRollup, options: NoteOptions) -> Self {
        let s = &day.signals;
        let log = s
            .decisions
            .iter()
            .chain(&s.projects)
            .chain(&s.facts)
            .chain(&s.interests)
            .chain(&s.preferences)
            .chain(&s.people)
            .cloned()
            .collect();
        let todo = s.todo.iter().map(|t| format!("[ ] {}", t)).collect();
        let sessions = if options.include_session_refs {
            day.refs
                .iter()
                .map(|r| match &r.timestamp {
                    Some(ts) => format!("{} — {}", r.key(), ts),
                    None => r.key(),
                })
                .collect()
        } else {
            Vec::new()
        };
        Self {
            log,
            todo,
            sessions,
        }
    }

    fn is_empty(&self) -> bool {
        self.log.is_empty() && self.todo.is_empty() && self.sessions.is_empty()
    }
}

// ---- frontmatter ----

fn split_frontmatter(text: &str) -> (Option<Vec<String>>, &str) {
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return (None, text);
    };
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == DIVIDER {
            let lines = rest[..offset].lines().map(str::to_string).collect();
            return (Some(lines), &rest[offset + line.len()..]);
        }
        offset += line.len();
    }
    (None, text)
}

struct Frontmatter {
    lines: Vec<String>,
}

impl Frontmatter {
    fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    fn position(&self, key: &str) -> Option<usize> {
        let prefix = format!("{}:", key);
        self.lines.iter().position(|l| l.starts_with(&prefix))
    }

    fn ensure(&mut self, key: &str, value: &str) {
        if self.position(key).is_none() {
            self.lines.push(format!("{}: {}", key, value));
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        let line = format!("{}: {}", key, value);
        match self.position(key) {
            Some(i) => self.lines[i] = line,
            None => self.lines.push(line),
        }
    }

    fn ensure_tags(&mut self) {
        if self.position("tags").is_none() {
            self.lines.push("tags:".to_string());
            self.lines.push("  - journal".to_string());
        }
    }

    fn render(&self) -> String {
        let mut out = String::from("---\n");
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("---\n");
        out
    }
}

// ---- body ----

#[derive(Debug, Clone)]
struct Section {
    title: String,
    lines: Vec<String>,
}

impl Section {
    fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    fn bullets(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| l.strip_prefix("- "))
    }

    fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    /// Append bullets whose dedup key is new.
    fn append_new(&mut self, bullets: &[String]) {
        let mut seen: HashSet<String> = self
            .bullets()
            .map(|b| dedup_key(&self.title, b))
            .collect();
        trim_blank_edges(&mut self.lines);
        for bullet in bullets {
            if seen.insert(dedup_key(&self.title, bullet)) {
                self.lines.push(format!("- {}", bullet));
            }
        }
    }
}

fn dedup_key(section: &str, bullet: &str) -> String {
    let text = bullet.trim();
    if section == SESSIONS {
        return text.split_whitespace().next().unwrap_or_default().to_string();
    }
    let text = ["[ ] ", "[x] ", "[X] "]
        .iter()
        .find_map(|p| text.strip_prefix(p))
        .unwrap_or(text);
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', '!', ';'])
        .to_lowercase()
}

#[derive(Debug, Default)]
struct Body {
    preamble: Vec<String>,
    before: Vec<Section>,
    after_preamble: Vec<String>,
    after: Vec<Section>,
}

fn parse_body(text: &str) -> Body {
    let mut body = Body::default();
    let mut seen_divider = false;
    let mut current: Option<Section> = None;

    let flush = |body: &mut Body, current: &mut Option<Section>, seen_divider: bool| {
        if let Some(section) = current.take() {
            if seen_divider {
                body.after.push(section);
            } else {
                body.before.push(section);
            }
        }
    };

    for line in text.lines() {
        let line = line.trim_end();
        if let Some(title) = line.strip_prefix("## ") {
            flush(&mut body, &mut current, seen_divider);
            current = Some(Section::new(title.trim()));
        } else if line == DIVIDER && !seen_divider {
            flush(&mut body, &mut current, seen_divider);
            seen_divider = true;
        } else if let Some(section) = current.as_mut() {
            section.lines.push(line.to_string());
        } else if seen_divider {
            body.after_preamble.push(line.to_string());
        } else {
            body.preamble.push(line.to_string());
        }
    }
    flush(&mut body, &mut current, seen_divider);
    body
}

impl Body {
    fn repair(&mut self) {
        // Managed sections belong on their side of the divider.
        let (misplaced_before, after): (Vec<_>, Vec<_>) = std::mem::take(&mut self.after)
            .into_iter()
            .partition(|s| [LOG, TODO, LEGACY_OPEN].contains(&s.title.as_str()));
        let (misplaced_after, before): (Vec<_>, Vec<_>) = std::mem::take(&mut self.before)
            .into_iter()
            .partition(|s| s.title == SESSIONS);
        self.before = before;
        self.before.extend(misplaced_before);
        self.after = misplaced_after;
        self.after.extend(after);

        // Fold `## Open` into Todo.
        for section in &mut self.before {
            if section.title == LEGACY_OPEN {
                section.title = TODO.to_string();
            }
        }

        coalesce(&mut self.before);
        coalesce(&mut self.after);

        if !self.before.iter().any(|s| s.title == LOG) {
            self.before.insert(0, Section::new(LOG));
        }
        if !self.before.iter().any(|s| s.title == TODO) {
            let at = self
                .before
                .iter()
                .position(|s| s.title == LOG)
                .map_or(0, |i| i + 1);
            self.before.insert(at, Section::new(TODO));
        }
        if !self.after.iter().any(|s| s.title == SESSIONS) {
            self.after.push(Section::new(SESSIONS));
        }
    }

    fn merge(&mut self, incoming: &Incoming) {
        for section in self.before.iter_mut().chain(self.after.iter_mut()) {
            match section.title.as_str() {
                LOG => section.append_new(&incoming.log),
                TODO => section.append_new(&incoming.todo),
                SESSIONS => section.append_new(&incoming.sessions),
                _ => {}
            }
        }
        let managed = |s: &Section| [LOG, TODO, SESSIONS].contains(&s.title.as_str());
        self.before.retain(|s| !(managed(s) && s.bullets().next().is_none() && s.is_blank()));
        self.after.retain(|s| !(managed(s) && s.bullets().next().is_none() && s.is_blank()));
    }

    fn render(&self) -> String {
        let mut blocks: Vec<String> = Vec::new();
        push_block(&mut blocks, None, &self.preamble);
        for section in &self.before {
            push_block(&mut blocks, Some(&section.title), &section.lines);
        }
        let mut tail: Vec<String> = Vec::new();
        push_block(&mut tail, None, &self.after_preamble);
        for section in &self.after {
            push_block(&mut tail, Some(&section.title), &section.lines);
        }
        if !tail.is_empty() {
            blocks.push(DIVIDER.to_string());
            blocks.extend(tail);
        }
        if blocks.is_empty() {
            return String::new();
        }
        format!("\n{}\n", blocks.join("\n\n"))
    }
}

/// Merge repeated sections with the same title into the first occurrence.
fn coalesce(sections: &mut Vec<Section>) {
    let mut merged: Vec<Section> = Vec::new();
    for section in sections.drain(..) {
        match merged.iter_mut().find(|s| s.title == section.title) {
            Some(first) => first.lines.extend(section.lines),
            None => merged.push(section),
        }
    }
    *sections = merged;
}

fn trim_blank_edges(lines: &mut Vec<String>) {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    let leading = lines.iter().take_while(|l| l.trim().is_empty()).count();
    lines.drain(..leading);
}

/// One rendered block: optional heading plus content with blank runs
/// collapsed. Empty untitled blocks are skipped.
fn push_block(blocks: &mut Vec<String>, title: Option<&str>, lines: &[String]) {
    let mut content: Vec<String> = Vec::new();
    for line in lines {
        let blank = line.trim().is_empty();
        if blank && content.last().map_or(true, |l: &String| l.is_empty()) {
            continue;
        }
        content.push(if blank { String::new() } else { line.clone() });
    }
    trim_blank_edges(&mut content);

    match title {
        Some(title) => {
            let mut block = format!("## {}", title);
            for line in content {
                block.push('\n');
                block.push_str(&line);
            }
            blocks.push(block);
        }
        None if content.is_empty() => {}
        None => blocks.push(content.join("\n")),
    }
}
