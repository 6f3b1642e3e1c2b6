//! Dated import notes for OpenClaw workspaces (`memory/<date>.md`).
//!
//! Imported content lives in one managed block per note:
//!
//! ```text
//! <!-- reclaw-import:start -->
//! ## Imported from chat history
//!
//! ### Decisions
//! - Ship v1
//!
//! ### Sessions
//! - chatgpt:conv-1 (2026-02-22T10:00:00.000Z)
//! <!-- reclaw-import:end -->
//! ```
//!
//! Text outside the block is never touched. Bullets already inside the
//! block are kept and new ones are unioned in, so re-importing the same day
//! is a no-op and the file is not rewritten.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::aggregate::{output_path_for, rollup_by_date, DailyRollup};
use crate::models::{BatchExtractionResult, ExtractionMode};
use crate::signals::SignalOptions;

pub const IMPORT_START: &str = "<!-- reclaw-import:start -->";
pub const IMPORT_END: &str = "<!-- reclaw-import:end -->";
const BLOCK_HEADING: &str = "## Imported from chat history";

const DECISIONS: &str = "Decisions";
const FACTS: &str = "Facts";
const INTERESTS: &str = "Interests";
const OPEN_ITEMS: &str = "Open Items";
const SESSIONS: &str = "Sessions";
const SECTION_ORDER: [&str; 5] = [DECISIONS, FACTS, INTERESTS, OPEN_ITEMS, SESSIONS];

#[derive(Debug, Clone, Copy)]
pub struct NoteOptions {
    pub include_session_refs: bool,
    pub allow_untagged_facts: bool,
}

/// Merge every date's results into its note. Returns the files written.
pub fn write_daily_notes(
    target: &Path,
    results: &[BatchExtractionResult],
    options: NoteOptions,
) -> Result<Vec<PathBuf>> {
    let signal_options = SignalOptions {
        allow_untagged_facts: options.allow_untagged_facts,
    };
    let mut written = Vec::new();
    for day in rollup_by_date(results, signal_options) {
        let path = output_path_for(ExtractionMode::Openclaw, target, &day.date);
        if merge_note(&path, &day, options)? {
            written.push(path);
        }
    }
    Ok(written)
}

/// Merge one day into `path`. Returns whether the file was written.
pub fn merge_note(path: &Path, day: &DailyRollup, options: NoteOptions) -> Result<bool> {
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let incoming = day_sections(day, options);
    let updated = match &existing {
        None => {
            if incoming.iter().all(|(_, bullets)| bullets.is_empty()) {
                return Ok(false);
            }
            format!("# {}\n\n{}\n", day.date, render_block(&incoming))
        }
        Some(text) => match find_block(text)
            .with_context(|| format!("Malformed import block in {}", path.display()))?
        {
            Some((start, end)) => {
                let merged = union_sections(parse_block(&text[start..end]), incoming);
                format!("{}{}{}", &text[..start], render_block(&merged), &text[end..])
            }
            None => {
                if incoming.iter().all(|(_, bullets)| bullets.is_empty()) {
                    return Ok(false);
                }
                let separator = match text.as_str() {
                    "" => "",
                    t if t.ends_with("\n\n") => "",
                    t if t.ends_with('\n') => "\n",
                    _ => "\n\n",
                };
                format!("{}{}{}\n", text, separator, render_block(&incoming))
            }
        },
    };

    if existing.as_deref() == Some(updated.as_str()) {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, updated).with_context(|| format!("Failed to write {}", path.display()))?;
    log::debug!("wrote {}", path.display());
    Ok(true)
}

type Sections = Vec<(String, Vec<String>)>;

fn day_sections(day: &DailyRollup, options: NoteOptions) -> Sections {
    let s = &day.signals;
    let mut facts: Vec<String> = s.facts.clone();
    facts.extend(s.projects.iter().map(|v| format!("Project: {}", v)));
    facts.extend(s.preferences.iter().map(|v| format!("Preference: {}", v)));
    facts.extend(s.people.iter().map(|v| format!("Person: {}", v)));

    let sessions = if options.include_session_refs {
        day.refs
            .iter()
            .map(|r| match &r.timestamp {
                Some(ts) => format!("{} ({})", r.key(), ts),
                None => r.key(),
            })
            .collect()
    } else {
        Vec::new()
    };

    vec![
        (DECISIONS.to_string(), s.decisions.clone()),
        (FACTS.to_string(), facts),
        (INTERESTS.to_string(), s.interests.clone()),
        (OPEN_ITEMS.to_string(), s.todo.clone()),
        (SESSIONS.to_string(), sessions),
    ]
}

/// Byte range of the managed block, markers included.
fn find_block(text: &str) -> Result<Option<(usize, usize)>> {
    let Some(start) = text.find(IMPORT_START) else {
        if text.contains(IMPORT_END) {
            bail!("end marker without start marker");
        }
        return Ok(None);
    };
    let Some(end_offset) = text[start..].find(IMPORT_END) else {
        bail!("start marker without end marker");
    };
    let end = start + end_offset + IMPORT_END.len();
    if text[end..].contains(IMPORT_START) {
        bail!("more than one import block");
    }
    Ok(Some((start, end)))
}

fn parse_block(block: &str) -> Sections {
    let mut sections: Sections = Vec::new();
    for line in block.lines() {
        let line = line.trim_end();
        if let Some(title) = line.strip_prefix("### ") {
            sections.push((title.trim().to_string(), Vec::new()));
        } else if let Some(bullet) = line.strip_prefix("- ") {
            if let Some((_, bullets)) = sections.last_mut() {
                bullets.push(bullet.trim().to_string());
            }
        }
    }
    sections
}

fn dedup_key(section: &str, bullet: &str) -> String {
    if section == SESSIONS {
        bullet.split_whitespace().next().unwrap_or_default().to_string()
    } else {
        bullet.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
    }
}

/// Existing bullets first, then new ones not already present. Sections keep
/// the canonical order; unknown sections from the existing block follow.
fn union_sections(existing: Sections, incoming: Sections) -> Sections {
    let mut merged: Sections = Vec::new();
    let titles: Vec<String> = SECTION_ORDER
        .iter()
        .map(|t| t.to_string())
        .chain(
            existing
                .iter()
                .map(|(t, _)| t.clone())
                .filter(|t| !SECTION_ORDER.contains(&t.as_str())),
        )
        .collect();

    for title in titles {
        let mut seen = HashSet::new();
        let mut bullets = Vec::new();
        let old = existing.iter().filter(|(t, _)| *t == title).flat_map(|(_, b)| b);
        let new = incoming.iter().filter(|(t, _)| *t == title).flat_map(|(_, b)| b);
        for bullet in old.chain(new) {
            if seen.insert(dedup_key(&title, bullet)) {
                bullets.push(bullet.clone());
            }
        }
        if merged.iter().all(|(t, _)| *t != title) {
            merged.push((title, bullets));
        }
    }
    merged
}

fn render_block(sections: &Sections) -> String {
    let mut out = format!("{}\n{}\n", IMPORT_START, BLOCK_HEADING);
    for (title, bullets) in sections {
        if bullets.is_empty() {
            continue;
        }
        out.push_str(&format!("\n### {}\n", title));
        for bullet in bullets {
            out.push_str(&format!("- {}\n", bullet));
        }
    }
    out.push_str(IMPORT_END);
    out
}
