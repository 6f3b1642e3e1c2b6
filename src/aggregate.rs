//! Cross-batch aggregation.
//!
//! Re-runs the signal extractor over every batch summary and rolls the
//! results up per date (for dated notes and journals) and across the whole
//! run (for the MEMORY/USER synthesis prompt).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::models::{AggregatedInsights, BatchExtractionResult, ConversationRef, ExtractionMode};
use crate::signals::{extract_signals, SignalOptions, Signals};
use crate::util::{dedupe_case_insensitive, truncate_chars};

/// Budget for the per-batch digest embedded in the synthesis prompt.
pub const DIGEST_MAX_CHARS: usize = 48_000;

/// Subdirectory holding zettelclaw journal notes.
pub const JOURNAL_DIR: &str = "03 Journal";
/// Subdirectory holding openclaw dated notes.
pub const MEMORY_DIR: &str = "memory";

/// Where the dated document for `date` lives under `target`.
pub fn output_path_for(mode: ExtractionMode, target: &Path, date: &str) -> PathBuf {
    let dir = match mode {
        ExtractionMode::Openclaw => MEMORY_DIR,
        ExtractionMode::Zettelclaw => JOURNAL_DIR,
    };
    target.join(dir).join(format!("{}.md", date))
}

/// Everything extracted for one calendar date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyRollup {
    pub date: String,
    pub signals: Signals,
    pub refs: Vec<ConversationRef>,
}

/// Group results by date (ascending) and merge their signals and refs.
pub fn rollup_by_date(
    results: &[BatchExtractionResult],
    options: SignalOptions,
) -> Vec<DailyRollup> {
    let mut by_date: BTreeMap<&str, Vec<&BatchExtractionResult>> = BTreeMap::new();
    for result in results {
        by_date.entry(result.date.as_str()).or_default().push(result);
    }

    by_date
        .into_iter()
        .map(|(date, day)| {
            let per_batch: Vec<Signals> = day
                .iter()
                .map(|r| extract_signals(&r.extraction.summary, options))
                .collect();
            DailyRollup {
                date: date.to_string(),
                signals: merge_signals(&per_batch),
                refs: collect_refs(&day),
            }
        })
        .collect()
}

fn merge_signals(all: &[Signals]) -> Signals {
    Signals {
        interests: dedupe_case_insensitive(all.iter().flat_map(|s| &s.interests)),
        projects: dedupe_case_insensitive(all.iter().flat_map(|s| &s.projects)),
        facts: dedupe_case_insensitive(all.iter().flat_map(|s| &s.facts)),
        preferences: dedupe_case_insensitive(all.iter().flat_map(|s| &s.preferences)),
        people: dedupe_case_insensitive(all.iter().flat_map(|s| &s.people)),
        decisions: dedupe_case_insensitive(all.iter().flat_map(|s| &s.decisions)),
        todo: dedupe_case_insensitive(all.iter().flat_map(|s| &s.todo)),
    }
}

/// Conversation refs for a set of results, first occurrence of each
/// `provider:id` wins. Results persisted before refs were recorded fall back
/// to their bare conversation ids.
fn collect_refs(results: &[&BatchExtractionResult]) -> Vec<ConversationRef> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    for result in results {
        let fallback;
        let candidates: &[ConversationRef] = if result.conversation_refs.is_empty() {
            fallback = legacy_refs(result);
            &fallback
        } else {
            &result.conversation_refs
        };
        for r in candidates {
            if seen.insert(r.key()) {
                refs.push(r.clone());
            }
        }
    }
    refs
}

fn legacy_refs(result: &BatchExtractionResult) -> Vec<ConversationRef> {
    match result.providers.as_slice() {
        [provider] => result
            .conversation_ids
            .iter()
            .map(|id| ConversationRef {
                provider: *provider,
                id: id.clone(),
                timestamp: None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Run-wide insight rollup for the synthesis prompt.
pub fn aggregate_insights(
    results: &[BatchExtractionResult],
    allow_untagged_facts: bool,
) -> AggregatedInsights {
    let options = SignalOptions {
        allow_untagged_facts,
    };
    let per_batch: Vec<Signals> = results
        .iter()
        .map(|r| extract_signals(&r.extraction.summary, options))
        .collect();
    let merged = merge_signals(&per_batch);

    let conversations: usize = results.iter().map(|r| r.conversation_count).sum();
    let dates: Vec<&str> = {
        let mut dates: Vec<&str> = results.iter().map(|r| r.date.as_str()).collect();
        dates.sort_unstable();
        dates.dedup();
        dates
    };
    let span = match (dates.first(), dates.last()) {
        (Some(first), Some(last)) if first != last => format!(" from {} to {}", first, last),
        (Some(only), _) => format!(" on {}", only),
        _ => String::new(),
    };
    let summary = format!(
        "Imported {} conversation{} across {} day{}{}: {} decisions, {} projects, {} facts, {} preferences, {} people, {} interests, {} open items.",
        conversations,
        if conversations == 1 { "" } else { "s" },
        dates.len(),
        if dates.len() == 1 { "" } else { "s" },
        span,
        merged.decisions.len(),
        merged.projects.len(),
        merged.facts.len(),
        merged.preferences.len(),
        merged.people.len(),
        merged.interests.len(),
        merged.todo.len(),
    );

    AggregatedInsights {
        summary,
        interests: merged.interests,
        projects: merged.projects,
        facts: merged.facts,
        preferences: merged.preferences,
        people: merged.people,
        decisions: merged.decisions,
    }
}

/// Per-batch summaries in date order, clipped to `max_chars`.
pub fn build_digest(results: &[BatchExtractionResult], max_chars: usize) -> String {
    let mut ordered: Vec<&BatchExtractionResult> = results
        .iter()
        .filter(|r| !r.extraction.summary.trim().is_empty())
        .collect();
    ordered.sort_by(|a, b| (&a.date, &a.batch_id).cmp(&(&b.date, &b.batch_id)));

    let mut digest = String::new();
    let mut used = 0usize;
    for (i, result) in ordered.iter().enumerate() {
        let section = format!(
            "### {} ({} conversation{})\n{}\n\n",
            result.date,
            result.conversation_count,
            if result.conversation_count == 1 { "" } else { "s" },
            result.extraction.summary.trim()
        );
        let len = section.chars().count();
        if used + len > max_chars {
            let remaining = ordered.len() - i;
            if used == 0 {
                digest.push_str(&truncate_chars(&section, max_chars));
                digest.push('\n');
                if remaining > 1 {
                    digest.push_str(&format!("[{} more days omitted]\n", remaining - 1));
                }
            } else {
                digest.push_str(&format!("[{} more days omitted]\n", remaining));
            }
            break;
        }
        used += len;
        digest.push_str(&section);
    }
    if digest.is_empty() {
        digest.push_str("(no summaries)\n");
    }
    digest
}
