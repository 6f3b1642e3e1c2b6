//! Extraction progress reporting.
//!
//! Reports observable progress during `reclaw extract` so users see how many
//! day-batches are pending, how many have settled, and when the merge starts.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.
//!
//! | Mode | Output |
//! |------|--------|
//! | `human` | `extract  3 / 12 batches  41 / 160 conversations  1 failed  4 active` |
//! | `json` | one `{"event":"progress",...}` object per line |
//! | `off` | nothing |

use anyhow::Result;
use std::io::Write;
use std::sync::Arc;

/// A single progress event for an extraction run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtractionEvent {
    /// Planning finished; `pending` batches will be scheduled.
    Planned {
        total_batches: u64,
        pending_batches: u64,
        skipped_batches: u64,
        conversations: u64,
    },
    /// One pending batch settled (success or failure).
    BatchSettled {
        batch_id: String,
        succeeded: bool,
        settled_batches: u64,
        pending_batches: u64,
        settled_conversations: u64,
        pending_conversations: u64,
        failed: u64,
        active_workers: u64,
    },
    /// Workers joined; documents are being merged for `dates` days.
    Merging { mode: String, dates: u64 },
}

/// Reports extraction progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called concurrently from pipeline workers.
    fn report(&self, event: ExtractionEvent);
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ExtractionEvent) {
        let line = match &event {
            ExtractionEvent::Planned {
                total_batches,
                pending_batches,
                skipped_batches,
                conversations,
            } => format!(
                "extract  planned {} batches ({} pending, {} already done)  {} conversations\n",
                format_number(*total_batches),
                format_number(*pending_batches),
                format_number(*skipped_batches),
                format_number(*conversations)
            ),
            ExtractionEvent::BatchSettled {
                settled_batches,
                pending_batches,
                settled_conversations,
                pending_conversations,
                failed,
                active_workers,
                ..
            } => {
                let mut line = format!(
                    "extract  {} / {} batches  {} / {} conversations",
                    format_number(*settled_batches),
                    format_number(*pending_batches),
                    format_number(*settled_conversations),
                    format_number(*pending_conversations)
                );
                if *failed > 0 {
                    line.push_str(&format!("  {} failed", format_number(*failed)));
                }
                line.push_str(&format!("  {} active\n", active_workers));
                line
            }
            ExtractionEvent::Merging { mode, dates } => {
                format!("extract  merging {} {} notes\n", format_number(*dates), mode)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ExtractionEvent) {
        let obj = match &event {
            ExtractionEvent::Planned {
                total_batches,
                pending_batches,
                skipped_batches,
                conversations,
            } => serde_json::json!({
                "event": "progress",
                "phase": "planned",
                "total_batches": total_batches,
                "pending_batches": pending_batches,
                "skipped_batches": skipped_batches,
                "conversations": conversations
            }),
            ExtractionEvent::BatchSettled {
                batch_id,
                succeeded,
                settled_batches,
                pending_batches,
                settled_conversations,
                pending_conversations,
                failed,
                active_workers,
            } => serde_json::json!({
                "event": "progress",
                "phase": "extracting",
                "batch_id": batch_id,
                "ok": succeeded,
                "n": settled_batches,
                "total": pending_batches,
                "conversations": settled_conversations,
                "total_conversations": pending_conversations,
                "failed": failed,
                "active_workers": active_workers
            }),
            ExtractionEvent::Merging { mode, dates } => serde_json::json!({
                "event": "progress",
                "phase": "merging",
                "mode": mode,
                "dates": dates
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ExtractionEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse a `--progress` value; `auto` defers to [`Self::default_for_tty`].
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(Self::default_for_tty()),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            "off" => Ok(ProgressMode::Off),
            other => anyhow::bail!(
                "Unknown progress mode: '{}'. Must be auto, human, json, or off.",
                other
            ),
        }
    }

    /// Build a reporter for this mode, shareable across pipeline workers.
    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
