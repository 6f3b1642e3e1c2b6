//! Cross-run MEMORY.md / USER.md updates.
//!
//! The subagent edits both files itself; we only own what happens around
//! that round-trip:
//!
//! 1. back up each file that exists (`.bak` or `.bak.<timestamp>`),
//! 2. snapshot content hashes,
//! 3. schedule the synthesis job and wait for it,
//! 4. verify each file exists, holds its marker pair, and actually changed.
//!
//! Any verification failure is fatal and names the offending files.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::{build_digest, DIGEST_MAX_CHARS};
use crate::models::{AggregatedInsights, BatchExtractionResult, ExtractionMode};
use crate::prompt::{
    framing_vars, render_template, PromptOptions, TemplateError, AGENT_FRAMING_TEMPLATE,
    MEMORY_SYNTHESIS_TEMPLATE,
};
use crate::scheduler::JobScheduler;
use crate::util::sha256_hex;

pub const MEMORY_FILE: &str = "MEMORY.md";
pub const USER_FILE: &str = "USER.md";
pub const MEMORY_START: &str = "<!-- reclaw-memory:start -->";
pub const MEMORY_END: &str = "<!-- reclaw-memory:end -->";
pub const USER_START: &str = "<!-- reclaw-user:start -->";
pub const USER_END: &str = "<!-- reclaw-user:end -->";

const SYNTHESIS_SESSION: &str = "reclaw-memory-synthesis";

/// How pre-update copies of MEMORY.md and USER.md are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// `<file>.bak`, overwritten every run.
    #[default]
    Single,
    /// `<file>.bak.<YYYYMMDDTHHMMSSZ>`, one per run.
    Timestamped,
}

impl std::str::FromStr for BackupMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(BackupMode::Single),
            "timestamped" => Ok(BackupMode::Timestamped),
            other => bail!(
                "Unknown backup mode: '{}'. Must be single or timestamped.",
                other
            ),
        }
    }
}

/// Copy `path` to its backup location. Missing sources are skipped.
pub fn backup_file(path: &Path, mode: BackupMode, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let suffix = match mode {
        BackupMode::Single => "bak".to_string(),
        BackupMode::Timestamped => format!("bak.{}", now.format("%Y%m%dT%H%M%SZ")),
    };
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    let backup = path.with_file_name(name);
    std::fs::copy(path, &backup).with_context(|| {
        format!(
            "Failed to back up {} to {}",
            path.display(),
            backup.display()
        )
    })?;
    Ok(Some(backup))
}

/// One managed document and its marker pair.
#[derive(Debug, Clone)]
pub struct ManagedDoc {
    pub path: PathBuf,
    pub start: &'static str,
    pub end: &'static str,
}

impl ManagedDoc {
    pub fn pair(workspace: &Path) -> [ManagedDoc; 2] {
        [
            ManagedDoc {
                path: workspace.join(MEMORY_FILE),
                start: MEMORY_START,
                end: MEMORY_END,
            },
            ManagedDoc {
                path: workspace.join(USER_FILE),
                start: USER_START,
                end: USER_END,
            },
        ]
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Content hash before the update; `None` when the file did not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub path: PathBuf,
    pub hash: Option<String>,
}

pub fn snapshot(path: &Path) -> Result<Snapshot> {
    let hash = match std::fs::read(path) {
        Ok(bytes) => Some(sha256_hex(&bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    Ok(Snapshot {
        path: path.to_path_buf(),
        hash,
    })
}

/// Check each document against its pre-update snapshot.
pub fn verify_managed_docs(docs: &[ManagedDoc], before: &[Snapshot]) -> Result<()> {
    let mut problems = Vec::new();
    for (doc, snap) in docs.iter().zip(before) {
        let text = match std::fs::read_to_string(&doc.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                problems.push(format!("{} was not created", doc.name()));
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", doc.path.display()))
            }
        };
        if !has_marker_pair(&text, doc.start, doc.end) {
            problems.push(format!(
                "{} is missing the {} ... {} marker pair",
                doc.name(),
                doc.start,
                doc.end
            ));
        }
        if snap.hash.as_deref() == Some(sha256_hex(text.as_bytes()).as_str()) {
            problems.push(format!("{} was not changed", doc.name()));
        }
    }
    if !problems.is_empty() {
        bail!(
            "memory document update failed verification: {}",
            problems.join("; ")
        );
    }
    Ok(())
}

fn has_marker_pair(text: &str, start: &str, end: &str) -> bool {
    match (text.find(start), text.rfind(end)) {
        (Some(s), Some(e)) => s + start.len() <= e,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct DocUpdateOptions<'a> {
    pub workspace: &'a Path,
    pub mode: ExtractionMode,
    pub model: Option<&'a str>,
    pub backup_mode: BackupMode,
    pub job_timeout: Duration,
    pub wait_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdateOutcome {
    pub memory_file_path: PathBuf,
    pub user_file_path: PathBuf,
    pub backup_paths: Vec<PathBuf>,
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        "- (none)".to_string()
    } else {
        items
            .iter()
            .map(|i| format!("- {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Render the synthesis prompt (framing + task).
pub fn build_synthesis_prompt(
    insights: &AggregatedInsights,
    digest: &str,
    options: &DocUpdateOptions<'_>,
) -> Result<String, TemplateError> {
    let memory_file = options.workspace.join(MEMORY_FILE);
    let framing = render_template(
        AGENT_FRAMING_TEMPLATE,
        &framing_vars(&PromptOptions {
            mode: options.mode,
            output_path: &memory_file,
            memory_workspace_path: options.workspace,
            max_prompt_chars: DIGEST_MAX_CHARS,
        }),
    )?;

    let mut vars: BTreeMap<&str, String> = BTreeMap::new();
    vars.insert("memory_file", memory_file.display().to_string());
    vars.insert("memory_start", MEMORY_START.to_string());
    vars.insert("memory_end", MEMORY_END.to_string());
    vars.insert(
        "user_file",
        options.workspace.join(USER_FILE).display().to_string(),
    );
    vars.insert("user_start", USER_START.to_string());
    vars.insert("user_end", USER_END.to_string());
    vars.insert("insights_summary", insights.summary.clone());
    vars.insert("decisions", bullet_list(&insights.decisions));
    vars.insert("projects", bullet_list(&insights.projects));
    vars.insert("facts", bullet_list(&insights.facts));
    vars.insert("people", bullet_list(&insights.people));
    vars.insert("preferences", bullet_list(&insights.preferences));
    vars.insert("interests", bullet_list(&insights.interests));
    vars.insert("digest", digest.to_string());
    let task = render_template(MEMORY_SYNTHESIS_TEMPLATE, &vars)?;

    Ok(format!("{}\n{}", framing, task))
}

/// Back up, run the synthesis job, and verify both documents.
pub async fn update_managed_docs(
    scheduler: &JobScheduler,
    insights: &AggregatedInsights,
    results: &[BatchExtractionResult],
    options: &DocUpdateOptions<'_>,
) -> Result<DocUpdateOutcome> {
    let docs = ManagedDoc::pair(options.workspace);
    let now = Utc::now();

    let mut backup_paths = Vec::new();
    for doc in &docs {
        if let Some(backup) = backup_file(&doc.path, options.backup_mode, now)? {
            backup_paths.push(backup);
        }
    }
    let before = docs
        .iter()
        .map(|doc| snapshot(&doc.path))
        .collect::<Result<Vec<_>>>()?;

    let digest = build_digest(results, DIGEST_MAX_CHARS);
    let prompt = build_synthesis_prompt(insights, &digest, options)
        .context("Failed to render memory synthesis prompt")?;

    let job = scheduler
        .schedule(
            &prompt,
            options.model,
            Some(SYNTHESIS_SESSION),
            options.job_timeout.as_secs(),
        )
        .await
        .context("Failed to schedule memory synthesis")?;
    log::info!("memory synthesis scheduled as job {} ({})", job.job_id, job.mode);

    match scheduler.await_result(&job.job_id, options.wait_timeout).await {
        Ok(reply) => log::debug!("memory synthesis replied: {}", reply.trim()),
        Err(e) => {
            scheduler.cancel(&job.job_id).await;
            return Err(e).context("Memory synthesis job failed");
        }
    }

    verify_managed_docs(&docs, &before)?;

    let [memory, user] = docs;
    Ok(DocUpdateOutcome {
        memory_file_path: memory.path,
        user_file_path: user.path,
        backup_paths,
    })
}
