//! Resumable run state.
//!
//! The state file records every batch that finished successfully under a
//! given run key. A file that is missing, unreadable as JSON, fails schema
//! validation, or carries a different run key is replaced by a fresh empty
//! state at the same path; resuming never fails on bad state.
//!
//! Saves go through [`StateWriter`], a single task that owns the file. Workers
//! hand it full snapshots over a channel; it writes them one at a time with a
//! temp-file-and-rename, so concurrent completions never interleave on disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::{BatchExtractionResult, ConversationBatch, ExtractionMode, Provider};
use crate::util::format_iso;
use crate::validate::{decode, decode_str, ValidationError};

pub const STATE_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclawState {
    pub version: u64,
    pub run_key: String,
    pub mode: ExtractionMode,
    pub model: String,
    pub target_path: String,
    pub memory_workspace_path: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed: BTreeMap<String, BatchExtractionResult>,
}

impl ReclawState {
    pub fn new(
        run_key: impl Into<String>,
        mode: ExtractionMode,
        model: Option<&str>,
        target_path: &Path,
        memory_workspace_path: &Path,
    ) -> Self {
        let now = format_iso(chrono::Utc::now());
        Self {
            version: STATE_VERSION,
            run_key: run_key.into(),
            mode,
            model: model.unwrap_or_default().to_string(),
            target_path: target_path.display().to_string(),
            memory_workspace_path: memory_workspace_path.display().to_string(),
            created_at: now.clone(),
            updated_at: now,
            completed: BTreeMap::new(),
        }
    }

    /// Record a finished batch and bump `updatedAt`.
    pub fn record(&mut self, result: BatchExtractionResult) {
        self.completed.insert(result.batch_id.clone(), result);
        self.updated_at = format_iso(chrono::Utc::now());
    }

    pub fn is_completed(&self, batch_id: &str) -> bool {
        self.completed.contains_key(batch_id)
    }
}

/// Fingerprint of everything that decides which batches a run produces.
pub fn compute_run_key(
    mode: ExtractionMode,
    model: Option<&str>,
    target_path: &Path,
    selected: &[Provider],
    batches: &[ConversationBatch],
) -> String {
    let mut providers: Vec<Provider> = selected.to_vec();
    providers.sort();
    providers.dedup();

    let mut hasher = Sha256::new();
    for field in [
        mode.as_str().to_string(),
        model.unwrap_or_default().to_string(),
        target_path.display().to_string(),
        providers
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(","),
    ] {
        hasher.update(field.as_bytes());
        hasher.update(b"\n");
    }
    for batch in batches {
        hasher.update(batch.id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Decode and validate a state document.
pub fn decode_state(text: &str) -> Result<ReclawState, ValidationError> {
    const WHAT: &str = "state file";
    let value: Value = decode_str(WHAT, text)?;
    let version = value
        .get("version")
        .and_then(Value::as_u64)
        .ok_or(ValidationError::Field {
            what: WHAT,
            field: "version",
            problem: "is missing or not a number",
        })?;
    if version != STATE_VERSION {
        return Err(ValidationError::Version {
            what: WHAT,
            found: version,
            expected: STATE_VERSION,
        });
    }

    let state: ReclawState = decode(WHAT, value)?;
    if state.run_key.trim().is_empty() {
        return Err(ValidationError::Field {
            what: WHAT,
            field: "runKey",
            problem: "is empty",
        });
    }
    if state
        .completed
        .iter()
        .any(|(key, result)| key != &result.batch_id)
    {
        return Err(ValidationError::Field {
            what: WHAT,
            field: "completed",
            problem: "has an entry keyed differently from its batchId",
        });
    }
    Ok(state)
}

/// Load state from `path`, falling back to `fresh` when the file is absent,
/// invalid, or belongs to a different run.
pub fn load_state(path: &Path, fresh: ReclawState) -> Result<ReclawState> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(fresh),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read state file: {}", path.display()))
        }
    };

    match decode_state(&text) {
        Ok(state) if state.run_key == fresh.run_key => {
            log::info!(
                "resuming run {} with {} completed batches",
                short_key(&state.run_key),
                state.completed.len()
            );
            Ok(state)
        }
        Ok(state) => {
            log::warn!(
                "state at {} belongs to run {}, starting run {} fresh",
                path.display(),
                short_key(&state.run_key),
                short_key(&fresh.run_key)
            );
            Ok(fresh)
        }
        Err(e) => {
            log::warn!("discarding state at {}: {}", path.display(), e);
            Ok(fresh)
        }
    }
}

fn short_key(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

/// Write `state` to `path` via a sibling temp file and rename.
pub async fn write_state_atomic(path: &Path, state: &ReclawState) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, format!("{}\n", json))
        .await
        .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace state file: {}", path.display()))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Cloneable handle workers use to submit snapshots.
#[derive(Debug, Clone)]
pub struct StateSaver {
    tx: mpsc::UnboundedSender<ReclawState>,
}

impl StateSaver {
    pub fn save(&self, snapshot: ReclawState) {
        if self.tx.send(snapshot).is_err() {
            log::warn!("state writer already closed; snapshot dropped");
        }
    }
}

/// Single task that owns the state file.
pub struct StateWriter {
    saver: StateSaver,
    task: JoinHandle<Option<anyhow::Error>>,
}

impl StateWriter {
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ReclawState>();
        let task = tokio::spawn(async move {
            let mut last_error = None;
            while let Some(mut snapshot) = rx.recv().await {
                // Snapshots only grow; skip straight to the newest queued one.
                while let Ok(newer) = rx.try_recv() {
                    snapshot = newer;
                }
                match write_state_atomic(&path, &snapshot).await {
                    Ok(()) => {
                        log::debug!(
                            "saved state with {} completed batches",
                            snapshot.completed.len()
                        );
                        last_error = None;
                    }
                    Err(e) => {
                        log::warn!("state save failed: {:#}", e);
                        last_error = Some(e);
                    }
                }
            }
            last_error
        });
        Self {
            saver: StateSaver { tx },
            task,
        }
    }

    pub fn saver(&self) -> StateSaver {
        self.saver.clone()
    }

    pub fn save(&self, snapshot: ReclawState) {
        self.saver.save(snapshot);
    }

    /// Drain pending saves and report the outcome of the final write.
    ///
    /// Every [`StateSaver`] clone must be dropped first or this waits forever.
    pub async fn close(self) -> Result<()> {
        let StateWriter { saver, task } = self;
        drop(saver);
        match task.await.context("state writer task panicked")? {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
