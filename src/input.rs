//! Loading normalized conversations from disk.
//!
//! Inputs are JSON files holding an array of conversations (or an object
//! with a `conversations` array) in the camelCase normalized shape. A
//! directory input is walked recursively for `*.json` files. Timestamps are
//! normalized on the way in so exporters that emit epochs or legacy wrapper
//! objects still bucket by date correctly.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::{NormalizedConversation, Provider};
use crate::planner::ProviderConversations;
use crate::sessions::ProviderImport;
use crate::util::normalize_timestamp;

/// Conversations read from one input file.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub path: PathBuf,
    pub conversations: Vec<NormalizedConversation>,
}

/// Expand inputs into a sorted list of JSON files.
pub fn collect_input_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry
                    .with_context(|| format!("Failed to walk {}", path.display()))?;
                let is_json = entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
                if entry.file_type().is_file() && is_json {
                    files.push(entry.into_path());
                }
            }
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            bail!("Input not found: {}", path.display());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Read and normalize every input file.
pub fn load_inputs(paths: &[PathBuf]) -> Result<Vec<InputFile>> {
    collect_input_files(paths)?
        .into_iter()
        .map(|path| {
            let conversations = load_conversation_file(&path)?;
            Ok(InputFile {
                path,
                conversations,
            })
        })
        .collect()
}

pub fn load_conversation_file(path: &Path) -> Result<Vec<NormalizedConversation>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Input file is not valid JSON: {}", path.display()))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("conversations") {
            Some(Value::Array(items)) => items,
            _ => bail!(
                "Input file {} must hold an array of conversations",
                path.display()
            ),
        },
        _ => bail!(
            "Input file {} must hold an array of conversations",
            path.display()
        ),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, mut item)| {
            normalize_conversation_value(&mut item);
            let mut conversation: NormalizedConversation = serde_json::from_value(item)
                .with_context(|| format!("{}: conversation #{} is malformed", path.display(), i + 1))?;
            if conversation.updated_at.is_empty() {
                conversation.updated_at = conversation.created_at.clone();
            }
            if conversation.message_count == 0 {
                conversation.message_count = conversation.messages.len();
            }
            Ok(conversation)
        })
        .collect()
}

fn normalize_conversation_value(item: &mut Value) {
    let Value::Object(map) = item else {
        return;
    };
    for key in ["createdAt", "updatedAt"] {
        normalize_field(map.get_mut(key));
    }
    if let Some(Value::Array(messages)) = map.get_mut("messages") {
        for message in messages {
            if let Value::Object(message) = message {
                normalize_field(message.get_mut("timestamp"));
            }
        }
    }
}

fn normalize_field(field: Option<&mut Value>) {
    let Some(field) = field else {
        return;
    };
    match normalize_timestamp(field) {
        Some(iso) => *field = Value::String(iso),
        None if field.is_string() => {}
        None => *field = Value::Null,
    }
}

/// Group conversations by provider, dropping later duplicates of the same
/// `provider:id`.
pub fn group_by_provider(files: &[InputFile]) -> ProviderConversations {
    let mut seen = HashSet::new();
    let mut grouped: ProviderConversations = BTreeMap::new();
    for file in files {
        for conversation in &file.conversations {
            if !seen.insert((conversation.source, conversation.id.clone())) {
                log::debug!(
                    "skipping duplicate conversation {}:{} in {}",
                    conversation.source,
                    conversation.id,
                    file.path.display()
                );
                continue;
            }
            grouped
                .entry(conversation.source)
                .or_default()
                .push(conversation.clone());
        }
    }
    grouped
}

/// One session import per (file, provider) among the selected providers.
pub fn provider_imports(files: &[InputFile], selected: &[Provider]) -> Vec<ProviderImport> {
    let mut imports = Vec::new();
    for file in files {
        let mut by_provider: BTreeMap<Provider, Vec<NormalizedConversation>> = BTreeMap::new();
        for conversation in &file.conversations {
            if selected.contains(&conversation.source) {
                by_provider
                    .entry(conversation.source)
                    .or_default()
                    .push(conversation.clone());
            }
        }
        for (provider, conversations) in by_provider {
            imports.push(ProviderImport {
                provider,
                source_path: file.path.clone(),
                conversations,
            });
        }
    }
    imports
}
