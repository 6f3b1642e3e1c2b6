//! Session-history import into the agent's own transcript store.
//!
//! Each imported conversation becomes one session:
//!
//! | Artifact | Location |
//! |----------|----------|
//! | store index | `<state_dir>/agents/<agentId>/sessions/sessions.json` |
//! | transcript | `<state_dir>/agents/<agentId>/sessions/<sessionId>.jsonl` |
//!
//! The session id is a UUIDv5 over the agent, provider, export path, and
//! conversation id, so re-importing the same export lands on the same
//! session. A checksum over every message field decides whether the
//! transcript must be regenerated; unchanged conversations are skipped.
//! Store entries that reclaw did not create are preserved untouched.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{MessageRole, NormalizedConversation, Provider};
use crate::process::ProcessRunner;
use crate::util::{format_iso, parse_timestamp_str};
use crate::validate::{decode, parse_object_lenient};

const STORE_FILE: &str = "sessions.json";
const TRANSCRIPT_VERSION: u64 = 1;

/// Conversations from one provider export.
#[derive(Debug, Clone)]
pub struct ProviderImport {
    pub provider: Provider,
    pub source_path: PathBuf,
    pub conversations: Vec<NormalizedConversation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionImportResult {
    pub agent_id: String,
    pub session_store_path: PathBuf,
    pub attempted: usize,
    pub imported: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AgentsList {
    Bare(Vec<AgentInfo>),
    Wrapped { agents: Vec<AgentInfo> },
}

/// Provenance reclaw records on every entry it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReclawMarker {
    checksum: String,
    provider: Provider,
    conversation_id: String,
    source_path: String,
}

pub struct SessionImporter {
    runner: Arc<dyn ProcessRunner>,
    command: String,
    state_dir: PathBuf,
}

impl SessionImporter {
    pub fn new(runner: Arc<dyn ProcessRunner>, command: impl Into<String>, state_dir: PathBuf) -> Self {
        Self {
            runner,
            command: command.into(),
            state_dir,
        }
    }

    /// Find the agent whose workspace is exactly `workspace`.
    pub async fn resolve_agent(&self, workspace: &Path) -> Result<AgentInfo> {
        let args: Vec<String> = ["agents", "list", "--json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self
            .runner
            .run(&self.command, &args)
            .await
            .context("Failed to list agents")?;
        if !output.success() {
            bail!("Failed to list agents: {}", output.failure_detail());
        }
        let agents = parse_agents(&output.stdout)?;
        agents
            .into_iter()
            .find(|agent| {
                agent
                    .workspace
                    .as_deref()
                    .is_some_and(|w| same_dir(w, workspace))
            })
            .with_context(|| {
                format!(
                    "No agent is configured with workspace {}",
                    workspace.display()
                )
            })
    }

    pub fn session_dir(&self, agent_id: &str) -> PathBuf {
        self.state_dir.join("agents").join(agent_id).join("sessions")
    }

    /// Import every conversation into the agent owning `workspace`.
    pub async fn import(
        &self,
        workspace: &Path,
        imports: &[ProviderImport],
    ) -> Result<SessionImportResult> {
        let agent = self.resolve_agent(workspace).await?;
        let dir = self.session_dir(&agent.id);
        let store_path = dir.join(STORE_FILE);
        let mut store = load_store(&store_path)?;

        let mut result = SessionImportResult {
            agent_id: agent.id.clone(),
            session_store_path: store_path.clone(),
            ..SessionImportResult::default()
        };

        for import in imports {
            for conversation in &import.conversations {
                result.attempted += 1;
                match import_one(&agent.id, &dir, workspace, import, conversation, &mut store) {
                    Ok(Outcome::Imported) => result.imported += 1,
                    Ok(Outcome::Updated) => result.updated += 1,
                    Ok(Outcome::Skipped) => result.skipped += 1,
                    Err(e) => {
                        result.failed += 1;
                        result.errors.push(format!(
                            "{}:{}: {:#}",
                            import.provider, conversation.id, e
                        ));
                    }
                }
            }
        }

        if result.imported + result.updated > 0 {
            save_store(&store_path, &store)?;
        }
        Ok(result)
    }
}

fn parse_agents(stdout: &str) -> Result<Vec<AgentInfo>> {
    let trimmed = stdout.trim();
    let value: Value = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("agents list: not valid JSON")?
    } else {
        parse_object_lenient("agents list", trimmed)?
    };
    let list: AgentsList = decode("agents list", value)?;
    Ok(match list {
        AgentsList::Bare(agents) | AgentsList::Wrapped { agents } => agents,
    })
}

fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Store key for a conversation.
pub fn store_key(provider: Provider, conversation_id: &str) -> String {
    format!("reclaw:{}:{}", provider, conversation_id)
}

/// Deterministic session id for a conversation under an agent.
pub fn session_id(agent_id: &str, provider: Provider, source_path: &Path, conversation_id: &str) -> Uuid {
    let mut hasher = Sha256::new();
    for part in [
        agent_id,
        provider.as_str(),
        &source_path.display().to_string(),
        conversation_id,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, digest.as_bytes())
}

/// Hash over every message field, in order.
pub fn conversation_checksum(conversation: &NormalizedConversation) -> String {
    let mut hasher = Sha256::new();
    for message in &conversation.messages {
        for field in [
            message.role.as_str(),
            message.content.as_str(),
            message.timestamp.as_deref().unwrap_or_default(),
            message.model.as_deref().unwrap_or_default(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0xffu8]);
    }
    hex::encode(hasher.finalize())
}

enum Outcome {
    Imported,
    Updated,
    Skipped,
}

fn import_one(
    agent_id: &str,
    dir: &Path,
    workspace: &Path,
    import: &ProviderImport,
    conversation: &NormalizedConversation,
    store: &mut Map<String, Value>,
) -> Result<Outcome> {
    let key = store_key(import.provider, &conversation.id);
    let id = session_id(agent_id, import.provider, &import.source_path, &conversation.id);
    let checksum = conversation_checksum(conversation);
    let transcript_path = dir.join(format!("{}.jsonl", id));

    let previous = store.get(&key);
    let previous_checksum = previous
        .and_then(|entry| entry.get("reclaw"))
        .and_then(|marker| serde_json::from_value::<ReclawMarker>(marker.clone()).ok())
        .map(|marker| marker.checksum);
    if previous_checksum.as_deref() == Some(checksum.as_str()) && transcript_path.exists() {
        return Ok(Outcome::Skipped);
    }
    let outcome = if previous.is_some() {
        Outcome::Updated
    } else {
        Outcome::Imported
    };

    let transcript = render_transcript(&id, workspace, conversation)?;
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    std::fs::write(&transcript_path, transcript)
        .with_context(|| format!("Failed to write {}", transcript_path.display()))?;

    let marker = ReclawMarker {
        checksum,
        provider: import.provider,
        conversation_id: conversation.id.clone(),
        source_path: import.source_path.display().to_string(),
    };
    let entry = json!({
        "sessionId": id.to_string(),
        "updatedAt": conversation_millis(conversation),
        "sessionFile": transcript_path.display().to_string(),
        "label": session_label(import.provider, conversation),
        "reclaw": serde_json::to_value(&marker).context("Failed to encode session marker")?,
    });
    store.insert(key, entry);
    Ok(outcome)
}

fn session_label(provider: Provider, conversation: &NormalizedConversation) -> String {
    let title = conversation.title.trim();
    if title.is_empty() {
        format!("{} conversation {}", provider, conversation.id)
    } else {
        format!("{} ({})", title, provider)
    }
}

fn conversation_millis(conversation: &NormalizedConversation) -> i64 {
    [&conversation.updated_at, &conversation.created_at]
        .into_iter()
        .find_map(|ts| parse_timestamp_str(ts))
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

fn transcript_role(role: MessageRole) -> &'static str {
    match role {
        MessageRole::Human => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

/// One JSON object per line: a session header, then every message.
pub fn render_transcript(
    session_id: &Uuid,
    workspace: &Path,
    conversation: &NormalizedConversation,
) -> Result<String> {
    let started = parse_timestamp_str(&conversation.created_at)
        .map(format_iso)
        .unwrap_or_else(|| conversation.created_at.clone());
    let mut lines = vec![json!({
        "type": "session",
        "version": TRANSCRIPT_VERSION,
        "id": session_id.to_string(),
        "timestamp": started,
        "cwd": workspace.display().to_string(),
    })];

    for (i, message) in conversation.messages.iter().enumerate() {
        let mut body = json!({
            "role": transcript_role(message.role),
            "content": [{"type": "text", "text": message.content}],
        });
        if let Some(model) = &message.model {
            body["model"] = json!(model);
        }
        lines.push(json!({
            "type": "message",
            "id": format!("{}-{}", session_id, i + 1),
            "timestamp": message.timestamp.clone().unwrap_or_else(|| started.clone()),
            "message": body,
        }));
    }

    let mut out = String::new();
    for line in lines {
        out.push_str(&serde_json::to_string(&line).context("Failed to encode transcript line")?);
        out.push('\n');
    }
    Ok(out)
}

fn load_store(path: &Path) -> Result<Map<String, Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(&text)
        .with_context(|| format!("Session store {} is not valid JSON", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => bail!("Session store {} is not a JSON object", path.display()),
    }
}

fn save_store(path: &Path, store: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(store).context("Failed to encode session store")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, format!("{}\n", json))
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
