//! Core data models used throughout Reclaw.
//!
//! These types represent the conversations, batches, and extraction results
//! that flow through the planning, extraction, and merge pipeline. All
//! serialized forms use camelCase keys so state files and conversation inputs
//! stay compatible with exports produced by other tooling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chat platform a conversation was exported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Chatgpt,
    Claude,
    Grok,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Chatgpt, Provider::Claude, Provider::Grok];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Chatgpt => "chatgpt",
            Provider::Claude => "claude",
            Provider::Grok => "grok",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chatgpt" | "openai" => Ok(Provider::Chatgpt),
            "claude" | "anthropic" => Ok(Provider::Claude),
            "grok" | "xai" => Ok(Provider::Grok),
            other => anyhow::bail!(
                "Unknown provider: '{}'. Must be chatgpt, claude, or grok.",
                other
            ),
        }
    }
}

/// Author of a message within a normalized conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Human,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::Human => "human",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A provider-agnostic conversation produced by an export parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedConversation {
    pub id: String,
    pub source: Provider,
    #[serde(default)]
    pub title: String,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<NormalizedMessage>,
}

/// One unit of subagent work: every selected conversation for a single date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationBatch {
    pub id: String,
    pub providers: Vec<Provider>,
    pub date: String,
    pub index: usize,
    pub total_for_date: usize,
    pub conversations: Vec<NormalizedConversation>,
}

impl ConversationBatch {
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

/// Pointer back to a source conversation, rendered in session footers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub provider: Provider,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ConversationRef {
    /// `provider:id`, the dedup key used by session footers.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.id)
    }
}

/// Structured subagent output after parsing and cleaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentExtraction {
    pub summary: String,
}

/// Persisted outcome of one successfully processed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchExtractionResult {
    pub batch_id: String,
    pub providers: Vec<Provider>,
    pub date: String,
    pub conversation_ids: Vec<String>,
    #[serde(default)]
    pub conversation_refs: Vec<ConversationRef>,
    pub conversation_count: usize,
    pub extraction: SubagentExtraction,
}

/// Output layout for extracted memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// Dated notes under `memory/` in an OpenClaw workspace.
    Openclaw,
    /// Journal entries under `03 Journal/` in a Zettelclaw vault.
    Zettelclaw,
}

impl ExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMode::Openclaw => "openclaw",
            ExtractionMode::Zettelclaw => "zettelclaw",
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openclaw" => Ok(ExtractionMode::Openclaw),
            "zettelclaw" => Ok(ExtractionMode::Zettelclaw),
            other => anyhow::bail!(
                "Unknown mode: '{}'. Must be openclaw or zettelclaw.",
                other
            ),
        }
    }
}

/// Cross-batch insight rollup fed into the MEMORY/USER synthesis prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedInsights {
    pub summary: String,
    pub interests: Vec<String>,
    pub projects: Vec<String>,
    pub facts: Vec<String>,
    pub preferences: Vec<String>,
    pub people: Vec<String>,
    pub decisions: Vec<String>,
}
