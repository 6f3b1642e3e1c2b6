//! Prompt rendering for batch extraction.
//!
//! A prompt is the agent framing template followed by the task template,
//! with `{{variable}}` placeholders substituted. Conversations are serialized
//! into a character budget; long conversations are sampled from both ends so
//! the subagent sees how a discussion started and how it was resolved.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::models::{ConversationBatch, ExtractionMode, NormalizedConversation};
use crate::util::truncate_chars;

pub const AGENT_FRAMING_TEMPLATE: &str = include_str!("templates/agent_framing.md");
pub const BATCH_EXTRACTION_TEMPLATE: &str = include_str!("templates/batch_extraction.md");
pub const MEMORY_SYNTHESIS_TEMPLATE: &str = include_str!("templates/memory_synthesis.md");

pub const DEFAULT_MAX_PROMPT_CHARS: usize = 110_000;
/// Messages sampled per conversation (first half + last half).
pub const MAX_SAMPLED_MESSAGES: usize = 28;
const MAX_MESSAGE_CHARS: usize = 1_200;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([a-z_][a-z0-9_]*)\s*\}\}").expect("static regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template variable '{0}' has no value")]
    MissingVariable(String),
}

/// Substitute every `{{name}}` in `template`. A placeholder without a value
/// is an error; nothing is emitted half-rendered.
pub fn render_template(
    template: &str,
    vars: &BTreeMap<&str, String>,
) -> Result<String, TemplateError> {
    if let Some(missing) = PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .find(|name| !vars.contains_key(name.as_str()))
    {
        return Err(TemplateError::MissingVariable(missing));
    }
    Ok(PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}

#[derive(Debug, Clone)]
pub struct PromptOptions<'a> {
    pub mode: ExtractionMode,
    pub output_path: &'a Path,
    pub memory_workspace_path: &'a Path,
    pub max_prompt_chars: usize,
}

/// Render the extraction prompt for one batch.
pub fn build_prompt(
    batch: &ConversationBatch,
    options: &PromptOptions<'_>,
) -> Result<String, TemplateError> {
    let framing = render_template(AGENT_FRAMING_TEMPLATE, &framing_vars(options))?;

    let providers = batch
        .providers
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut vars = BTreeMap::new();
    vars.insert("date", batch.date.clone());
    vars.insert("batch_id", batch.id.clone());
    vars.insert("providers", providers);
    vars.insert("conversation_count", batch.conversation_count().to_string());
    vars.insert("output_path", options.output_path.display().to_string());
    vars.insert("mode_guidance", mode_guidance(options.mode).to_string());
    vars.insert(
        "conversations",
        render_conversations(&batch.conversations, options.max_prompt_chars),
    );
    let task = render_template(BATCH_EXTRACTION_TEMPLATE, &vars)?;

    Ok(format!("{}\n{}", framing, task))
}

pub(crate) fn framing_vars(options: &PromptOptions<'_>) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert(
        "memory_workspace_path",
        options.memory_workspace_path.display().to_string(),
    );
    vars.insert("mode", options.mode.to_string());
    vars
}

fn mode_guidance(mode: ExtractionMode) -> &'static str {
    match mode {
        ExtractionMode::Openclaw => {
            "The lines become a dated note in an OpenClaw memory folder. Favor \
             decisions, facts about the user's life and work, and open items."
        }
        ExtractionMode::Zettelclaw => {
            "The lines become log and todo bullets in a Zettelclaw daily journal. \
             Favor what happened, what was decided, and what is still open."
        }
    }
}

/// Serialize conversations within `max_chars`. Once the next conversation
/// would overflow the budget, the remainder collapse into one notice.
fn render_conversations(conversations: &[NormalizedConversation], max_chars: usize) -> String {
    let mut out = String::new();
    let mut used = 0usize;

    for (i, conversation) in conversations.iter().enumerate() {
        let block = render_conversation(i + 1, conversation);
        let block_chars = block.chars().count();
        if used + block_chars > max_chars {
            if i == 0 {
                out.push_str(&truncate_chars(&block, max_chars));
                out.push('\n');
                if conversations.len() > 1 {
                    out.push_str(&truncation_notice(conversations.len() - 1));
                }
            } else {
                out.push_str(&truncation_notice(conversations.len() - i));
            }
            return out;
        }
        used += block_chars;
        out.push_str(&block);
    }
    out
}

fn truncation_notice(remaining: usize) -> String {
    format!(
        "[{} more conversation{} omitted to stay within the prompt budget]\n",
        remaining,
        if remaining == 1 { "" } else { "s" }
    )
}

fn render_conversation(position: usize, conversation: &NormalizedConversation) -> String {
    let title = if conversation.title.trim().is_empty() {
        "(untitled)"
    } else {
        conversation.title.trim()
    };
    let mut block = format!(
        "### Conversation {}: {}\n- id: {}:{}\n- created: {}\n- messages: {}\n\n",
        position,
        title,
        conversation.source,
        conversation.id,
        conversation.created_at,
        conversation.message_count.max(conversation.messages.len())
    );

    let total = conversation.messages.len();
    let head = MAX_SAMPLED_MESSAGES / 2;
    for (i, message) in conversation.messages.iter().enumerate() {
        if total > MAX_SAMPLED_MESSAGES && i >= head && i < total - head {
            if i == head {
                block.push_str(&format!(
                    "[... {} messages omitted ...]\n",
                    total - MAX_SAMPLED_MESSAGES
                ));
            }
            continue;
        }
        let content = message.content.trim();
        if content.is_empty() {
            continue;
        }
        block.push_str(&format!(
            "[{}] {}\n",
            message.role.as_str(),
            truncate_chars(content, MAX_MESSAGE_CHARS)
        ));
    }
    block.push('\n');
    block
}
