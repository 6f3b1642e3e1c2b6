//! Day-batch planning.
//!
//! Every selected conversation is bucketed by the date prefix of its
//! `createdAt` timestamp, and each date becomes exactly one batch containing
//! all providers. Batch ids hash the date plus the ordered membership, so an
//! unchanged day keeps its id across runs and any membership change forces
//! that day (and only that day) to be re-extracted.

use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ConversationBatch, NormalizedConversation, Provider};

/// Bucket used when a conversation has no usable creation date.
pub const UNKNOWN_DATE: &str = "unknown-date";

/// Conversations keyed by the provider that exported them.
pub type ProviderConversations = BTreeMap<Provider, Vec<NormalizedConversation>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub batches: Vec<ConversationBatch>,
    pub conversation_count: usize,
}

/// Group selected conversations into one batch per date, dates ascending.
pub fn plan(provider_conversations: &ProviderConversations, selected: &[Provider]) -> BatchPlan {
    let selected: BTreeSet<Provider> = selected.iter().copied().collect();
    let mut by_date: BTreeMap<String, Vec<NormalizedConversation>> = BTreeMap::new();
    let mut conversation_count = 0usize;

    for (provider, conversations) in provider_conversations {
        if !selected.contains(provider) {
            continue;
        }
        for conversation in conversations {
            by_date
                .entry(date_key(&conversation.created_at))
                .or_default()
                .push(conversation.clone());
            conversation_count += 1;
        }
    }

    let batches = by_date
        .into_iter()
        .map(|(date, mut conversations)| {
            conversations.sort_by(|a, b| {
                (&a.created_at, &a.updated_at, a.source, &a.id)
                    .cmp(&(&b.created_at, &b.updated_at, b.source, &b.id))
            });
            let providers: Vec<Provider> = conversations
                .iter()
                .map(|c| c.source)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            ConversationBatch {
                id: batch_id(&date, &conversations),
                providers,
                date,
                index: 1,
                total_for_date: 1,
                conversations,
            }
        })
        .collect();

    BatchPlan {
        batches,
        conversation_count,
    }
}

/// First ten characters of the stored timestamp (the UTC calendar day for
/// normalized ISO strings).
fn date_key(created_at: &str) -> String {
    let trimmed = created_at.trim();
    match trimmed.get(..10) {
        Some(prefix) if looks_like_date(prefix) => prefix.to_string(),
        _ => UNKNOWN_DATE.to_string(),
    }
}

fn looks_like_date(prefix: &str) -> bool {
    let bytes = prefix.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit())
}

/// `date-<date>-<sha1(date, source+id...)[0..12]>`.
pub fn batch_id(date: &str, conversations: &[NormalizedConversation]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(date.as_bytes());
    for conversation in conversations {
        hasher.update(conversation.source.as_str().as_bytes());
        hasher.update(conversation.id.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("date-{}-{}", date, &digest[..12])
}
