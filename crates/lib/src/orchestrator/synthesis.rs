//! Reply synthesis: ordered, labelled parts joined into one reply, and the context token.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use super::ConversationContext;
use crate::agents::{AgentResponse, ResponseStatus};
use crate::router::{Category, IntentSegment};

pub const CLOSING_PROMPT: &str = "Is there anything else I can help you with?";

const EXCERPT_CHARS: usize = 60;

/// One answered segment as it appears in the reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPart {
    pub segment_index: usize,
    pub category: Category,
    pub status: ResponseStatus,
    /// Category label plus span excerpt; None for a single-part reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedReply {
    pub conversation_id: String,
    pub turn_index: usize,
    pub parts: Vec<ReplyPart>,
    pub text: String,
    pub context_token: String,
}

/// First characters of a span, cut on a word boundary.
pub fn excerpt(span: &str) -> String {
    let span = span.trim();
    if span.chars().count() <= EXCERPT_CHARS {
        return span.to_string();
    }
    let cut: String = span.chars().take(EXCERPT_CHARS).collect();
    let cut = match cut.rfind(' ') {
        Some(i) if i > EXCERPT_CHARS / 2 => &cut[..i],
        _ => cut.as_str(),
    };
    format!("{}...", cut.trim_end_matches([',', ';', ' ']))
}

/// Build reply parts in segment order. `answered` pairs each segment with its response.
pub fn parts(answered: &[(IntentSegment, AgentResponse)]) -> Vec<ReplyPart> {
    let labelled = answered.len() > 1;
    answered
        .iter()
        .map(|(segment, response)| {
            let mut text = response.body.trim().to_string();
            if let Some(f) = &response.follow_up {
                text.push('\n');
                text.push_str(f.trim());
            }
            ReplyPart {
                segment_index: segment.index,
                category: response.category,
                status: response.status,
                label: labelled
                    .then(|| format!("{} (\"{}\")", response.category.label(), excerpt(&segment.span))),
                text,
                capability: response.capability.clone(),
            }
        })
        .collect()
}

/// Join parts into the reply text, appending the closing prompt unless every part is a
/// clarification request.
pub fn render(parts: &[ReplyPart]) -> String {
    let mut out = String::new();
    for part in parts {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        match &part.label {
            Some(label) => {
                let _ = write!(out, "{}:\n{}", label, part.text);
            }
            None => out.push_str(&part.text),
        }
    }
    let all_clarifications = parts
        .iter()
        .all(|p| p.status == ResponseStatus::Clarification);
    if !all_clarifications {
        out.push_str("\n\n");
        out.push_str(CLOSING_PROMPT);
    }
    out
}

/// Hex SHA-256 over conversation id, turn count and the entity map.
pub fn context_token(context: &ConversationContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.conversation_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(context.turns.to_string().as_bytes());
    for (kind, value) in &context.entities {
        hasher.update(b"\n");
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}
