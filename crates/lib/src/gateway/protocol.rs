//! Gateway wire types: WebSocket frames (connect, turn, health, status) and the HTTP query API.

use serde::{Deserialize, Serialize};

use crate::orchestrator::{ReplyPart, SynthesizedReply};

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Wire response: `{ "type": "res", "id", "ok", "payload" or "error" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Client connect params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: Option<u32>,
    pub max_protocol: Option<u32>,
    #[serde(default)]
    pub client: ConnectClient,
    #[serde(default)]
    pub auth: ConnectAuth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: Option<String>,
}

/// Server hello-ok payload after successful connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub typ: String,
    pub protocol: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<HelloPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    pub tick_interval_ms: Option<u64>,
    /// Per-turn deadline the orchestrator applies.
    pub turn_timeout_ms: Option<u64>,
}

/// Params for WS method "turn" and body of `POST /api/query`: one customer message, optionally
/// continuing a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnParams {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub text: String,
}

/// Reply to a turn: `{ conversationId, reply, contextToken, turn, parts }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReply {
    pub conversation_id: String,
    pub reply: String,
    pub context_token: String,
    pub turn: usize,
    pub parts: Vec<TurnPart>,
}

/// One labelled part of a reply, as sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnPart {
    pub segment: usize,
    pub category: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

impl From<&ReplyPart> for TurnPart {
    fn from(p: &ReplyPart) -> Self {
        let tag = |v: serde_json::Value| v.as_str().unwrap_or_default().to_string();
        Self {
            segment: p.segment_index,
            category: tag(serde_json::to_value(p.category).unwrap_or_default()),
            status: tag(serde_json::to_value(p.status).unwrap_or_default()),
            label: p.label.clone(),
            text: p.text.clone(),
            capability: p.capability.clone(),
        }
    }
}

impl From<SynthesizedReply> for TurnReply {
    fn from(r: SynthesizedReply) -> Self {
        Self {
            parts: r.parts.iter().map(TurnPart::from).collect(),
            conversation_id: r.conversation_id,
            reply: r.text,
            context_token: r.context_token,
            turn: r.turn_index,
        }
    }
}

impl WsResponse {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}
