//! Orchestrator: route an inquiry, dispatch its segments to agents, synthesize one reply and
//! commit the turn to the conversation context.
//!
//! Segments without dependencies run concurrently as spawned tasks; dependent segments run in
//! later waves and see the identifiers accepted by the segments they depend on. Routing and every
//! wave share one per-turn deadline. The context is written once, after the last wave.

mod context;
mod synthesis;

pub use context::{
    ConversationContext, ConversationId, ConversationStore, EntityKind, TurnRecord, TurnUpdate,
};
pub use synthesis::{context_token, ReplyPart, SynthesizedReply, CLOSING_PROMPT};

use anyhow::{Context as _, Result};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::adapters::{AccountId, Adapters, OrderId, TicketId};
use crate::agents::{AgentResponse, AgentSet};
use crate::config::{self, Config, InferenceBackend, SearchMode};
use crate::knowledge::{self, EmbeddingIndex, KnowledgeBase, KnowledgeStore, LexicalIndex};
use crate::llm::{Inference, OllamaClient};
use crate::router::{IntentSegment, Router};

/// One customer message within a conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inquiry {
    pub conversation_id: ConversationId,
    pub text: String,
    /// Turn position when the inquiry was received; the committed index is assigned by the store.
    pub turn_index: usize,
}

pub struct Orchestrator {
    router: Router,
    agents: AgentSet,
    store: Arc<ConversationStore>,
    turn_timeout: Duration,
}

impl Orchestrator {
    pub fn new(router: Router, agents: AgentSet, store: Arc<ConversationStore>, turn_timeout: Duration) -> Self {
        Self {
            router,
            agents,
            store,
            turn_timeout,
        }
    }

    /// Build the full pipeline from config: knowledge, inference, adapters, agents and router.
    pub async fn from_config(config: &Config, config_path: &Path) -> Result<Self> {
        let knowledge_root = config::resolve_knowledge_dir(config, config_path);
        let extra = config::resolve_knowledge_extra_dirs(config, config_path);
        let root = knowledge_root.exists().then_some(knowledge_root.as_path());
        if root.is_none() {
            log::warn!(
                "knowledge directory {} not found; using bundled corpus",
                knowledge_root.display()
            );
        }
        let kb = Arc::new(knowledge::load_knowledge(root, &extra).context("loading knowledge corpus")?);
        log::info!(
            "knowledge loaded: {} products, {} error codes, {} guide passages",
            kb.catalog.products.len(),
            kb.error_codes.len(),
            kb.guides.len()
        );

        let inference: Option<Arc<dyn Inference>> = match config.inference.backend {
            InferenceBackend::None => None,
            InferenceBackend::Ollama => {
                let mut client = OllamaClient::new(
                    config::resolve_inference_base_url(config),
                    config.inference.model.clone(),
                );
                if let Some(model) = &config.inference.embedding_model {
                    client = client.with_embedding_model(model.clone());
                }
                log::info!("inference: ollama model {}", client.model());
                let client: Arc<dyn Inference> = Arc::new(client);
                Some(client)
            }
        };

        let store = knowledge_store(config, &kb, inference.clone()).await;
        let adapters = Adapters::from_config(config, config_path, kb.clone()).context("building adapters")?;
        let composer = inference.clone().filter(|_| config.inference.compose_answers);
        let agents = AgentSet::new(kb.clone(), store, &adapters, composer, &config.agents);
        let router = Router::from_config(&config.router, &kb.catalog, inference);
        let conversations = Arc::new(ConversationStore::new(
            Duration::from_secs(config.orchestrator.session_timeout_secs),
            config.orchestrator.max_history,
        ));
        Ok(Self::new(
            router,
            agents,
            conversations,
            Duration::from_millis(config.orchestrator.turn_timeout_ms),
        ))
    }

    /// Orchestrator over the bundled corpus and stub adapters with default settings.
    pub fn bundled() -> Result<Self> {
        let kb = Arc::new(KnowledgeBase::bundled()?);
        let adapters = Adapters::bundled_stubs(kb.clone())?;
        Ok(Self::with_adapters(kb, &adapters, &Config::default()))
    }

    /// Lexical search, given adapters and config, no inference.
    pub fn with_adapters(kb: Arc<KnowledgeBase>, adapters: &Adapters, config: &Config) -> Self {
        let store: Arc<dyn KnowledgeStore> = Arc::new(LexicalIndex::new(&kb));
        let agents = AgentSet::new(kb.clone(), store, adapters, None, &config.agents);
        let router = Router::from_config(&config.router, &kb.catalog, None);
        let conversations = Arc::new(ConversationStore::new(
            Duration::from_secs(config.orchestrator.session_timeout_secs),
            config.orchestrator.max_history,
        ));
        Self::new(
            router,
            agents,
            conversations,
            Duration::from_millis(config.orchestrator.turn_timeout_ms),
        )
    }

    pub fn with_agents(mut self, agents: AgentSet) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn agents(&self) -> &AgentSet {
        &self.agents
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Handle one message. A missing conversation id starts a new conversation.
    pub async fn handle_turn(&self, conversation_id: Option<&str>, text: &str) -> SynthesizedReply {
        let conversation_id = match conversation_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => ConversationStore::new_id(),
        };
        let turn_index = self.store.snapshot(&conversation_id).await.turns;
        self.process(Inquiry {
            conversation_id,
            text: text.to_string(),
            turn_index,
        })
        .await
    }

    /// Route, dispatch, synthesize and commit one inquiry. Never fails: every segment yields a
    /// part, failed or not.
    pub async fn process(&self, inquiry: Inquiry) -> SynthesizedReply {
        let deadline = Instant::now() + self.turn_timeout;
        let snapshot = self.store.snapshot(&inquiry.conversation_id).await;
        let segments = match tokio::time::timeout_at(deadline, self.router.route(&inquiry, &snapshot)).await {
            Ok(segments) => segments,
            Err(_) => {
                log::warn!(
                    "{} turn {}: routing ran out of time; using local routing",
                    inquiry.conversation_id,
                    inquiry.turn_index
                );
                self.router.route_local(&inquiry, &snapshot)
            }
        };
        log::debug!(
            "{} turn {}: {} segment(s) {:?}",
            inquiry.conversation_id,
            inquiry.turn_index,
            segments.len(),
            segments.iter().map(|s| s.category).collect::<Vec<_>>()
        );

        let responses = self.dispatch(&segments, &snapshot, deadline).await;
        let answered: Vec<(IntentSegment, AgentResponse)> = segments.into_iter().zip(responses).collect();

        let parts = synthesis::parts(&answered);
        let text = synthesis::render(&parts);
        let mut entities = BTreeMap::new();
        for (segment, response) in &answered {
            entities.extend(accepted_entities(segment, response));
        }
        let categories = answered.iter().map(|(s, _)| s.category).collect();
        let committed = self
            .store
            .commit(
                &inquiry.conversation_id,
                TurnUpdate {
                    text: inquiry.text.clone(),
                    categories,
                    reply: text.clone(),
                    entities,
                },
            )
            .await;
        SynthesizedReply {
            conversation_id: inquiry.conversation_id,
            turn_index: committed.turns.saturating_sub(1),
            parts,
            text,
            context_token: context_token(&committed),
        }
    }

    /// Run every segment's agent, in dependency waves, until the turn deadline. Returns one
    /// response per segment, in segment order.
    async fn dispatch(
        &self,
        segments: &[IntentSegment],
        snapshot: &Arc<ConversationContext>,
        deadline: Instant,
    ) -> Vec<AgentResponse> {
        let waves = waves(segments);
        let mut responses: Vec<Option<AgentResponse>> = vec![None; segments.len()];

        for wave in 0..=waves.iter().copied().max().unwrap_or(0) {
            let members: Vec<usize> = (0..segments.len()).filter(|i| waves[*i] == wave).collect();
            let handles = members.iter().map(|&i| {
                let segment = segments[i].clone();
                let context = wave_context(snapshot, &segment, segments, &responses);
                let agent = self.agents.for_category(segment.category);
                tokio::spawn(async move {
                    tokio::time::timeout_at(deadline, agent.handle(&segment, &context)).await
                })
            });
            let outcomes = join_all(handles).await;
            for (&i, outcome) in members.iter().zip(outcomes) {
                let segment = &segments[i];
                let response = match outcome {
                    Ok(Ok(Ok(response))) => response,
                    Ok(Ok(Err(e))) => {
                        log::warn!("{} agent failed on segment {}: {}", segment.category, i, e);
                        AgentResponse::failed(segment, "an internal error occurred")
                    }
                    Ok(Err(_)) => {
                        log::warn!("{} agent timed out on segment {}", segment.category, i);
                        AgentResponse::failed(segment, "it took too long to respond")
                    }
                    Err(e) => {
                        log::error!("{} agent task aborted on segment {}: {}", segment.category, i, e);
                        AgentResponse::failed(segment, "an internal error occurred")
                    }
                };
                responses[i] = Some(response);
            }
        }

        segments
            .iter()
            .zip(responses)
            .map(|(segment, r)| r.unwrap_or_else(|| AgentResponse::failed(segment, "it was not dispatched")))
            .collect()
    }
}

/// Wave number per segment: 0 without dependencies, otherwise one past the dependency.
/// Forward or self references are treated as no dependency.
fn waves(segments: &[IntentSegment]) -> Vec<usize> {
    let mut out = vec![0usize; segments.len()];
    for (i, segment) in segments.iter().enumerate() {
        if let Some(dep) = segment.depends_on.filter(|d| *d < i) {
            out[i] = out[dep] + 1;
        }
    }
    out
}

/// Snapshot for one segment: the turn snapshot plus identifiers accepted by its dependency.
fn wave_context(
    snapshot: &Arc<ConversationContext>,
    segment: &IntentSegment,
    segments: &[IntentSegment],
    responses: &[Option<AgentResponse>],
) -> Arc<ConversationContext> {
    let accepted = segment
        .depends_on
        .and_then(|d| Some((segments.get(d)?, responses.get(d)?.as_ref()?)))
        .map(|(dep, response)| accepted_entities(dep, response));
    match accepted {
        Some(entities) if !entities.is_empty() => Arc::new(snapshot.with_entities(&entities)),
        _ => snapshot.clone(),
    }
}

/// Entities a turn contributes: well-formed identifiers from the segment's slots plus those the
/// agent confirmed, minus any the agent rejected.
fn accepted_entities(segment: &IntentSegment, response: &AgentResponse) -> BTreeMap<EntityKind, String> {
    let mut out = BTreeMap::new();
    for (slot, value) in &segment.slots {
        let Some(kind) = EntityKind::for_slot(slot) else {
            continue;
        };
        let normalized = match kind {
            EntityKind::OrderId => OrderId::parse(value).ok().map(|id| id.as_str().to_string()),
            EntityKind::TicketId => TicketId::parse(value).ok().map(|id| id.as_str().to_string()),
            EntityKind::AccountId => AccountId::parse(value).ok().map(|id| id.as_str().to_string()),
            EntityKind::ErrorCode => Some(value.trim().to_ascii_uppercase()),
            EntityKind::Product => Some(value.trim().to_string()),
        };
        if let Some(v) = normalized {
            out.insert(kind, v);
        }
    }
    out.extend(response.entities.iter().map(|(k, v)| (*k, v.clone())));
    for kind in &response.rejected {
        out.remove(kind);
    }
    out
}

/// Knowledge store for `knowledge.search`; embedding search falls back to lexical when no
/// inference backend is configured or the index cannot be built.
async fn knowledge_store(
    config: &Config,
    kb: &KnowledgeBase,
    inference: Option<Arc<dyn Inference>>,
) -> Arc<dyn KnowledgeStore> {
    match (config.knowledge.search, inference) {
        (SearchMode::Embedding, Some(inference)) => match EmbeddingIndex::build(inference, kb).await {
            Ok(index) => {
                log::info!("knowledge search: embeddings");
                return Arc::new(index);
            }
            Err(e) => log::warn!("embedding index unavailable ({}); using lexical search", e),
        },
        (SearchMode::Embedding, None) => {
            log::warn!("embedding search needs an inference backend; using lexical search")
        }
        (SearchMode::Lexical, _) => {}
    }
    Arc::new(LexicalIndex::new(kb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ResponseStatus;
    use crate::router::{slots, Category};

    fn seg(index: usize, depends_on: Option<usize>, slots: &[(&str, &str)]) -> IntentSegment {
        IntentSegment {
            index,
            category: Category::OrderBilling,
            slots: slots.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            span: String::new(),
            depends_on,
        }
    }

    #[test]
    fn dependent_segments_run_in_later_waves() {
        let segments = vec![seg(0, None, &[]), seg(1, Some(0), &[]), seg(2, None, &[]), seg(3, Some(1), &[])];
        assert_eq!(waves(&segments), vec![0, 1, 0, 2]);
        assert_eq!(waves(&[seg(0, Some(0), &[])]), vec![0]);
    }

    #[test]
    fn malformed_and_rejected_identifiers_are_not_remembered() {
        let s = seg(0, None, &[(slots::ORDER_REF, "12345"), (slots::ERROR_CODE, "e5678")]);
        let r = AgentResponse::new(&s, ResponseStatus::InvalidIdentifier, "bad");
        let e = accepted_entities(&s, &r);
        assert!(!e.contains_key(&EntityKind::OrderId));
        assert_eq!(e.get(&EntityKind::ErrorCode).map(String::as_str), Some("E5678"));

        let s = seg(0, None, &[(slots::ORDER_REF, "#ord-99999")]);
        let ok = AgentResponse::new(&s, ResponseStatus::Resolved, "ok");
        assert_eq!(
            accepted_entities(&s, &ok).get(&EntityKind::OrderId).map(String::as_str),
            Some("ORD-99999")
        );
        let missing = ok.clone().rejecting(EntityKind::OrderId);
        assert!(accepted_entities(&s, &missing).is_empty());
    }

    #[tokio::test]
    async fn dependency_sees_accepted_identifiers() {
        let snapshot = Arc::new(ConversationContext::new("c"));
        let segments = vec![seg(0, None, &[(slots::ORDER_REF, "ORD-12345")]), seg(1, Some(0), &[])];
        let first = AgentResponse::new(&segments[0], ResponseStatus::Resolved, "ok");
        let ctx = wave_context(&snapshot, &segments[1], &segments, &[Some(first), None]);
        assert_eq!(ctx.entity(EntityKind::OrderId), Some("ORD-12345"));
        assert!(snapshot.entity(EntityKind::OrderId).is_none());
    }
}
