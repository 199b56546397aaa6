//! Specialized agents: one per routable category plus clarification.
//!
//! Each agent answers a single [`IntentSegment`] against a read-only context snapshot. Adapter
//! failures are mapped to response statuses here; only unexpected failures surface as
//! [`AgentError`], which the orchestrator turns into a failed part.

mod account;
mod billing;
mod clarify;
mod product;
mod technical;

pub use account::AccountAgent;
pub use billing::OrderBillingAgent;
pub use clarify::ClarificationAgent;
pub use product::ProductAgent;
pub use technical::TechnicalSupportAgent;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::adapters::Adapters;
use crate::config::AgentsConfig;
use crate::knowledge::{Collection, KnowledgeBase, KnowledgeError, KnowledgeStore, ScoredPassage};
use crate::llm::{Inference, InferenceError};
use crate::orchestrator::{ConversationContext, EntityKind};
use crate::router::{Category, IntentSegment};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("knowledge search failed: {0}")]
    Knowledge(#[from] KnowledgeError),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("{0}")]
    Internal(String),
}

/// Outcome of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseStatus {
    Resolved,
    NeedsInput,
    Clarification,
    Escalated,
    InvalidIdentifier,
    NotFound,
    Unavailable,
    CapabilityGap,
    Failed,
}

impl ResponseStatus {
    /// True when the part states that something could not be answered.
    pub fn is_gap(self) -> bool {
        matches!(
            self,
            ResponseStatus::Unavailable | ResponseStatus::CapabilityGap | ResponseStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub segment_index: usize,
    pub category: Category,
    pub status: ResponseStatus,
    pub body: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<String>,
    /// Capability that could not answer (gap, unavailable and failed parts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Identifiers confirmed while answering, merged into the conversation context.
    #[serde(skip)]
    pub entities: BTreeMap<EntityKind, String>,
    /// Identifiers from the segment that turned out invalid or unknown; never remembered.
    #[serde(skip)]
    pub rejected: BTreeSet<EntityKind>,
}

impl AgentResponse {
    pub fn new(segment: &IntentSegment, status: ResponseStatus, body: impl Into<String>) -> Self {
        Self {
            segment_index: segment.index,
            category: segment.category,
            status,
            body: body.into(),
            confidence: 1.0,
            follow_up: None,
            capability: None,
            entities: BTreeMap::new(),
            rejected: BTreeSet::new(),
        }
    }

    /// Failed part for a segment whose agent errored, panicked or ran out of time.
    pub fn failed(segment: &IntentSegment, reason: &str) -> Self {
        let capability = segment.category.capability();
        Self::new(
            segment,
            ResponseStatus::Failed,
            format!(
                "I couldn't get an answer from {} for this part of your question ({}). Please try again shortly.",
                capability, reason
            ),
        )
        .with_confidence(0.0)
        .with_capability(capability)
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_follow_up(mut self, follow_up: impl Into<String>) -> Self {
        self.follow_up = Some(follow_up.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_entity(mut self, kind: EntityKind, value: impl Into<String>) -> Self {
        self.entities.insert(kind, value.into());
        self
    }

    pub fn rejecting(mut self, kind: EntityKind) -> Self {
        self.entities.remove(&kind);
        self.rejected.insert(kind);
        self
    }
}

/// Agent contract: answer one segment. Deterministic for fixed adapters and knowledge.
#[async_trait]
pub trait Agent: Send + Sync {
    fn category(&self) -> Category;

    async fn handle(
        &self,
        segment: &IntentSegment,
        context: &ConversationContext,
    ) -> Result<AgentResponse, AgentError>;
}

/// One agent per category; the orchestrator dispatches by [`IntentSegment::category`].
#[derive(Clone)]
pub struct AgentSet {
    product: Arc<dyn Agent>,
    technical: Arc<dyn Agent>,
    billing: Arc<dyn Agent>,
    account: Arc<dyn Agent>,
    clarify: Arc<dyn Agent>,
}

impl AgentSet {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        store: Arc<dyn KnowledgeStore>,
        adapters: &Adapters,
        composer: Option<Arc<dyn Inference>>,
        config: &AgentsConfig,
    ) -> Self {
        let top_k = config.top_k.max(1);
        let mut product = ProductAgent::new(kb.clone(), store.clone(), top_k);
        if let Some(inference) = composer {
            product = product.with_composer(inference);
        }
        Self {
            product: Arc::new(product),
            technical: Arc::new(TechnicalSupportAgent::new(
                adapters.diagnostics.clone(),
                store.clone(),
                config.escalation_severity,
                top_k,
            )),
            billing: Arc::new(OrderBillingAgent::new(
                adapters.orders.clone(),
                kb.clone(),
                store.clone(),
                top_k,
            )),
            account: Arc::new(AccountAgent::new(adapters.accounts.clone(), kb, store, top_k)),
            clarify: Arc::new(ClarificationAgent),
        }
    }

    /// Replace the agent for its own category.
    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        match agent.category() {
            Category::Product => self.product = agent,
            Category::TechnicalSupport => self.technical = agent,
            Category::OrderBilling => self.billing = agent,
            Category::AccountManagement => self.account = agent,
            Category::Ambiguous => self.clarify = agent,
        }
        self
    }

    pub fn for_category(&self, category: Category) -> Arc<dyn Agent> {
        match category {
            Category::Product => self.product.clone(),
            Category::TechnicalSupport => self.technical.clone(),
            Category::OrderBilling => self.billing.clone(),
            Category::AccountManagement => self.account.clone(),
            Category::Ambiguous => self.clarify.clone(),
        }
    }
}

static ANAPHOR_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:that|this|the same|same|my last|it|its|my)\b").expect("reference word pattern")
});

/// Whether the span refers back to something ("that order", "it", "my account").
pub(crate) fn refers_back(span: &str) -> bool {
    ANAPHOR_WORD.is_match(span)
}

/// Contains any of the given lower-case words or phrases (word boundaries respected).
pub(crate) fn mentions(span: &str, words: &[&str]) -> bool {
    let padded = crate::router::normalize_words(span);
    words.iter().any(|w| padded.contains(&format!(" {} ", w)))
}

/// Search helper: passages of `collection` for `query`, best first.
pub(crate) async fn lookup(
    store: &dyn KnowledgeStore,
    collection: Collection,
    query: &str,
    top_k: usize,
) -> Result<Vec<ScoredPassage>, AgentError> {
    Ok(store.search(collection, query, top_k).await?)
}

/// First paragraph of a passage, trimmed, for compact answers.
pub(crate) fn passage_excerpt(text: &str) -> &str {
    text.split("\n\n").next().unwrap_or(text).trim()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::knowledge::LexicalIndex;
    use std::collections::BTreeMap;

    pub fn kb() -> Arc<KnowledgeBase> {
        Arc::new(KnowledgeBase::bundled().unwrap())
    }

    pub fn lexical(kb: &KnowledgeBase) -> Arc<dyn KnowledgeStore> {
        Arc::new(LexicalIndex::new(kb))
    }

    pub fn segment(category: Category, span: &str, slots: &[(&str, &str)]) -> IntentSegment {
        IntentSegment {
            index: 0,
            category,
            slots: slots
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            span: span.to_string(),
            depends_on: None,
        }
    }
}
