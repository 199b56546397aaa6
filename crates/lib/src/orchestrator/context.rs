//! Per-conversation context and its store.
//!
//! Contexts are keyed by conversation id, created on the first committed turn and evicted
//! after a period of inactivity. Only the orchestrator writes, once per turn, after every
//! segment task has finished; agents see an immutable snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::router::{slots, Category};

/// Opaque conversation identifier.
pub type ConversationId = String;

/// Kinds of entities remembered across turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    OrderId,
    TicketId,
    ErrorCode,
    Product,
    AccountId,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::OrderId,
        EntityKind::TicketId,
        EntityKind::ErrorCode,
        EntityKind::Product,
        EntityKind::AccountId,
    ];

    /// Segment slot carrying this entity.
    pub fn slot(self) -> &'static str {
        match self {
            EntityKind::OrderId => slots::ORDER_REF,
            EntityKind::TicketId => slots::TICKET_REF,
            EntityKind::ErrorCode => slots::ERROR_CODE,
            EntityKind::Product => slots::PRODUCT,
            EntityKind::AccountId => slots::ACCOUNT_ID,
        }
    }

    pub fn for_slot(slot: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.slot() == slot)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::OrderId => "orderId",
            EntityKind::TicketId => "ticketId",
            EntityKind::ErrorCode => "errorCode",
            EntityKind::Product => "product",
            EntityKind::AccountId => "accountId",
        }
    }
}

/// One completed turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub turn_index: usize,
    pub text: String,
    pub categories: Vec<Category>,
    pub reply: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub conversation_id: ConversationId,
    /// Most recent turns, oldest first; bounded by the store's history limit.
    pub history: Vec<TurnRecord>,
    /// Total turns committed, including any dropped from `history`.
    pub turns: usize,
    pub entities: BTreeMap<EntityKind, String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(conversation_id: impl Into<ConversationId>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            history: Vec::new(),
            turns: 0,
            entities: BTreeMap::new(),
            created_at: now,
            last_active: now,
        }
    }

    pub fn entity(&self, kind: EntityKind) -> Option<&str> {
        self.entities.get(&kind).map(String::as_str)
    }

    /// Copy with `entities` merged over the current ones.
    pub fn with_entities(&self, entities: &BTreeMap<EntityKind, String>) -> Self {
        let mut out = self.clone();
        out.entities
            .extend(entities.iter().map(|(k, v)| (*k, v.clone())));
        out
    }
}

/// What the orchestrator commits after a turn.
#[derive(Debug, Clone)]
pub struct TurnUpdate {
    pub text: String,
    pub categories: Vec<Category>,
    pub reply: String,
    pub entities: BTreeMap<EntityKind, String>,
}

/// In-memory store for conversation contexts (snapshot, commit, evict).
pub struct ConversationStore {
    inner: Arc<RwLock<HashMap<ConversationId, ConversationContext>>>,
    idle_timeout: Duration,
    max_history: usize,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(1800), 50)
    }
}

impl ConversationStore {
    pub fn new(idle_timeout: Duration, max_history: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout,
            max_history: max_history.max(1),
        }
    }

    /// Generate a fresh conversation id.
    pub fn new_id() -> ConversationId {
        format!("conv-{}", uuid::Uuid::new_v4())
    }

    /// Read-only snapshot for a turn. Unknown ids get an empty context (not stored until commit).
    pub async fn snapshot(&self, id: &str) -> Arc<ConversationContext> {
        match self.inner.read().await.get(id) {
            Some(ctx) => Arc::new(ctx.clone()),
            None => Arc::new(ConversationContext::new(id)),
        }
    }

    /// Return a clone of the context if it exists.
    pub async fn get(&self, id: &str) -> Option<ConversationContext> {
        self.inner.read().await.get(id).cloned()
    }

    /// Record a turn and merge its entities. The turn index is assigned here, so concurrent
    /// turns on one conversation never share an index. Returns the updated context.
    pub async fn commit(&self, id: &str, update: TurnUpdate) -> ConversationContext {
        let now = Utc::now();
        let mut g = self.inner.write().await;
        let ctx = g
            .entry(id.to_string())
            .or_insert_with(|| ConversationContext::new(id));
        ctx.history.push(TurnRecord {
            turn_index: ctx.turns,
            text: update.text,
            categories: update.categories,
            reply: update.reply,
            at: now,
        });
        ctx.turns += 1;
        if ctx.history.len() > self.max_history {
            let excess = ctx.history.len() - self.max_history;
            ctx.history.drain(..excess);
        }
        ctx.entities.extend(update.entities);
        ctx.last_active = now;
        ctx.clone()
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Drop contexts idle for longer than the timeout as of `now`. Returns how many were evicted.
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let timeout = chrono::Duration::from_std(self.idle_timeout).unwrap_or(chrono::Duration::MAX);
        let mut g = self.inner.write().await;
        let before = g.len();
        g.retain(|_, ctx| now.signed_duration_since(ctx.last_active) <= timeout);
        before - g.len()
    }

    pub async fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now()).await
    }

    /// Periodically evict idle conversations until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = self.evict_expired().await;
                if evicted > 0 {
                    log::debug!("evicted {} idle conversation(s)", evicted);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(text: &str, entities: &[(EntityKind, &str)]) -> TurnUpdate {
        TurnUpdate {
            text: text.to_string(),
            categories: vec![Category::OrderBilling],
            reply: "ok".to_string(),
            entities: entities.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        }
    }

    #[tokio::test]
    async fn snapshot_of_unknown_conversation_is_empty_and_not_stored() {
        let store = ConversationStore::default();
        let snap = store.snapshot("c1").await;
        assert_eq!(snap.turns, 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn commit_assigns_turn_indexes_and_merges_entities() {
        let store = ConversationStore::default();
        let first = store
            .commit("c1", update("a", &[(EntityKind::OrderId, "ORD-12345")]))
            .await;
        assert_eq!(first.history[0].turn_index, 0);
        let second = store
            .commit("c1", update("b", &[(EntityKind::ErrorCode, "E5678")]))
            .await;
        assert_eq!(second.turns, 2);
        assert_eq!(second.history[1].turn_index, 1);
        assert_eq!(second.entity(EntityKind::OrderId), Some("ORD-12345"));
        assert_eq!(second.entity(EntityKind::ErrorCode), Some("E5678"));
    }

    #[tokio::test]
    async fn history_is_bounded_but_turn_count_is_not() {
        let store = ConversationStore::new(Duration::from_secs(60), 2);
        for i in 0..5 {
            store.commit("c1", update(&format!("t{}", i), &[])).await;
        }
        let ctx = store.get("c1").await.unwrap();
        assert_eq!(ctx.turns, 5);
        assert_eq!(ctx.history.len(), 2);
        assert_eq!(ctx.history[0].text, "t3");
    }

    #[tokio::test]
    async fn idle_conversations_are_evicted() {
        let store = ConversationStore::new(Duration::from_secs(60), 10);
        store.commit("old", update("a", &[])).await;
        store.commit("new", update("b", &[])).await;
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(store.evict_expired_at(Utc::now()).await, 0);
        assert_eq!(store.evict_expired_at(later).await, 2);
        assert!(store.get("old").await.is_none());
    }

    #[test]
    fn entity_kinds_map_to_slots() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::for_slot(kind.slot()), Some(kind));
        }
        assert_eq!(EntityKind::for_slot(slots::TOPIC), None);
    }
}
