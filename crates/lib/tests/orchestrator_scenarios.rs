//! End-to-end turns through the orchestrator over the bundled corpus and stub adapters.
//! Does not require Ollama or any external API.

use async_trait::async_trait;
use concierge::adapters::{
    AdapterError, Adapters, Order, OrderApi, OrderId, StubAccountApi, StubDiagnosticApi, StubOrderApi,
    BUNDLED_FIXTURES,
};
use concierge::agents::{Agent, AgentError, AgentResponse, AgentSet, ResponseStatus};
use concierge::config::Config;
use concierge::knowledge::{KnowledgeBase, KnowledgeStore, LexicalIndex};
use concierge::llm::{CompletionOptions, Inference, InferenceError};
use concierge::orchestrator::{ConversationContext, ConversationStore, EntityKind, Orchestrator, CLOSING_PROMPT};
use concierge::router::{Category, IntentSegment, Router};
use std::sync::Arc;
use std::time::Duration;

fn fixture(name: &str) -> &'static str {
    BUNDLED_FIXTURES
        .get_file(name)
        .and_then(|f| f.contents_utf8())
        .expect("bundled fixture")
}

fn adapters_with(kb: &Arc<KnowledgeBase>, orders: Arc<dyn OrderApi>) -> Adapters {
    Adapters {
        orders,
        accounts: Arc::new(StubAccountApi::from_json(fixture("accounts.json")).expect("accounts fixture")),
        diagnostics: Arc::new(StubDiagnosticApi::new(kb.clone())),
    }
}

fn counted() -> (Orchestrator, Arc<StubOrderApi>) {
    let kb = Arc::new(KnowledgeBase::bundled().expect("bundled knowledge"));
    let orders = Arc::new(StubOrderApi::from_json(fixture("orders.json")).expect("orders fixture"));
    let adapters = adapters_with(&kb, orders.clone());
    (Orchestrator::with_adapters(kb, &adapters, &Config::default()), orders)
}

#[tokio::test]
async fn error_code_reply_names_cause_and_ordered_steps() {
    let orchestrator = Orchestrator::bundled().expect("orchestrator");
    let reply = orchestrator
        .handle_turn(None, "I'm getting error E5678 when trying to deploy a container. How do I fix this?")
        .await;
    assert_eq!(reply.parts.len(), 1);
    assert_eq!(reply.parts[0].status, ResponseStatus::Resolved);
    assert!(reply.text.contains("Container Image Verification Failed"), "{}", reply.text);
    let positions: Vec<usize> = ["Image integrity", "Signature", "Policy", "Registry authentication"]
        .iter()
        .map(|c| reply.text.find(c).unwrap_or_else(|| panic!("missing {} in {}", c, reply.text)))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{}", reply.text);
    assert!(reply.text.ends_with(CLOSING_PROMPT));
}

#[tokio::test]
async fn order_status_reports_shipped_and_total() {
    let (orchestrator, orders) = counted();
    let reply = orchestrator
        .handle_turn(None, "Can you check the status of order #ORD-12345?")
        .await;
    assert!(reply.text.contains("Shipped"), "{}", reply.text);
    assert!(reply.text.contains("$149.99"), "{}", reply.text);
    assert_eq!(orders.calls(), 1);

    let ctx = orchestrator.store().snapshot(&reply.conversation_id).await;
    assert_eq!(ctx.entity(EntityKind::OrderId), Some("ORD-12345"));
}

#[tokio::test]
async fn unclassifiable_inquiry_gets_a_clarification_only() {
    let orchestrator = Orchestrator::bundled().expect("orchestrator");
    let reply = orchestrator
        .handle_turn(None, "I have a question about something I saw on your website.")
        .await;
    assert_eq!(reply.parts.len(), 1);
    assert_eq!(reply.parts[0].category, Category::Ambiguous);
    assert_eq!(reply.parts[0].status, ResponseStatus::Clarification);
    assert!(!reply.text.contains(CLOSING_PROMPT));
    assert!(!reply.text.contains("$"), "{}", reply.text);
}

#[tokio::test]
async fn ticket_gap_is_stated_while_the_product_question_is_answered() {
    let orchestrator = Orchestrator::bundled().expect("orchestrator");
    let reply = orchestrator
        .handle_turn(
            None,
            "What is the status of my ticket TKT-789? Also, how much is CloudManager Pro?",
        )
        .await;
    assert_eq!(reply.parts.len(), 2);
    let gap = &reply.parts[0];
    assert_eq!(gap.status, ResponseStatus::CapabilityGap);
    assert_eq!(gap.capability.as_deref(), Some("ticket status lookup"));
    assert!(gap.text.contains("not available through our current interfaces"));
    assert_eq!(reply.parts[1].category, Category::Product);
    assert!(reply.parts[1].text.contains("$149.99"), "{}", reply.parts[1].text);
    assert!(reply.parts.iter().all(|p| p.label.is_some()));
    assert!(reply.text.ends_with(CLOSING_PROMPT));
}

#[tokio::test]
async fn malformed_order_number_is_rejected_without_an_api_call() {
    let (orchestrator, orders) = counted();
    let reply = orchestrator.handle_turn(None, "Where is order 12345?").await;
    assert_eq!(reply.parts[0].status, ResponseStatus::InvalidIdentifier);
    assert!(reply.text.contains("ORD-12345"), "{}", reply.text);
    assert_eq!(orders.calls(), 0);

    let ctx = orchestrator.store().snapshot(&reply.conversation_id).await;
    assert!(ctx.entity(EntityKind::OrderId).is_none());
}

#[tokio::test]
async fn that_order_resolves_against_the_previous_turn() {
    let (orchestrator, orders) = counted();
    let first = orchestrator
        .handle_turn(None, "Can you check the status of order #ORD-12345?")
        .await;
    assert_eq!(first.turn_index, 0);

    let second = orchestrator
        .handle_turn(Some(&first.conversation_id), "Has that order been delivered?")
        .await;
    assert_eq!(second.conversation_id, first.conversation_id);
    assert_eq!(second.turn_index, 1);
    assert_eq!(second.parts[0].category, Category::OrderBilling);
    assert!(second.text.contains("ORD-12345"), "{}", second.text);
    assert_eq!(orders.calls(), 2);
    assert_ne!(first.context_token, second.context_token);
}

#[tokio::test]
async fn replayed_turn_repeats_the_same_facts() {
    let a = Orchestrator::bundled().expect("orchestrator");
    let b = Orchestrator::bundled().expect("orchestrator");
    let text = "My deployment fails with error E1234. Also, can you check order ORD-56789?";
    let ra = a.handle_turn(Some("conv-replay"), text).await;
    let rb = b.handle_turn(Some("conv-replay"), text).await;
    assert_eq!(ra.text, rb.text);
    assert_eq!(ra.context_token, rb.context_token);
    let statuses = |r: &concierge::orchestrator::SynthesizedReply| {
        r.parts.iter().map(|p| (p.category, p.status)).collect::<Vec<_>>()
    };
    assert_eq!(statuses(&ra), statuses(&rb));
}

#[tokio::test]
async fn missing_conversation_id_starts_a_new_conversation() {
    let orchestrator = Orchestrator::bundled().expect("orchestrator");
    let a = orchestrator.handle_turn(None, "How much is CloudManager Pro?").await;
    let b = orchestrator.handle_turn(Some("  "), "How much is CloudManager Pro?").await;
    assert!(a.conversation_id.starts_with("conv-"));
    assert_ne!(a.conversation_id, b.conversation_id);
    assert_eq!(a.turn_index, 0);
    assert_eq!(orchestrator.store().len().await, 2);
}

struct Stalled;

#[async_trait]
impl Agent for Stalled {
    fn category(&self) -> Category {
        Category::TechnicalSupport
    }

    async fn handle(
        &self,
        segment: &IntentSegment,
        _context: &ConversationContext,
    ) -> Result<AgentResponse, AgentError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(AgentResponse::new(segment, ResponseStatus::Resolved, "too late"))
    }
}

#[tokio::test]
async fn slow_agent_yields_a_partial_reply() {
    let orchestrator = Orchestrator::bundled().expect("orchestrator");
    let agents = orchestrator.agents().clone().with_agent(Arc::new(Stalled));
    let orchestrator = orchestrator
        .with_agents(agents)
        .with_turn_timeout(Duration::from_millis(200));

    let reply = orchestrator
        .handle_turn(
            None,
            "My deployment fails with error E1234. Also, can you check order ORD-12345?",
        )
        .await;
    assert_eq!(reply.parts.len(), 2);
    assert_eq!(reply.parts[0].status, ResponseStatus::Failed);
    assert!(reply.parts[0].text.contains("took too long"), "{}", reply.parts[0].text);
    assert!(!reply.text.contains("too late"));
    assert_eq!(reply.parts[1].status, ResponseStatus::Resolved);
    assert!(reply.parts[1].text.contains("Shipped"));
}

struct OrdersDown;

#[async_trait]
impl OrderApi for OrdersDown {
    async fn get_order(&self, _id: &OrderId) -> Result<Order, AdapterError> {
        Err(AdapterError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn order_api_outage_is_stated_beside_a_resolved_part() {
    let kb = Arc::new(KnowledgeBase::bundled().expect("bundled knowledge"));
    let adapters = adapters_with(&kb, Arc::new(OrdersDown));
    let orchestrator = Orchestrator::with_adapters(kb, &adapters, &Config::default());

    let reply = orchestrator
        .handle_turn(
            None,
            "My deployment fails with error E1234. Also, can you check order ORD-12345?",
        )
        .await;
    assert_eq!(reply.parts.len(), 2);
    assert_eq!(reply.parts[0].status, ResponseStatus::Resolved);
    assert!(reply.parts[0].text.contains("API Connection Failure"), "{}", reply.parts[0].text);
    let down = &reply.parts[1];
    assert_eq!(down.status, ResponseStatus::Unavailable);
    assert_eq!(down.capability.as_deref(), Some("order status lookup"));
    assert!(down.text.contains("temporarily unavailable"), "{}", down.text);
    assert!(!reply.text.contains("connection refused"));
    assert!(reply.text.ends_with(CLOSING_PROMPT));
}

struct Stuck;

#[async_trait]
impl Inference for Stuck {
    async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String, InferenceError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(r#"{"classification":"product","confidence":0.9}"#.to_string())
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, InferenceError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn stalled_llm_routing_still_answers_within_the_turn_deadline() {
    let kb = Arc::new(KnowledgeBase::bundled().expect("bundled knowledge"));
    let adapters = Adapters::bundled_stubs(kb.clone()).expect("stub adapters");
    let mut config = Config::default();
    config.router.llm_fallback = true;
    let inference: Arc<dyn Inference> = Arc::new(Stuck);
    let router = Router::from_config(&config.router, &kb.catalog, Some(inference));
    let search: Arc<dyn KnowledgeStore> = Arc::new(LexicalIndex::new(&kb));
    let agents = AgentSet::new(kb.clone(), search, &adapters, None, &config.agents);
    let orchestrator = Orchestrator::new(
        router,
        agents,
        Arc::new(ConversationStore::default()),
        Duration::from_millis(200),
    );

    let reply = tokio::time::timeout(
        Duration::from_secs(3),
        orchestrator.handle_turn(None, "I have a question about something I saw on your website."),
    )
    .await
    .expect("turn finished within its deadline");
    assert_eq!(reply.parts.len(), 1);
    assert_eq!(reply.parts[0].category, Category::Ambiguous);
    assert_eq!(reply.parts[0].status, ResponseStatus::Clarification);
    assert_eq!(orchestrator.store().len().await, 1);
}
