//! Orders and billing: order status via the Order API, ticket references, billing FAQ.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;

use super::{lookup, mentions, passage_excerpt, Agent, AgentError, AgentResponse, ResponseStatus};
use crate::adapters::{AdapterError, Order, OrderApi, OrderId, TicketId};
use crate::knowledge::{Collection, KnowledgeBase, KnowledgeStore};
use crate::orchestrator::{ConversationContext, EntityKind};
use crate::router::{slots, Category, IntentSegment};

const ORDER_WORDS: &[&str] = &[
    "order", "orders", "shipping", "shipped", "ship", "delivery", "delivered", "deliver",
    "tracking", "track", "package", "arrive", "arrived",
];

const TICKET_WORDS: &[&str] = &["ticket", "tickets", "case", "support request"];

const ORDER_CAPABILITY: &str = "order status lookup";

pub struct OrderBillingAgent {
    orders: Arc<dyn OrderApi>,
    kb: Arc<KnowledgeBase>,
    store: Arc<dyn KnowledgeStore>,
    top_k: usize,
}

impl OrderBillingAgent {
    pub fn new(
        orders: Arc<dyn OrderApi>,
        kb: Arc<KnowledgeBase>,
        store: Arc<dyn KnowledgeStore>,
        top_k: usize,
    ) -> Self {
        Self {
            orders,
            kb,
            store,
            top_k,
        }
    }

    fn ticket(&self, segment: &IntentSegment, raw: Option<&str>) -> AgentResponse {
        let Some(raw) = raw else {
            return AgentResponse::new(
                segment,
                ResponseStatus::CapabilityGap,
                "Ticket status is not available through our current interfaces, so I can't check support tickets for you.",
            )
            .with_confidence(0.8)
            .with_capability("ticket status lookup")
            .with_follow_up("Our support team can give you an update on any open ticket.");
        };
        match TicketId::parse(raw) {
            Err(e) => AgentResponse::new(
                segment,
                ResponseStatus::InvalidIdentifier,
                format!("\"{}\" doesn't look like a ticket number (expected {}).", e.value, e.expected),
            )
            .with_confidence(0.9)
            .with_follow_up("Could you double-check the ticket number?")
            .rejecting(EntityKind::TicketId),
            Ok(id) => AgentResponse::new(
                segment,
                ResponseStatus::CapabilityGap,
                format!(
                    "Ticket status is not available through our current interfaces, so I can't check {} for you.",
                    id
                ),
            )
            .with_confidence(0.8)
            .with_capability("ticket status lookup")
            .with_follow_up("Our support team can give you an update on that ticket.")
            .with_entity(EntityKind::TicketId, id.as_str()),
        }
    }

    async fn order(&self, segment: &IntentSegment, id: OrderId) -> AgentResponse {
        match self.orders.get_order(&id).await {
            Ok(order) => AgentResponse::new(segment, ResponseStatus::Resolved, self.describe(&order))
                .with_confidence(0.95)
                .with_entity(EntityKind::OrderId, id.as_str()),
            Err(AdapterError::NotFound(_)) => AgentResponse::new(
                segment,
                ResponseStatus::NotFound,
                format!("I couldn't find an order with number {}.", id),
            )
            .with_confidence(0.8)
            .with_follow_up("Could you double-check the order number? It's on your confirmation email.")
            .rejecting(EntityKind::OrderId),
            Err(AdapterError::Unauthorized(_)) => AgentResponse::new(
                segment,
                ResponseStatus::Unavailable,
                format!("I'm not permitted to look up order {} with the current credentials.", id),
            )
            .with_confidence(0.0)
            .with_capability(ORDER_CAPABILITY)
            .with_entity(EntityKind::OrderId, id.as_str()),
            Err(AdapterError::Unavailable(e)) => {
                log::warn!("order lookup for {} unavailable: {}", id, e);
                AgentResponse::new(
                    segment,
                    ResponseStatus::Unavailable,
                    format!(
                        "Order status lookup is temporarily unavailable, so I can't check {} right now. Please try again in a few minutes.",
                        id
                    ),
                )
                .with_confidence(0.0)
                .with_capability(ORDER_CAPABILITY)
                .with_entity(EntityKind::OrderId, id.as_str())
            }
        }
    }

    fn describe(&self, order: &Order) -> String {
        let mut s = format!(
            "Order {} status: {}. Total: {}.",
            order.order_id, order.status, order.total
        );
        if let Some(d) = order.order_date {
            let _ = write!(s, " Ordered on {}.", d);
        }
        if let Some(d) = order.shipping_date {
            let _ = write!(s, " Shipped on {}.", d);
        }
        if let Some(d) = order.delivery_date {
            let _ = write!(s, " Delivered on {}.", d);
        }
        if !order.items.is_empty() {
            s.push_str("\nItems:");
            for item in &order.items {
                let name = self
                    .kb
                    .catalog
                    .display_name(&item.product_id)
                    .unwrap_or(item.product_id.as_str());
                let _ = write!(s, "\n- {} x {} at {}", item.quantity, name, item.unit_price);
            }
        }
        s
    }

    async fn faq(&self, segment: &IntentSegment) -> Result<AgentResponse, AgentError> {
        let hits = lookup(self.store.as_ref(), Collection::Billing, &segment.span, self.top_k).await?;
        Ok(match hits.first() {
            Some(best) => AgentResponse::new(
                segment,
                ResponseStatus::Resolved,
                format!("{}: {}", best.passage.title, passage_excerpt(&best.passage.text)),
            )
            .with_confidence(0.7),
            None => AgentResponse::new(
                segment,
                ResponseStatus::NeedsInput,
                "I can help with order status, invoices, payments and refunds.",
            )
            .with_confidence(0.3)
            .with_follow_up("Could you share your order number (for example ORD-12345) or say what you need help with?"),
        })
    }
}

#[async_trait]
impl Agent for OrderBillingAgent {
    fn category(&self) -> Category {
        Category::OrderBilling
    }

    async fn handle(
        &self,
        segment: &IntentSegment,
        context: &ConversationContext,
    ) -> Result<AgentResponse, AgentError> {
        let order_ref = segment.slot(slots::ORDER_REF);
        let ticket_ref = segment.slot(slots::TICKET_REF);
        if ticket_ref.is_some() || (order_ref.is_none() && mentions(&segment.span, TICKET_WORDS)) {
            return Ok(self.ticket(segment, ticket_ref));
        }
        if let Some(raw) = order_ref {
            return Ok(match OrderId::parse(raw) {
                Ok(id) => self.order(segment, id).await,
                Err(e) => AgentResponse::new(
                    segment,
                    ResponseStatus::InvalidIdentifier,
                    format!("\"{}\" doesn't look like a valid order number (expected {}).", e.value, e.expected),
                )
                .with_confidence(0.9)
                .with_follow_up("Could you double-check the order number? Order numbers look like ORD-12345.")
                .rejecting(EntityKind::OrderId),
            });
        }
        if !mentions(&segment.span, ORDER_WORDS) {
            return self.faq(segment).await;
        }
        match context.entity(EntityKind::OrderId).map(OrderId::parse) {
            Some(Ok(id)) => Ok(self.order(segment, id).await),
            _ => Ok(AgentResponse::new(
                segment,
                ResponseStatus::NeedsInput,
                "I can check that order for you once I have the order number.",
            )
            .with_confidence(0.4)
            .with_follow_up("Could you share your order number (for example ORD-12345)?")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{StubOrderApi, BUNDLED_FIXTURES};
    use crate::agents::test_support::{kb, lexical, segment};

    fn agent() -> (OrderBillingAgent, Arc<StubOrderApi>) {
        let json = BUNDLED_FIXTURES
            .get_file("orders.json")
            .and_then(|f| f.contents_utf8())
            .unwrap();
        let orders = Arc::new(StubOrderApi::from_json(json).unwrap());
        let kb = kb();
        let store = lexical(&kb);
        (OrderBillingAgent::new(orders.clone(), kb, store, 3), orders)
    }

    #[tokio::test]
    async fn shipped_order_reports_status_and_total() {
        let (agent, _) = agent();
        let seg = segment(
            Category::OrderBilling,
            "Can you check the status of order #ORD-12345?",
            &[(slots::ORDER_REF, "ORD-12345")],
        );
        let r = agent.handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Resolved);
        assert!(r.body.contains("Shipped"));
        assert!(r.body.contains("$149.99"));
    }

    #[tokio::test]
    async fn invalid_order_number_never_reaches_the_api() {
        let (agent, orders) = agent();
        let seg = segment(Category::OrderBilling, "where is order 12", &[(slots::ORDER_REF, "12")]);
        let r = agent.handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::InvalidIdentifier);
        assert!(r.rejected.contains(&EntityKind::OrderId));
        assert_eq!(orders.calls(), 0);
    }

    #[tokio::test]
    async fn that_order_uses_the_context_order_id() {
        let (agent, orders) = agent();
        let mut ctx = ConversationContext::new("c");
        ctx.entities.insert(EntityKind::OrderId, "ORD-56789".to_string());
        let seg = segment(Category::OrderBilling, "Has that order shipped yet?", &[]);
        let r = agent.handle(&seg, &ctx).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Resolved);
        assert!(r.body.contains("ORD-56789"));
        assert_eq!(orders.calls(), 1);
    }

    #[tokio::test]
    async fn missing_order_number_asks_for_it() {
        let (agent, _) = agent();
        let seg = segment(Category::OrderBilling, "Where is my order?", &[]);
        let r = agent.handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::NeedsInput);
    }

    #[tokio::test]
    async fn ticket_status_is_an_explicit_gap() {
        let (agent, orders) = agent();
        let seg = segment(
            Category::OrderBilling,
            "What's the status of ticket TKT-789?",
            &[(slots::TICKET_REF, "TKT-789")],
        );
        let r = agent.handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::CapabilityGap);
        assert_eq!(r.capability.as_deref(), Some("ticket status lookup"));
        assert!(r.body.contains("TKT-789"));
        assert_eq!(orders.calls(), 0);
    }

    #[tokio::test]
    async fn billing_question_is_answered_from_the_faq() {
        let (agent, _) = agent();
        let seg = segment(Category::OrderBilling, "How do refunds work?", &[]);
        let r = agent.handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Resolved);
        assert!(r.body.contains("30 days"));
    }

    struct Failing(fn() -> AdapterError);

    #[async_trait]
    impl OrderApi for Failing {
        async fn get_order(&self, _id: &OrderId) -> Result<Order, AdapterError> {
            Err((self.0)())
        }
    }

    fn failing(error: fn() -> AdapterError) -> OrderBillingAgent {
        let kb = kb();
        let store = lexical(&kb);
        OrderBillingAgent::new(Arc::new(Failing(error)), kb, store, 3)
    }

    #[tokio::test]
    async fn order_api_down_names_the_unavailable_lookup() {
        let agent = failing(|| AdapterError::Unavailable("connection refused".to_string()));
        let seg = segment(
            Category::OrderBilling,
            "Where is order ORD-12345?",
            &[(slots::ORDER_REF, "ORD-12345")],
        );
        let r = agent.handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Unavailable);
        assert!(r.body.contains("temporarily unavailable"), "{}", r.body);
        assert!(!r.body.contains("connection refused"));
        assert_eq!(r.capability.as_deref(), Some("order status lookup"));
    }

    #[tokio::test]
    async fn unauthorized_order_lookup_is_not_a_raw_error() {
        let agent = failing(|| AdapterError::Unauthorized("401 Unauthorized".to_string()));
        let seg = segment(
            Category::OrderBilling,
            "Where is order ORD-12345?",
            &[(slots::ORDER_REF, "ORD-12345")],
        );
        let r = agent.handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Unavailable);
        assert!(r.body.contains("not permitted"), "{}", r.body);
        assert!(!r.body.contains("401"));
        assert_eq!(r.capability.as_deref(), Some("order status lookup"));
    }
}
