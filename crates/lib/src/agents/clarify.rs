//! Clarification for inquiries the router could not place in any category.

use async_trait::async_trait;

use super::{Agent, AgentError, AgentResponse, ResponseStatus};
use crate::orchestrator::ConversationContext;
use crate::router::{Category, IntentSegment};

const CLARIFICATION: &str = "I want to make sure I point you in the right direction. Could you \
rephrase or add a few details about what you need? I can help with product plans and pricing, \
technical issues and error codes, orders and billing, and account and user management.";

/// Answers segments the router could not place. Asks; never guesses.
pub struct ClarificationAgent;

#[async_trait]
impl Agent for ClarificationAgent {
    fn category(&self) -> Category {
        Category::Ambiguous
    }

    async fn handle(
        &self,
        segment: &IntentSegment,
        _context: &ConversationContext,
    ) -> Result<AgentResponse, AgentError> {
        Ok(AgentResponse::new(segment, ResponseStatus::Clarification, CLARIFICATION)
            .with_confidence(0.0)
            .with_follow_up(
                "For example, you can include an order number (ORD-12345), an error code (E5678) or the plan name.",
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::segment;

    #[tokio::test]
    async fn asks_for_details_instead_of_guessing() {
        let seg = segment(Category::Ambiguous, "Can you help with my website?", &[]);
        let r = ClarificationAgent
            .handle(&seg, &ConversationContext::new("c"))
            .await
            .unwrap();
        assert_eq!(r.status, ResponseStatus::Clarification);
        assert!(r.body.contains("rephrase"));
        assert!(r.body.contains("error codes"));
    }
}
