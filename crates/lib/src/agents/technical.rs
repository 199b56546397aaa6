//! Technical support: error-code diagnostics, escalation of severe issues, symptom search.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;

use super::{lookup, passage_excerpt, Agent, AgentError, AgentResponse, ResponseStatus};
use crate::adapters::{AdapterError, Diagnosis, DiagnosticApi};
use crate::knowledge::{Collection, KnowledgeStore, ScoredPassage, Severity};
use crate::orchestrator::{ConversationContext, EntityKind};
use crate::router::{slots, Category, IntentSegment};

pub struct TechnicalSupportAgent {
    diagnostics: Arc<dyn DiagnosticApi>,
    store: Arc<dyn KnowledgeStore>,
    escalation_severity: Severity,
    top_k: usize,
}

impl TechnicalSupportAgent {
    pub fn new(
        diagnostics: Arc<dyn DiagnosticApi>,
        store: Arc<dyn KnowledgeStore>,
        escalation_severity: Severity,
        top_k: usize,
    ) -> Self {
        Self {
            diagnostics,
            store,
            escalation_severity,
            top_k,
        }
    }

    async fn diagnose(&self, segment: &IntentSegment, code: &str) -> Result<AgentResponse, AgentError> {
        match self.diagnostics.get_diagnostics(code).await {
            Ok(d) if d.severity >= self.escalation_severity => Ok(escalation(segment, &d)),
            Ok(d) => Ok(AgentResponse::new(segment, ResponseStatus::Resolved, resolution(&d))
                .with_confidence(0.9)
                .with_entity(EntityKind::ErrorCode, d.code)),
            Err(AdapterError::NotFound(_)) => Ok(AgentResponse::new(
                segment,
                ResponseStatus::NotFound,
                format!("I couldn't find error code {} in our documentation.", code),
            )
            .with_confidence(0.3)
            .with_follow_up(
                "Could you share the full error message and what you were doing when it appeared?",
            )
            .rejecting(EntityKind::ErrorCode)),
            Err(e) => {
                log::warn!("diagnostics for {} failed: {}", code, e);
                let query = format!("{} {}", code, segment.span);
                let hits = lookup(self.store.as_ref(), Collection::Technical, &query, self.top_k).await?;
                match hits.first() {
                    Some(best) => Ok(AgentResponse::new(
                        segment,
                        ResponseStatus::Resolved,
                        format!(
                            "The diagnostics service is temporarily unavailable, so this comes from our documentation.\n{}",
                            documented(best)
                        ),
                    )
                    .with_confidence(0.5)
                    .with_entity(EntityKind::ErrorCode, code)),
                    None => Ok(AgentResponse::new(
                        segment,
                        ResponseStatus::Unavailable,
                        format!(
                            "Diagnostics lookup is temporarily unavailable, so I can't look up error {} right now. Please try again in a few minutes.",
                            code
                        ),
                    )
                    .with_confidence(0.0)
                    .with_capability("diagnostics lookup")
                    .with_entity(EntityKind::ErrorCode, code)),
                }
            }
        }
    }

    async fn symptom_search(&self, segment: &IntentSegment) -> Result<AgentResponse, AgentError> {
        let hits = lookup(self.store.as_ref(), Collection::Technical, &segment.span, self.top_k).await?;
        let Some(best) = hits.first() else {
            return Ok(AgentResponse::new(
                segment,
                ResponseStatus::NeedsInput,
                "I need a little more to go on to troubleshoot this.",
            )
            .with_confidence(0.2)
            .with_follow_up("Could you share the error code or describe what you see and when it happens?"));
        };
        let mut body = documented(best);
        if let Some(next) = hits.get(1) {
            let _ = write!(body, "\n\nSee also: {}.", next.passage.title);
        }
        Ok(AgentResponse::new(segment, ResponseStatus::Resolved, body)
            .with_confidence(0.6)
            .with_follow_up("If an error code is shown, send it along and I can look up the exact fix."))
    }
}

fn resolution(d: &Diagnosis) -> String {
    let mut s = format!("Error {}: {}.", d.code, d.name);
    if !d.causes.is_empty() {
        s.push_str("\nLikely causes:");
        for cause in &d.causes {
            let _ = write!(s, "\n- {}", cause);
        }
    }
    s.push_str("\nResolution steps:");
    for (i, step) in d.steps.iter().enumerate() {
        let _ = write!(s, "\n{}. {}: {}", i + 1, step.category, step.action);
    }
    if let Some(doc) = &d.documentation {
        let _ = write!(s, "\nDocumentation: {}", doc);
    }
    s
}

/// Escalation notice: carries the full segment instead of resolution steps.
fn escalation(segment: &IntentSegment, d: &Diagnosis) -> AgentResponse {
    let mut s = format!(
        "Error {} ({}) is a {}-severity issue, so I've escalated it to a support engineer instead of suggesting a fix.\nEscalation details:\n- Request: \"{}\"\n- Error code: {}",
        d.code, d.name, d.severity, segment.span, d.code
    );
    for (k, v) in segment.slots.iter().filter(|(k, _)| k.as_str() != slots::ERROR_CODE) {
        let _ = write!(s, "\n- {}: {}", k, v);
    }
    AgentResponse::new(segment, ResponseStatus::Escalated, s)
        .with_confidence(0.9)
        .with_follow_up("A support engineer will contact you shortly. Please avoid retrying the failing operation until then.")
        .with_entity(EntityKind::ErrorCode, d.code.clone())
}

fn documented(hit: &ScoredPassage) -> String {
    format!(
        "From \"{}\":\n{}",
        hit.passage.title,
        passage_excerpt(&hit.passage.text)
    )
}

#[async_trait]
impl Agent for TechnicalSupportAgent {
    fn category(&self) -> Category {
        Category::TechnicalSupport
    }

    async fn handle(
        &self,
        segment: &IntentSegment,
        context: &ConversationContext,
    ) -> Result<AgentResponse, AgentError> {
        let code = segment
            .slot(slots::ERROR_CODE)
            .map(str::to_string)
            .or_else(|| context.entity(EntityKind::ErrorCode).map(str::to_string));
        match code {
            Some(code) => self.diagnose(segment, &code.to_ascii_uppercase()).await,
            None => self.symptom_search(segment).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StubDiagnosticApi;
    use crate::agents::test_support::{kb, lexical, segment};

    struct Down;

    #[async_trait]
    impl DiagnosticApi for Down {
        async fn get_diagnostics(&self, _code: &str) -> Result<Diagnosis, AdapterError> {
            Err(AdapterError::Unavailable("connection refused".to_string()))
        }
    }

    fn agent(diagnostics: Arc<dyn DiagnosticApi>) -> TechnicalSupportAgent {
        let kb = kb();
        TechnicalSupportAgent::new(diagnostics, lexical(&kb), Severity::Critical, 3)
    }

    fn stub() -> TechnicalSupportAgent {
        agent(Arc::new(StubDiagnosticApi::new(kb())))
    }

    #[tokio::test]
    async fn error_code_gets_all_steps_in_order() {
        let seg = segment(
            Category::TechnicalSupport,
            "I'm getting error E5678 when deploying a container. How do I fix this?",
            &[(slots::ERROR_CODE, "E5678")],
        );
        let r = stub().handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Resolved);
        let order: Vec<usize> = ["Image integrity", "Signature", "Policy", "Registry authentication"]
            .iter()
            .map(|c| r.body.find(c).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{}", r.body);
        assert_eq!(r.entities.get(&EntityKind::ErrorCode).map(String::as_str), Some("E5678"));
    }

    #[tokio::test]
    async fn critical_code_is_escalated_with_the_request() {
        let seg = segment(
            Category::TechnicalSupport,
            "Dashboard shows E9012 everywhere",
            &[(slots::ERROR_CODE, "E9012")],
        );
        let r = stub().handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Escalated);
        assert!(r.body.contains("Dashboard shows E9012 everywhere"));
        assert!(!r.body.contains("Resolution steps"));
    }

    #[tokio::test]
    async fn unknown_code_is_not_found_and_asks_for_details() {
        let seg = segment(Category::TechnicalSupport, "error E4242", &[(slots::ERROR_CODE, "E4242")]);
        let r = stub().handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::NotFound);
        assert!(r.follow_up.is_some());
        assert!(r.rejected.contains(&EntityKind::ErrorCode));
    }

    #[tokio::test]
    async fn code_comes_from_context_when_not_repeated() {
        let mut ctx = ConversationContext::new("c");
        ctx.entities.insert(EntityKind::ErrorCode, "E1234".to_string());
        let seg = segment(Category::TechnicalSupport, "How do I fix it?", &[]);
        let r = stub().handle(&seg, &ctx).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Resolved);
        assert!(r.body.contains("API Connection Failure"));
    }

    #[tokio::test]
    async fn symptom_without_code_searches_guides() {
        let seg = segment(Category::TechnicalSupport, "My deployment is stuck in pending", &[]);
        let r = stub().handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Resolved);
        assert!(r.body.to_lowercase().contains("pending"));
    }

    #[tokio::test]
    async fn unavailable_diagnostics_fall_back_to_documentation() {
        let seg = segment(
            Category::TechnicalSupport,
            "error E5678 on deploy",
            &[(slots::ERROR_CODE, "E5678")],
        );
        let r = agent(Arc::new(Down)).handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Resolved);
        assert!(r.body.contains("temporarily unavailable"));
    }
}
