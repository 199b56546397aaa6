//! Product information from the catalog and the products collection.
//!
//! The extractive answer is always built first. With a composer configured, a generated answer
//! replaces it only when every number it contains also appears in the grounding text.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use super::{lookup, Agent, AgentError, AgentResponse, ResponseStatus};
use crate::knowledge::{Collection, KnowledgeBase, KnowledgeStore, ScoredPassage};
use crate::llm::{CompletionOptions, Inference};
use crate::orchestrator::{ConversationContext, EntityKind};
use crate::router::{slots, Category, IntentSegment};

static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:[.,]\d+)*").expect("number pattern"));

const COMPOSER_SYSTEM: &str = "You are a customer support assistant for CloudManager. Answer the \
customer's question using only the facts provided. Do not invent prices, limits or features. \
Keep the answer under 120 words.";

pub struct ProductAgent {
    kb: Arc<KnowledgeBase>,
    store: Arc<dyn KnowledgeStore>,
    composer: Option<Arc<dyn Inference>>,
    top_k: usize,
}

impl ProductAgent {
    pub fn new(kb: Arc<KnowledgeBase>, store: Arc<dyn KnowledgeStore>, top_k: usize) -> Self {
        Self {
            kb,
            store,
            composer: None,
            top_k,
        }
    }

    pub fn with_composer(mut self, inference: Arc<dyn Inference>) -> Self {
        self.composer = Some(inference);
        self
    }

    /// Catalog facts for a product or add-on id.
    fn facts(&self, id: &str) -> Option<String> {
        if let Some(p) = self.kb.catalog.product(id) {
            let mut s = format!(
                "{} costs ${:.2} per month or ${:.2} per year.",
                p.name, p.price.monthly, p.price.annual
            );
            match p.user_limit {
                Some(n) => {
                    let _ = write!(s, " It includes up to {} users.", n);
                }
                None => s.push_str(" It includes unlimited users."),
            }
            if !p.features.is_empty() {
                let names: Vec<&str> = p.features.iter().map(|f| f.name.as_str()).collect();
                let _ = write!(s, "\nFeatures: {}.", names.join(", "));
            }
            if !p.limitations.is_empty() {
                let _ = write!(s, "\nLimitations: {}.", p.limitations.join(", "));
            }
            return Some(s);
        }
        self.kb.catalog.addon(id).map(|a| {
            format!(
                "The {} add-on costs ${:.2} per month. {}",
                a.name, a.price, a.description
            )
        })
    }

    fn extractive(&self, facts: Option<&str>, related: &[&ScoredPassage]) -> String {
        let mut s = String::new();
        if let Some(f) = facts {
            s.push_str(f);
        }
        for hit in related {
            if !s.is_empty() {
                s.push_str("\n\n");
            }
            s.push_str(&hit.passage.text);
        }
        s
    }

    async fn compose(&self, segment: &IntentSegment, grounding: &str) -> Option<String> {
        let inference = self.composer.as_ref()?;
        let prompt = format!(
            "FACTS:\n{}\n\nCUSTOMER QUESTION: {}\n\nANSWER:",
            grounding, segment.span
        );
        let options = CompletionOptions {
            temperature: Some(0.2),
            max_tokens: Some(300),
            ..CompletionOptions::with_system(COMPOSER_SYSTEM)
        };
        match inference.complete(&prompt, &options).await {
            Ok(text) if !text.trim().is_empty() && numbers_grounded(&text, grounding) => {
                Some(text.trim().to_string())
            }
            Ok(_) => {
                log::debug!("composed product answer rejected: ungrounded numbers");
                None
            }
            Err(e) => {
                log::debug!("product answer composition failed: {}", e);
                None
            }
        }
    }
}

/// Number tokens with thousands separators removed and trailing zero decimals dropped, so
/// "1,499.99" and "1499.99" or "$20" and "20.00" compare equal.
fn numbers(text: &str) -> HashSet<String> {
    NUMBER
        .find_iter(text)
        .map(|m| {
            let mut n = m.as_str().replace(',', "");
            if n.contains('.') {
                n = n.trim_end_matches('0').trim_end_matches('.').to_string();
            }
            n
        })
        .collect()
}

/// True when every number in `answer` also occurs in `grounding`.
pub(crate) fn numbers_grounded(answer: &str, grounding: &str) -> bool {
    let known = numbers(grounding);
    numbers(answer).iter().all(|n| known.contains(n))
}

#[async_trait]
impl Agent for ProductAgent {
    fn category(&self) -> Category {
        Category::Product
    }

    async fn handle(
        &self,
        segment: &IntentSegment,
        context: &ConversationContext,
    ) -> Result<AgentResponse, AgentError> {
        let product = segment
            .slot(slots::PRODUCT)
            .or_else(|| context.entity(EntityKind::Product))
            .map(str::to_string);
        let facts = product.as_deref().and_then(|id| self.facts(id));
        let hits = lookup(self.store.as_ref(), Collection::Products, &segment.span, self.top_k).await?;
        // Catalog facts already cover the named product's own passage.
        let own_ids: Vec<String> = product
            .iter()
            .flat_map(|id| [format!("product-{}", id), format!("addon-{}", id)])
            .collect();
        let related: Vec<&ScoredPassage> = hits
            .iter()
            .filter(|h| !own_ids.contains(&h.passage.id))
            .take(if facts.is_some() { 1 } else { self.top_k })
            .collect();

        if facts.is_none() && related.is_empty() {
            return Ok(AgentResponse::new(
                segment,
                ResponseStatus::CapabilityGap,
                "I couldn't find product information matching your question.",
            )
            .with_confidence(0.2)
            .with_capability("product information")
            .with_follow_up("Could you tell me which plan or add-on you're asking about?"));
        }

        let extractive = self.extractive(facts.as_deref(), &related);
        let body = match self.compose(segment, &extractive).await {
            Some(composed) => composed,
            None => extractive,
        };
        let mut response = AgentResponse::new(segment, ResponseStatus::Resolved, body)
            .with_confidence(if facts.is_some() { 0.9 } else { 0.6 });
        if let (Some(id), Some(_)) = (product, facts.as_ref()) {
            response = response.with_entity(EntityKind::Product, id);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::{kb, lexical, segment};
    use crate::llm::InferenceError;

    struct Canned(&'static str);

    #[async_trait]
    impl Inference for Canned {
        async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String, InferenceError> {
            Ok(self.0.to_string())
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, InferenceError> {
            Err(InferenceError::Empty("no embeddings".to_string()))
        }
    }

    fn agent() -> ProductAgent {
        let kb = kb();
        let store = lexical(&kb);
        ProductAgent::new(kb, store, 3)
    }

    #[tokio::test]
    async fn named_product_gets_catalog_prices() {
        let seg = segment(
            Category::Product,
            "How much is CloudManager Pro?",
            &[(slots::PRODUCT, "cm-pro")],
        );
        let r = agent().handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::Resolved);
        assert!(r.body.contains("$149.99 per month"));
        assert!(r.body.contains("up to 20 users"));
        assert_eq!(r.entities.get(&EntityKind::Product).map(String::as_str), Some("cm-pro"));
    }

    #[tokio::test]
    async fn plan_from_context_answers_that_plan() {
        let mut ctx = ConversationContext::new("c");
        ctx.entities.insert(EntityKind::Product, "cm-enterprise".to_string());
        let seg = segment(Category::Product, "What features does that plan include?", &[]);
        let r = agent().handle(&seg, &ctx).await.unwrap();
        assert!(r.body.contains("Compliance reporting"));
    }

    #[tokio::test]
    async fn nothing_matching_is_a_capability_gap() {
        let seg = segment(Category::Product, "zzz qqq", &[]);
        let r = agent().handle(&seg, &ConversationContext::new("c")).await.unwrap();
        assert_eq!(r.status, ResponseStatus::CapabilityGap);
        assert_eq!(r.capability.as_deref(), Some("product information"));
    }

    #[tokio::test]
    async fn composed_answer_with_invented_price_is_discarded() {
        let seg = segment(Category::Product, "price of the pro plan", &[(slots::PRODUCT, "cm-pro")]);
        let r = agent()
            .with_composer(Arc::new(Canned("Pro is only $99.00 a month!")))
            .handle(&seg, &ConversationContext::new("c"))
            .await
            .unwrap();
        assert!(r.body.contains("$149.99"));
        assert!(!r.body.contains("99.00"));
    }

    #[tokio::test]
    async fn grounded_composed_answer_is_used() {
        let seg = segment(Category::Product, "price of the pro plan", &[(slots::PRODUCT, "cm-pro")]);
        let r = agent()
            .with_composer(Arc::new(Canned("CloudManager Pro is $149.99 monthly for up to 20 users.")))
            .handle(&seg, &ConversationContext::new("c"))
            .await
            .unwrap();
        assert_eq!(r.body, "CloudManager Pro is $149.99 monthly for up to 20 users.");
    }

    #[test]
    fn number_grounding_ignores_formatting() {
        assert!(numbers_grounded("costs 1,499.99 a year", "$1499.99 per year"));
        assert!(numbers_grounded("$20", "20.00"));
        assert!(!numbers_grounded("costs 1,599.99", "$1499.99 per year"));
        assert!(numbers_grounded("no numbers here", ""));
    }
}
