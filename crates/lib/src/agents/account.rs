//! Account management: plan, users and seats via the Account API, plus the account guides.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;

use super::{lookup, passage_excerpt, Agent, AgentError, AgentResponse, ResponseStatus};
use crate::adapters::{Account, AccountApi, AccountId, AdapterError};
use crate::knowledge::{Collection, KnowledgeBase, KnowledgeStore};
use crate::orchestrator::{ConversationContext, EntityKind};
use crate::router::{slots, Category, IntentSegment};

const ACCOUNT_CAPABILITY: &str = "account lookup";

pub struct AccountAgent {
    accounts: Arc<dyn AccountApi>,
    kb: Arc<KnowledgeBase>,
    store: Arc<dyn KnowledgeStore>,
    top_k: usize,
}

impl AccountAgent {
    pub fn new(
        accounts: Arc<dyn AccountApi>,
        kb: Arc<KnowledgeBase>,
        store: Arc<dyn KnowledgeStore>,
        top_k: usize,
    ) -> Self {
        Self {
            accounts,
            kb,
            store,
            top_k,
        }
    }

    fn summary(&self, account: &Account) -> String {
        let plan = self.kb.catalog.product(&account.plan);
        let plan_name = plan.map(|p| p.name.as_str()).unwrap_or(account.plan.as_str());
        let mut s = format!(
            "Account {} ({}) is on {} with status {}.",
            account.account_id, account.name, plan_name, account.status
        );
        if let Some(d) = account.renewal_date {
            let renew = match account.auto_renew {
                Some(false) => "expires",
                _ => "renews",
            };
            let _ = write!(s, " The subscription {} on {}.", renew, d);
        }
        let users = account.users.len() as u32;
        let _ = write!(s, " It has {} user{}", users, if users == 1 { "" } else { "s" });
        match plan.map(|p| p.user_limit) {
            Some(Some(limit)) if users <= limit => {
                let _ = write!(s, "; {} of {} seats are available.", limit - users, limit);
            }
            Some(Some(limit)) => {
                let _ = write!(s, ", which is {} over the plan limit of {}.", users - limit, limit);
            }
            Some(None) => s.push_str("; the plan has no user limit."),
            None => s.push('.'),
        }
        s
    }

    async fn guide(&self, segment: &IntentSegment) -> Result<Option<String>, AgentError> {
        let hits = lookup(self.store.as_ref(), Collection::Account, &segment.span, self.top_k).await?;
        Ok(hits
            .first()
            .map(|best| format!("{}: {}", best.passage.title, passage_excerpt(&best.passage.text))))
    }

    async fn account(&self, segment: &IntentSegment, id: AccountId) -> Result<AgentResponse, AgentError> {
        let response = match self.accounts.get_account(&id).await {
            Ok(account) => {
                let mut body = self.summary(&account);
                if let Some(guide) = self.guide(segment).await? {
                    body.push('\n');
                    body.push_str(&guide);
                }
                let mut r = AgentResponse::new(segment, ResponseStatus::Resolved, body)
                    .with_confidence(0.9)
                    .with_entity(EntityKind::AccountId, id.as_str());
                if self.kb.catalog.product(&account.plan).is_some() {
                    r = r.with_entity(EntityKind::Product, account.plan);
                }
                r
            }
            Err(AdapterError::NotFound(_)) => AgentResponse::new(
                segment,
                ResponseStatus::NotFound,
                format!("I couldn't find an account with id {}.", id),
            )
            .with_confidence(0.8)
            .with_follow_up("Could you double-check the account id? It's shown under Admin > Account.")
            .rejecting(EntityKind::AccountId),
            Err(AdapterError::Unauthorized(_)) => AgentResponse::new(
                segment,
                ResponseStatus::Unavailable,
                format!("I'm not permitted to look up account {} with the current credentials.", id),
            )
            .with_confidence(0.0)
            .with_capability(ACCOUNT_CAPABILITY)
            .with_entity(EntityKind::AccountId, id.as_str()),
            Err(AdapterError::Unavailable(e)) => {
                log::warn!("account lookup for {} unavailable: {}", id, e);
                AgentResponse::new(
                    segment,
                    ResponseStatus::Unavailable,
                    format!(
                        "Account lookup is temporarily unavailable, so I can't check {} right now. Please try again in a few minutes.",
                        id
                    ),
                )
                .with_confidence(0.0)
                .with_capability(ACCOUNT_CAPABILITY)
                .with_entity(EntityKind::AccountId, id.as_str())
            }
        };
        Ok(response)
    }
}

#[async_trait]
impl Agent for AccountAgent {
    fn category(&self) -> Category {
        Category::AccountManagement
    }

    async fn handle(
        &self,
        segment: &IntentSegment,
        context: &ConversationContext,
    ) -> Result<AgentResponse, AgentError> {
        if let Some(raw) = segment.slot(slots::ACCOUNT_ID) {
            return match AccountId::parse(raw) {
                Ok(id) => self.account(segment, id).await,
                Err(e) => Ok(AgentResponse::new(
                    segment,
                    ResponseStatus::InvalidIdentifier,
                    format!("\"{}\" doesn't look like an account id (expected {}).", e.value, e.expected),
                )
                .with_confidence(0.9)
                .with_follow_up("Could you double-check the account id?")
                .rejecting(EntityKind::AccountId)),
            };
        }
        if let Some(Ok(id)) = context.entity(EntityKind::AccountId).map(AccountId::parse) {
            return self.account(segment, id).await;
        }
        Ok(match self.guide(segment).await? {
            Some(guide) => AgentResponse::new(segment, ResponseStatus::Resolved, guide)
                .with_confidence(0.6)
                .with_follow_up("If you share your account id (for example ACC-1111), I can check your plan and seats."),
            None => AgentResponse::new(
                segment,
                ResponseStatus::NeedsInput,
                "I can help with users, seats, roles and your subscription.",
            )
            .with_confidence(0.3)
            .with_follow_up("Could you share your account id (for example ACC-1111)?"),
        })
    }
}
