//! Account API client: subscription plan, status and users of a customer account.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::orders::{display_status, parse_date};
use super::{AccountId, AdapterError, HttpUpstream};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountUser {
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    pub account_id: String,
    pub name: String,
    /// Catalog product id of the subscribed plan (e.g. "cm-pro").
    pub plan: String,
    pub status: String,
    pub renewal_date: Option<NaiveDate>,
    pub auto_renew: Option<bool>,
    pub payment_method: Option<String>,
    pub users: Vec<AccountUser>,
}

#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn get_account(&self, id: &AccountId) -> Result<Account, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
struct RawSubscription {
    plan: String,
    #[serde(default)]
    status: String,
    renewal_date: Option<String>,
    auto_renew: Option<bool>,
    payment_method: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawUser {
    email: String,
    #[serde(default)]
    role: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawAccount {
    account_id: String,
    #[serde(default)]
    name: String,
    subscription: RawSubscription,
    #[serde(default)]
    users: Vec<RawUser>,
}

impl RawAccount {
    fn normalize(self) -> Account {
        Account {
            account_id: self.account_id.trim().to_ascii_uppercase(),
            name: self.name,
            plan: self.subscription.plan.trim().to_lowercase(),
            status: display_status(&self.subscription.status),
            renewal_date: parse_date(self.subscription.renewal_date.as_deref()),
            auto_renew: self.subscription.auto_renew,
            payment_method: self
                .subscription
                .payment_method
                .map(|m| display_status(&m).to_lowercase()),
            users: self
                .users
                .into_iter()
                .map(|u| AccountUser {
                    email: u.email,
                    role: u.role.replace('_', " "),
                })
                .collect(),
        }
    }
}

/// Account API over a fixture map keyed by account id.
pub struct StubAccountApi {
    accounts: HashMap<String, RawAccount>,
}

impl StubAccountApi {
    pub fn from_json(json: &str) -> Result<Self> {
        let accounts: HashMap<String, RawAccount> = serde_json::from_str(json)?;
        Ok(Self {
            accounts: accounts
                .into_iter()
                .map(|(k, v)| (k.to_ascii_uppercase(), v))
                .collect(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading account fixtures {}", path.display()))?;
        Self::from_json(&s).with_context(|| format!("parsing account fixtures {}", path.display()))
    }
}

#[async_trait]
impl AccountApi for StubAccountApi {
    async fn get_account(&self, id: &AccountId) -> Result<Account, AdapterError> {
        self.accounts
            .get(id.as_str())
            .cloned()
            .map(RawAccount::normalize)
            .ok_or_else(|| AdapterError::NotFound(format!("account {}", id)))
    }
}

/// Live Account API: `GET {base}/accounts/{id}`.
pub struct HttpAccountApi {
    upstream: HttpUpstream,
}

impl HttpAccountApi {
    pub fn new(upstream: HttpUpstream) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl AccountApi for HttpAccountApi {
    async fn get_account(&self, id: &AccountId) -> Result<Account, AdapterError> {
        let raw: RawAccount = self
            .upstream
            .get_json(&format!("accounts/{}", id), &format!("account {}", id))
            .await?;
        Ok(raw.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_account_is_normalized() {
        let api = StubAccountApi::from_json(
            r#"{ "ACC-1111": {
                "account_id": "ACC-1111", "name": "Acme Corp",
                "subscription": { "plan": "CM-Pro", "status": "active", "renewal_date": "2024-01-15",
                                  "payment_method": "credit_card", "auto_renew": true },
                "users": [{ "email": "a@x", "role": "security_admin" }]
            } }"#,
        )
        .unwrap();
        let account = api.get_account(&AccountId::parse("ACC-1111").unwrap()).await.unwrap();
        assert_eq!(account.plan, "cm-pro");
        assert_eq!(account.status, "Active");
        assert_eq!(account.payment_method.as_deref(), Some("credit card"));
        assert_eq!(account.users[0].role, "security admin");
        assert_eq!(account.renewal_date, NaiveDate::from_ymd_opt(2024, 1, 15));
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let api = StubAccountApi::from_json("{}").unwrap();
        let err = api.get_account(&AccountId::parse("ACC-9999").unwrap()).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotFound(_)));
    }
}
