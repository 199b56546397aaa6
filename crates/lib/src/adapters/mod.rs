//! External API adapters: typed clients for the order, account and diagnostic services.
//!
//! Each client has a stub implementation (bundled fixtures or the documentation set) and an
//! HTTP implementation; [`Adapters::from_config`] picks one per `adapters.mode`. Upstream
//! payload quirks are normalized here so agents only ever see [`Order`], [`Account`] and
//! [`Diagnosis`].

mod accounts;
mod diagnostics;
mod ids;
mod orders;

pub use accounts::{Account, AccountApi, AccountUser, HttpAccountApi, StubAccountApi};
pub use diagnostics::{Diagnosis, DiagnosticApi, HttpDiagnosticApi, StubDiagnosticApi};
pub use ids::{AccountId, InvalidIdentifier, OrderId, TicketId};
pub use orders::{HttpOrderApi, Money, Order, OrderApi, OrderItem, StubOrderApi};

use anyhow::{Context, Result};
use include_dir::{include_dir, Dir};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{self, AdapterMode, Config};
use crate::knowledge::KnowledgeBase;

/// Stub fixtures shipped with the crate; `init` extracts them next to the config file.
pub static BUNDLED_FIXTURES: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/config/fixtures");

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("not authorized to access {0}")]
    Unauthorized(String),
    #[error("{0}")]
    Unavailable(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Unavailable(_))
    }
}

/// Adapter-local timeout and retry settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on each attempt, not on the whole call.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        let backoff = Duration::from_millis(config.adapters.backoff_ms);
        Self {
            max_retries: config.adapters.max_retries,
            initial_backoff: backoff,
            max_backoff: backoff.saturating_mul(8),
            request_timeout: Duration::from_millis(config.adapters.request_timeout_ms),
        }
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or retries are exhausted.
/// Each attempt is bounded by `policy.request_timeout`; a timed-out attempt counts as unavailable.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut call: F) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut delay = policy.initial_backoff;
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(policy.request_timeout, call()).await {
            Ok(r) => r,
            Err(_) => Err(AdapterError::Unavailable(format!(
                "{} timed out after {:?}",
                what, policy.request_timeout
            ))),
        };
        match outcome {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                log::debug!("{} failed ({}), retry {}/{} in {:?}", what, e, attempt, policy.max_retries, delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_backoff);
            }
            other => return other,
        }
    }
}

/// Shared HTTP plumbing for the live clients: base URL, bearer token, status mapping, retries.
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    policy: RetryPolicy,
}

impl HttpUpstream {
    pub fn new(base_url: impl Into<String>, token: Option<String>, policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            policy,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path` and decode JSON, retrying only on unavailability.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T, AdapterError> {
        with_retry(&self.policy, what, move || self.get_once(path, what)).await
    }

    async fn get_once<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T, AdapterError> {
        let url = self.url(path);
        let mut req = self.client.get(&url);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        let res = req
            .send()
            .await
            .map_err(|e| AdapterError::Unavailable(format!("{} request failed: {}", what, e)))?;
        let status = res.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AdapterError::NotFound(what.to_string()));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AdapterError::Unauthorized(what.to_string()));
        }
        if !status.is_success() {
            return Err(AdapterError::Unavailable(format!("{} returned {}", what, status)));
        }
        res.json::<T>()
            .await
            .map_err(|e| AdapterError::Unavailable(format!("malformed {} payload: {}", what, e)))
    }
}

/// The adapter set handed to agents.
#[derive(Clone)]
pub struct Adapters {
    pub orders: Arc<dyn OrderApi>,
    pub accounts: Arc<dyn AccountApi>,
    pub diagnostics: Arc<dyn DiagnosticApi>,
}

impl Adapters {
    /// Stub adapters over the bundled fixtures and the given documentation set.
    pub fn bundled_stubs(kb: Arc<KnowledgeBase>) -> Result<Self> {
        let orders = BUNDLED_FIXTURES
            .get_file("orders.json")
            .and_then(|f| f.contents_utf8())
            .context("bundled fixtures missing orders.json")?;
        let accounts = BUNDLED_FIXTURES
            .get_file("accounts.json")
            .and_then(|f| f.contents_utf8())
            .context("bundled fixtures missing accounts.json")?;
        Ok(Self {
            orders: Arc::new(StubOrderApi::from_json(orders).context("parsing bundled orders.json")?),
            accounts: Arc::new(
                StubAccountApi::from_json(accounts).context("parsing bundled accounts.json")?,
            ),
            diagnostics: Arc::new(StubDiagnosticApi::new(kb)),
        })
    }

    /// Build the adapter set for `adapters.mode`. Stub mode reads fixtures from the fixtures
    /// directory when present, otherwise the bundled copies.
    pub fn from_config(config: &Config, config_path: &Path, kb: Arc<KnowledgeBase>) -> Result<Self> {
        match config.adapters.mode {
            AdapterMode::Stub => {
                let dir = config::resolve_fixtures_dir(config, config_path);
                if !dir.exists() {
                    log::info!("fixtures directory {} not found; using bundled fixtures", dir.display());
                    return Self::bundled_stubs(kb);
                }
                let orders = StubOrderApi::load(&dir.join("orders.json"))?;
                let accounts = StubAccountApi::load(&dir.join("accounts.json"))?;
                log::info!("stub adapters loaded from {}", dir.display());
                Ok(Self {
                    orders: Arc::new(orders),
                    accounts: Arc::new(accounts),
                    diagnostics: Arc::new(StubDiagnosticApi::new(kb)),
                })
            }
            AdapterMode::Live => {
                let upstream = HttpUpstream::new(
                    config.adapters.base_url.clone(),
                    config::resolve_api_token(config),
                    RetryPolicy::from_config(config),
                );
                log::info!("live adapters using {}", config.adapters.base_url);
                Ok(Self {
                    orders: Arc::new(HttpOrderApi::new(upstream.clone())),
                    accounts: Arc::new(HttpAccountApi::new(upstream.clone())),
                    diagnostics: Arc::new(HttpDiagnosticApi::new(upstream)),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            request_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn retries_unavailable_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(&fast_policy(3), "order", move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(AdapterError::Unavailable("down".to_string()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_and_unauthorized_are_not_retried() {
        for err in [
            AdapterError::NotFound("order".to_string()),
            AdapterError::Unauthorized("order".to_string()),
        ] {
            let calls = AtomicU32::new(0);
            let counter = &calls;
            let template = &err;
            let result: Result<(), _> = with_retry(&fast_policy(3), "order", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let err = template.clone();
                async move { Err(err) }
            })
            .await;
            assert_eq!(result, Err(err));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&fast_policy(2), "order", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::Unavailable("down".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(AdapterError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_attempt_times_out_as_unavailable() {
        let result: Result<(), _> = with_retry(&fast_policy(0), "diagnostics", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(AdapterError::Unavailable(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn upstream_url_joins_without_double_slash() {
        let up = HttpUpstream::new("http://localhost:8080/api/", None, RetryPolicy::default());
        assert_eq!(up.url("/orders/ORD-1234"), "http://localhost:8080/api/orders/ORD-1234");
    }

    #[test]
    fn bundled_stubs_build() {
        let kb = Arc::new(KnowledgeBase::bundled().unwrap());
        assert!(Adapters::bundled_stubs(kb).is_ok());
    }
}
