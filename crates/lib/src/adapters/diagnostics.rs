//! Diagnostic API client: causes and resolution steps for an error code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{AdapterError, HttpUpstream};
use crate::knowledge::{KnowledgeBase, ResolutionStep, Severity};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub code: String,
    pub name: String,
    pub severity: Severity,
    pub causes: Vec<String>,
    /// In documented order.
    pub steps: Vec<ResolutionStep>,
    pub documentation: Option<String>,
}

#[async_trait]
pub trait DiagnosticApi: Send + Sync {
    async fn get_diagnostics(&self, code: &str) -> Result<Diagnosis, AdapterError>;
}

/// Diagnostics answered from the documentation set's error-code pages.
pub struct StubDiagnosticApi {
    kb: Arc<KnowledgeBase>,
}

impl StubDiagnosticApi {
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        Self { kb }
    }
}

#[async_trait]
impl DiagnosticApi for StubDiagnosticApi {
    async fn get_diagnostics(&self, code: &str) -> Result<Diagnosis, AdapterError> {
        let doc = self
            .kb
            .error_code(code)
            .ok_or_else(|| AdapterError::NotFound(format!("error code {}", code)))?;
        Ok(Diagnosis {
            code: doc.code.clone(),
            name: doc.title.clone(),
            severity: doc.severity,
            causes: doc.causes.clone(),
            steps: doc.steps.clone(),
            documentation: doc.documentation.clone(),
        })
    }
}

/// Steps arrive either structured or as bare strings (older upstream versions).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawStep {
    Structured { category: String, action: String },
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
struct RawDiagnosis {
    #[serde(alias = "issue_id")]
    code: String,
    name: String,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    causes: Vec<String>,
    #[serde(default, alias = "solutions")]
    steps: Vec<RawStep>,
    #[serde(default, alias = "documentation_link")]
    documentation: Option<String>,
}

impl RawDiagnosis {
    fn normalize(self, requested: &str) -> Result<Diagnosis, AdapterError> {
        let code = self.code.trim().to_ascii_uppercase();
        // Upstream answers unknown codes with a generic "unknown" record instead of a 404.
        if code == "UNKNOWN" || code.is_empty() {
            return Err(AdapterError::NotFound(format!("error code {}", requested)));
        }
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, s)| match s {
                RawStep::Structured { category, action } => ResolutionStep { category, action },
                RawStep::Text(action) => ResolutionStep {
                    category: format!("Step {}", i + 1),
                    action,
                },
            })
            .collect();
        Ok(Diagnosis {
            code,
            name: self.name,
            severity: self.severity.unwrap_or(Severity::Medium),
            causes: self.causes,
            steps,
            documentation: self.documentation,
        })
    }
}

/// Live Diagnostic API: `GET {base}/diagnostics/{code}`.
pub struct HttpDiagnosticApi {
    upstream: HttpUpstream,
}

impl HttpDiagnosticApi {
    pub fn new(upstream: HttpUpstream) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl DiagnosticApi for HttpDiagnosticApi {
    async fn get_diagnostics(&self, code: &str) -> Result<Diagnosis, AdapterError> {
        let code = code.trim().to_ascii_uppercase();
        let raw: RawDiagnosis = self
            .upstream
            .get_json(&format!("diagnostics/{}", code), &format!("diagnostics for {}", code))
            .await?;
        raw.normalize(&code)
    }
}
