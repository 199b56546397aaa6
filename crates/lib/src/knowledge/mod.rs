//! Knowledge store: read-only product catalog, error-code documentation and guides.
//!
//! The corpus is loaded from the config directory's `knowledge` root (plus any extra dirs) or
//! from the copy bundled into the binary. Agents query it through [`KnowledgeStore`].

mod catalog;
mod loader;
mod search;

pub use catalog::{Addon, Catalog, Feature, Price, Product};
pub use loader::{load_knowledge, BUNDLED_KNOWLEDGE};
pub use search::{EmbeddingIndex, LexicalIndex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::llm::InferenceError;

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("knowledge search needs embeddings: {0}")]
    Inference(#[from] InferenceError),
    #[error("invalid knowledge document {path}: {message}")]
    Document { path: String, message: String },
}

/// Named subsets of the corpus, one per kind of question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Products,
    Technical,
    Billing,
    Account,
}

/// Issue severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One documented resolution step: a category (e.g. "Signature") and what to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStep {
    pub category: String,
    pub action: String,
}

/// Documentation for one error code (from `errors/<CODE>.md`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodeDoc {
    pub code: String,
    pub title: String,
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub causes: Vec<String>,
    #[serde(default)]
    pub steps: Vec<ResolutionStep>,
    #[serde(default)]
    pub documentation: Option<String>,
    /// Markdown after the frontmatter.
    #[serde(skip)]
    pub body: String,
}

/// A searchable chunk of the corpus.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub id: String,
    pub collection: Collection,
    pub title: String,
    pub text: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}

/// The loaded corpus: catalog, error codes, and passages for search.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    pub catalog: Catalog,
    /// Keyed by upper-case code (e.g. "E5678").
    pub error_codes: BTreeMap<String, ErrorCodeDoc>,
    /// Guide passages (from `docs/`). Catalog and error-code passages come from [`Self::passages`].
    pub guides: Vec<Passage>,
}

impl KnowledgeBase {
    /// Parse the corpus bundled into the crate.
    pub fn bundled() -> Result<Self, KnowledgeError> {
        loader::load_bundled()
    }

    pub fn error_code(&self, code: &str) -> Option<&ErrorCodeDoc> {
        self.error_codes.get(&code.trim().to_ascii_uppercase())
    }

    /// All passages: one per product and add-on, one per error code, then guide sections.
    pub fn passages(&self) -> Vec<Passage> {
        let mut out = self.catalog.passages();
        for doc in self.error_codes.values() {
            let mut text = format!("{}: {}", doc.code, doc.title);
            if !doc.body.trim().is_empty() {
                text.push_str("\n");
                text.push_str(doc.body.trim());
            }
            for cause in &doc.causes {
                text.push_str("\nCause: ");
                text.push_str(cause);
            }
            for step in &doc.steps {
                text.push_str(&format!("\n{}: {}", step.category, step.action));
            }
            let mut tags = doc.tags.clone();
            tags.push(doc.code.to_ascii_lowercase());
            out.push(Passage {
                id: format!("error-{}", doc.code.to_ascii_lowercase()),
                collection: Collection::Technical,
                title: doc.title.clone(),
                text,
                tags,
            });
        }
        out.extend(self.guides.iter().cloned());
        out
    }
}

/// Read-only search over the corpus.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Best `top_k` passages of `collection` for `query`, most relevant first. Empty when nothing matches.
    async fn search(
        &self,
        collection: Collection,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>, KnowledgeError>;
}
