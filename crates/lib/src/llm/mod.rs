//! Inference capability: text completion and embeddings behind a backend-agnostic trait.
//!
//! Agents and the router only see [`Inference`]; request/response shapes of a backend stay
//! inside its client module.

mod ollama;

pub use ollama::{OllamaClient, OllamaModel};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("inference api error: {0}")]
    Api(String),
    #[error("inference backend returned no usable output: {0}")]
    Empty(String),
}

/// Options for one completion call. Unset fields use the backend's defaults.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// System prompt prepended by the backend.
    pub system: Option<String>,
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens.
    pub max_tokens: Option<u32>,
}

impl CompletionOptions {
    pub fn with_system(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            ..Self::default()
        }
    }
}

/// Text completion and embedding service.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, InferenceError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, InferenceError>;
}
