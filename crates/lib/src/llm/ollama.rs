//! Ollama API client (http://127.0.0.1:11434 by default).
//! Uses /api/generate for completions and /api/embeddings for vectors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{CompletionOptions, Inference, InferenceError};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "gemma3:1b";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    embedding_model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                log::warn!("ollama: no model configured, using {}", DEFAULT_MODEL);
                DEFAULT_MODEL.to_string()
            });
        Self {
            base_url,
            embedding_model: model.clone(),
            model,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Use a different model for embeddings than for completions.
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.embedding_model = model.trim().to_string();
        }
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// GET /api/tags: list available models.
    pub async fn list_models(&self) -> Result<Vec<OllamaModel>, InferenceError> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(InferenceError::Api(format!("{} {}", status, body)));
        }
        let data: TagsResponse = res.json().await?;
        Ok(data.models.unwrap_or_default())
    }

    /// POST /api/generate: non-streaming completion.
    pub async fn generate(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, InferenceError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system: options.system.as_deref(),
            stream: false,
            options: GenerateOptions::from(options),
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(InferenceError::Api(format!("{} {}", status, body)));
        }
        let data: GenerateResponse = res.json().await?;
        Ok(data.response)
    }

    /// POST /api/embeddings: embedding vector for one text.
    pub async fn embeddings(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = EmbeddingsRequest {
            model: &self.embedding_model,
            prompt: text,
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(InferenceError::Api(format!("{} {}", status, body)));
        }
        let data: EmbeddingsResponse = res.json().await?;
        if data.embedding.is_empty() {
            return Err(InferenceError::Empty(format!(
                "model {} returned an empty embedding",
                self.embedding_model
            )));
        }
        Ok(data.embedding)
    }
}

#[async_trait]
impl Inference for OllamaClient {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, InferenceError> {
        log::debug!("ollama: generate with model {}", self.model);
        self.generate(prompt, options).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
        self.embeddings(text).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaModel {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Option<Vec<OllamaModel>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "num_predict", skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl From<&CompletionOptions> for GenerateOptions {
    fn from(o: &CompletionOptions) -> Self {
        Self {
            temperature: o.temperature,
            num_predict: o.max_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = OllamaClient::new(Some("http://localhost:11434/".into()), Some("qwen3:8b".into()));
        assert_eq!(c.base_url, "http://localhost:11434");
        assert_eq!(c.model(), "qwen3:8b");
        assert_eq!(c.embedding_model, "qwen3:8b");
    }

    #[test]
    fn generate_request_omits_unset_options() {
        let opts = CompletionOptions::default();
        let req = GenerateRequest {
            model: "m",
            prompt: "p",
            system: None,
            stream: false,
            options: GenerateOptions::from(&opts),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("system").is_none());
        assert_eq!(v["options"], serde_json::json!({}));
    }
}
