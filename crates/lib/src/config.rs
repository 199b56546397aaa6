//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.concierge/config.json`) and environment.
//! Every section has defaults so an empty `{}` file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::knowledge::Severity;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Inference backend (text completion and embeddings).
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Router thresholds and fallback.
    #[serde(default)]
    pub router: RouterConfig,

    /// Turn timeout and conversation lifecycle.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Specialist agent tuning.
    #[serde(default)]
    pub agents: AgentsConfig,

    /// External order/account/diagnostic API adapters.
    #[serde(default)]
    pub adapters: AdaptersConfig,

    /// Knowledge corpus location and search mode.
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 8000).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require a bearer/connect token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret. Overridden by CONCIERGE_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require the configured token on every request and WebSocket connect.
    Token,
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Which inference backend agents may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    /// No generation; agents answer extractively from the knowledge store and adapters.
    #[default]
    None,
    /// Local Ollama server.
    Ollama,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    #[serde(default)]
    pub backend: InferenceBackend,
    /// Base URL of the backend. Overridden by OLLAMA_BASE_URL env.
    pub base_url: Option<String>,
    /// Model name exactly as listed by the backend (e.g. "gemma3:1b").
    pub model: Option<String>,
    /// Embedding model; falls back to `model` when unset.
    pub embedding_model: Option<String>,
    /// When true, the product agent asks the model to phrase answers (numbers are still checked against the corpus).
    #[serde(default)]
    pub compose_answers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Minimum keyword score for a clause to be assigned a category.
    #[serde(default = "default_min_score")]
    pub min_score: u32,
    /// Ask the inference backend to classify inquiries the keyword router leaves ambiguous.
    #[serde(default)]
    pub llm_fallback: bool,
    /// Minimum confidence reported by the model for the fallback classification to be used.
    #[serde(default = "default_llm_min_confidence")]
    pub llm_min_confidence: f32,
}

fn default_min_score() -> u32 {
    1
}

fn default_llm_min_confidence() -> f32 {
    0.7
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            llm_fallback: false,
            llm_min_confidence: default_llm_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Deadline for all segment work in one turn.
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    /// Idle time after which a conversation context is evicted.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// How often the gateway sweeps expired conversations.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Turns kept per conversation; older turns are dropped (entities are kept).
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_turn_timeout_ms() -> u64 {
    10_000
}

fn default_session_timeout_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_history() -> usize {
    50
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            turn_timeout_ms: default_turn_timeout_ms(),
            session_timeout_secs: default_session_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_history: default_max_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    /// Issues at or above this severity are escalated instead of resolved.
    #[serde(default = "default_escalation_severity")]
    pub escalation_severity: Severity,
    /// Passages retrieved per knowledge search.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_escalation_severity() -> Severity {
    Severity::Critical
}

fn default_top_k() -> usize {
    3
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            escalation_severity: default_escalation_severity(),
            top_k: default_top_k(),
        }
    }
}

/// Stub adapters answer from bundled fixtures; live adapters call the HTTP APIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    #[default]
    Stub,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptersConfig {
    #[serde(default)]
    pub mode: AdapterMode,
    /// Base URL of the order/account/diagnostic API (live mode).
    #[serde(default = "default_adapters_base_url")]
    pub base_url: String,
    /// Bearer token for the upstream API. Overridden by CONCIERGE_API_TOKEN env.
    pub token: Option<String>,
    /// Per-attempt request timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retries after the first attempt, only for unavailable upstreams.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Fixture directory for stub mode. Default: `fixtures` next to the config file.
    pub fixtures: Option<PathBuf>,
}

fn default_adapters_base_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}

fn default_request_timeout_ms() -> u64 {
    3_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    200
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            mode: AdapterMode::Stub,
            base_url: default_adapters_base_url(),
            token: None,
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            fixtures: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Term-overlap scoring; no backend needed.
    #[default]
    Lexical,
    /// Cosine similarity over embeddings from the inference backend.
    Embedding,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeConfig {
    /// Override the knowledge root. Relative paths are resolved against the config file's parent.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Extra knowledge directories; documents here override the root by id.
    #[serde(default)]
    pub extra_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub search: SearchMode,
}

fn env_override(var: &str) -> Option<String> {
    std::env::var(var).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the gateway token: env CONCIERGE_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_override("CONCIERGE_GATEWAY_TOKEN").or_else(|| trimmed(config.gateway.auth.token.as_ref()))
}

/// Resolve the upstream API token: env CONCIERGE_API_TOKEN overrides config.
pub fn resolve_api_token(config: &Config) -> Option<String> {
    env_override("CONCIERGE_API_TOKEN").or_else(|| trimmed(config.adapters.token.as_ref()))
}

/// Resolve the inference base URL: env OLLAMA_BASE_URL overrides config. None means the client default.
pub fn resolve_inference_base_url(config: &Config) -> Option<String> {
    env_override("OLLAMA_BASE_URL").or_else(|| trimmed(config.inference.base_url.as_ref()))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CONCIERGE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".concierge").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or CONCIERGE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn resolve_against(config_path: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        config_parent(config_path).join(dir)
    }
}

/// Default knowledge root when no override is set: `knowledge` subdirectory of the config file's parent.
pub fn knowledge_dir(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("knowledge")
}

/// Resolve the primary knowledge root: `config.knowledge.directory` if set, otherwise the default.
pub fn resolve_knowledge_dir(config: &Config, config_path: &Path) -> PathBuf {
    match &config.knowledge.directory {
        Some(d) if !d.as_os_str().is_empty() => resolve_against(config_path, d),
        _ => knowledge_dir(config_path),
    }
}

/// Extra knowledge dirs, resolved against the config file's parent.
pub fn resolve_knowledge_extra_dirs(config: &Config, config_path: &Path) -> Vec<PathBuf> {
    config
        .knowledge
        .extra_dirs
        .iter()
        .map(|d| resolve_against(config_path, d))
        .collect()
}

/// Resolve the stub fixture directory: `adapters.fixtures` if set, otherwise `fixtures` next to the config file.
pub fn resolve_fixtures_dir(config: &Config, config_path: &Path) -> PathBuf {
    match &config.adapters.fixtures {
        Some(d) if !d.as_os_str().is_empty() => resolve_against(config_path, d),
        _ => config_parent(config_path).join("fixtures"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 8000);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn empty_json_uses_section_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.orchestrator.turn_timeout_ms, 10_000);
        assert_eq!(config.agents.escalation_severity, Severity::Critical);
        assert_eq!(config.adapters.mode, AdapterMode::Stub);
        assert_eq!(config.inference.backend, InferenceBackend::None);
        assert_eq!(config.knowledge.search, SearchMode::Lexical);
    }

    #[test]
    fn camel_case_keys_parse() {
        let config: Config = serde_json::from_str(
            r#"{
                "orchestrator": { "turnTimeoutMs": 250 },
                "agents": { "escalationSeverity": "high" },
                "adapters": { "mode": "live", "maxRetries": 0 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.turn_timeout_ms, 250);
        assert_eq!(config.agents.escalation_severity, Severity::High);
        assert_eq!(config.adapters.mode, AdapterMode::Live);
        assert_eq!(config.adapters.max_retries, 0);
        assert_eq!(config.adapters.backoff_ms, 200);
    }

    #[test]
    fn resolve_knowledge_dir_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.concierge/config.json");
        assert_eq!(
            resolve_knowledge_dir(&config, path),
            PathBuf::from("/home/user/.concierge/knowledge")
        );
    }

    #[test]
    fn resolve_knowledge_dir_override_relative() {
        let mut config = Config::default();
        config.knowledge.directory = Some(PathBuf::from("custom/kb"));
        let path = Path::new("/home/user/.concierge/config.json");
        assert_eq!(
            resolve_knowledge_dir(&config, path),
            PathBuf::from("/home/user/.concierge/custom/kb")
        );
    }

    #[test]
    fn resolve_fixtures_dir_override_absolute() {
        let mut config = Config::default();
        config.adapters.fixtures = Some(PathBuf::from("/srv/fixtures"));
        let path = Path::new("/home/user/.concierge/config.json");
        assert_eq!(
            resolve_fixtures_dir(&config, path),
            PathBuf::from("/srv/fixtures")
        );
    }
}
