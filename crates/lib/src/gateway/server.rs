//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, AdapterMode, Config, InferenceBackend};
use crate::gateway::protocol::{
    ConnectParams, HelloOk, HelloPolicy, TurnParams, TurnReply, WsRequest, WsResponse,
};
use crate::init;
use crate::llm::{OllamaClient, OllamaModel};
use crate::orchestrator::Orchestrator;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// When auth mode is token and a token is configured, returns it for connect validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway (config, orchestrator, events).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, WebSocket connect and `POST /api/query` must present this token.
    pub required_token: Option<String>,
    /// Broadcasts events to connected clients (e.g. shutdown). Subscribers receive JSON event frames.
    pub event_tx: broadcast::Sender<String>,
    pub orchestrator: Arc<Orchestrator>,
    /// Ollama models discovered at startup (or soon after). Empty if Ollama unreachable or unused.
    pub ollama_models: Arc<tokio::sync::RwLock<Vec<OllamaModel>>>,
}

impl GatewayState {
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            required_token: require_connect_token(&config),
            config: Arc::new(config),
            event_tx,
            orchestrator,
            ollama_models: Arc::new(tokio::sync::RwLock::new(Vec::new())),
        }
    }

    async fn status_payload(&self) -> serde_json::Value {
        let auth_mode = if self.required_token.is_some() {
            "token"
        } else {
            "none"
        };
        let inference = match self.config.inference.backend {
            InferenceBackend::None => "none",
            InferenceBackend::Ollama => "ollama",
        };
        let adapters = match self.config.adapters.mode {
            AdapterMode::Stub => "stub",
            AdapterMode::Live => "live",
        };
        let ollama_models = self.ollama_models.read().await.clone();
        json!({
            "runtime": "running",
            "protocol": PROTOCOL_VERSION,
            "port": self.config.gateway.port,
            "bind": self.config.gateway.bind,
            "auth": auth_mode,
            "inference": inference,
            "model": self.config.inference.model,
            "ollamaModels": ollama_models,
            "adapters": adapters,
            "knowledgeSearch": self.config.knowledge.search,
            "conversations": self.orchestrator.store().len().await,
            "turnTimeoutMs": self.config.orchestrator.turn_timeout_ms,
            "date": chrono::Local::now().format("%Y-%m-%d").to_string(),
        })
    }
}

/// Routes served by the gateway.
pub fn app(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .route("/api/query", post(query_http))
        .with_state(state)
}

pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path, &config)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or CONCIERGE_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let orchestrator = Arc::new(
        Orchestrator::from_config(&config, &config_path)
            .await
            .context("building orchestrator")?,
    );
    let sweeper = orchestrator
        .store()
        .clone()
        .spawn_sweeper(Duration::from_secs(config.orchestrator.sweep_interval_secs));
    let state = GatewayState::new(config.clone(), orchestrator);

    if config.inference.backend == InferenceBackend::Ollama {
        let ollama = OllamaClient::new(
            config::resolve_inference_base_url(&config),
            config.inference.model.clone(),
        );
        let models = state.ollama_models.clone();
        tokio::spawn(async move {
            match ollama.list_models().await {
                Ok(list) => {
                    *models.write().await = list;
                    log::info!("ollama model discovery completed");
                }
                Err(e) => {
                    log::debug!("ollama model discovery failed: {}", e);
                }
            }
        });
    } else {
        log::debug!("ollama model discovery skipped (inference backend is none)");
    }

    let event_tx = state.event_tx.clone();
    let app = app(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited");
    sweeper.abort();
    served?;
    log::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal(event_tx: broadcast::Sender<String>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");
    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
    }))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(json!({ "error": message.into() })))
}

/// POST /api/query: `{ conversationId?, text }` → one orchestrated turn.
async fn query_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Some(ref required) = state.required_token {
        match bearer_token(&headers) {
            Some(t) if t == required => {}
            Some(_) => return error_body(StatusCode::UNAUTHORIZED, "unauthorized: gateway token mismatch"),
            None => return error_body(StatusCode::UNAUTHORIZED, "unauthorized: gateway token missing"),
        }
    }
    let params: TurnParams = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("invalid query body: {}", e)),
    };
    let reply = TurnReply::from(
        state
            .orchestrator
            .handle_turn(params.conversation_id.as_deref(), &params.text)
            .await,
    );
    match serde_json::to_value(&reply) {
        Ok(v) => (StatusCode::OK, Json(v)),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /ws upgrades to WebSocket. First frame must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn check_connect_token(state: &GatewayState, params: &ConnectParams) -> Result<(), &'static str> {
    let Some(ref required) = state.required_token else {
        return Ok(());
    };
    let provided = params.auth.token.as_deref().unwrap_or("").trim();
    if provided.is_empty() {
        return Err("unauthorized: gateway token missing (set CONCIERGE_GATEWAY_TOKEN or gateway.auth.token)");
    }
    if provided != required {
        return Err("unauthorized: gateway token mismatch");
    }
    Ok(())
}

/// Highest protocol both sides speak; an error when the client's range excludes ours.
fn negotiate_protocol(params: &ConnectParams) -> Result<u32, String> {
    let min = params.min_protocol.unwrap_or(1);
    let max = params.max_protocol.unwrap_or(PROTOCOL_VERSION);
    if min > PROTOCOL_VERSION || max < min {
        return Err(format!(
            "unsupported protocol range {}..={} (server speaks {})",
            min, max, PROTOCOL_VERSION
        ));
    }
    Ok(max.min(PROTOCOL_VERSION))
}

async fn send_json(socket: &mut WebSocket, res: &WsResponse) -> bool {
    socket
        .send(Message::Text(serde_json::to_string(res).unwrap_or_default()))
        .await
        .is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut sent_hello = false;
    let mut event_rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };

                if req.typ != "req" {
                    continue;
                }
                if !sent_hello && req.method != "connect" {
                    let _ = send_json(&mut socket, &WsResponse::err(&req.id, "connect required first")).await;
                    continue;
                }

                match req.method.as_str() {
                    "connect" => {
                        let params: ConnectParams = match serde_json::from_value(req.params.clone()) {
                            Ok(p) => p,
                            Err(_) => {
                                let _ = send_json(&mut socket, &WsResponse::err(&req.id, "invalid connect params")).await;
                                continue;
                            }
                        };
                        if let Err(e) = check_connect_token(&state, &params) {
                            let _ = send_json(&mut socket, &WsResponse::err(&req.id, e)).await;
                            continue;
                        }
                        let protocol = match negotiate_protocol(&params) {
                            Ok(p) => p,
                            Err(e) => {
                                let _ = send_json(&mut socket, &WsResponse::err(&req.id, e)).await;
                                continue;
                            }
                        };
                        log::info!(
                            "ws client connected: id={} version={} platform={} protocol={}",
                            params.client.id.as_deref().unwrap_or("unknown"),
                            params.client.version.as_deref().unwrap_or("-"),
                            params.client.platform.as_deref().unwrap_or("-"),
                            protocol
                        );
                        let hello = HelloOk {
                            typ: "hello-ok".to_string(),
                            protocol,
                            policy: Some(HelloPolicy {
                                tick_interval_ms: Some(15_000),
                                turn_timeout_ms: Some(state.config.orchestrator.turn_timeout_ms),
                            }),
                        };
                        let res = WsResponse::ok(&req.id, serde_json::to_value(&hello).unwrap_or(json!({})));
                        if send_json(&mut socket, &res).await {
                            sent_hello = true;
                        }
                    }
                    "health" => {
                        let payload = json!({
                            "runtime": "running",
                            "protocol": PROTOCOL_VERSION,
                        });
                        let _ = send_json(&mut socket, &WsResponse::ok(&req.id, payload)).await;
                    }
                    "status" => {
                        let payload = state.status_payload().await;
                        let _ = send_json(&mut socket, &WsResponse::ok(&req.id, payload)).await;
                    }
                    "turn" => {
                        let params: TurnParams = match serde_json::from_value(req.params.clone()) {
                            Ok(p) => p,
                            Err(_) => {
                                let _ = send_json(&mut socket, &WsResponse::err(&req.id, "invalid turn params")).await;
                                continue;
                            }
                        };
                        let reply = TurnReply::from(
                            state
                                .orchestrator
                                .handle_turn(params.conversation_id.as_deref(), &params.text)
                                .await,
                        );
                        let res = match serde_json::to_value(&reply) {
                            Ok(payload) => WsResponse::ok(&req.id, payload),
                            Err(e) => WsResponse::err(&req.id, e.to_string()),
                        };
                        let _ = send_json(&mut socket, &res).await;
                    }
                    _ => {
                        let res = WsResponse::err(&req.id, format!("unknown method: {}", req.method));
                        let _ = send_json(&mut socket, &res).await;
                    }
                }
            }
        }
    }

    if !sent_hello {
        log::debug!("ws client disconnected before sending connect");
    }
}
