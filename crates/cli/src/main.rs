use clap::{Parser, Subcommand};
use concierge::gateway::TurnReply;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Parser)]
#[command(name = "concierge")]
#[command(about = "Concierge customer support orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config, knowledge corpus, stub adapter fixtures).
    Init {
        /// Config file path (default: CONCIERGE_CONFIG_PATH or ~/.concierge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (HTTP query API + WebSocket). Requires `concierge init` first.
    Gateway {
        /// Config file path (default: CONCIERGE_CONFIG_PATH or ~/.concierge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 8000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat with support via a running gateway (interactive).
    Chat {
        /// Config file path (default: CONCIERGE_CONFIG_PATH or ~/.concierge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Optional existing conversation id to continue.
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,
    },

    /// Answer one question in-process, without a gateway.
    Ask {
        /// Config file path (default: CONCIERGE_CONFIG_PATH or ~/.concierge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Print the full reply as JSON (parts, statuses, context token).
        #[arg(long)]
        json: bool,

        /// The customer question.
        #[arg(required = true)]
        text: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("concierge {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, conversation }) => {
            if let Err(e) = run_chat(config, conversation).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Ask { config, json, text }) => {
            if let Err(e) = run_ask(config, json, text.join(" ")).await {
                log::error!("ask failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(concierge::config::default_config_path);
    let dir = concierge::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = concierge::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    concierge::gateway::run_gateway(config, path).await
}

async fn run_ask(config_path: Option<std::path::PathBuf>, json: bool, text: String) -> anyhow::Result<()> {
    let (config, path) = concierge::config::load_config(config_path)?;
    let orchestrator = concierge::orchestrator::Orchestrator::from_config(&config, &path).await?;
    let reply = orchestrator.handle_turn(None, &text).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&TurnReply::from(reply))?);
    } else {
        println!("{}", reply.text.trim());
    }
    Ok(())
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    conversation: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let (config, _) = concierge::config::load_config(config_path)?;
    let mut ws = connect(&config).await?;
    let mut current = conversation;
    let mut next_id = 2u64;
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/new") {
            current = None;
            println!("(new conversation)");
            continue;
        }

        let id = next_id.to_string();
        next_id += 1;
        match turn(&mut ws, &id, current.as_deref(), input).await {
            Ok(reply) => {
                current = Some(reply.conversation_id);
                println!("< {}", reply.reply.trim());
            }
            Err(e) => {
                eprintln!("chat error: {}", e);
                if matches!(e, ChatError::Closed) {
                    break;
                }
            }
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}

#[derive(Debug)]
enum ChatError {
    Closed,
    Gateway(String),
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::Closed => f.write_str("gateway closed the connection"),
            ChatError::Gateway(e) => f.write_str(e),
        }
    }
}

/// Open the WebSocket and complete the connect handshake.
async fn connect(config: &concierge::config::Config) -> anyhow::Result<Socket> {
    let bind = config.gateway.bind.trim();
    let ws_url = format!("ws://{}:{}/ws", bind, config.gateway.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| anyhow::anyhow!("connecting to {}: {} (is `concierge gateway` running?)", ws_url, e))?;

    let mut params = serde_json::json!({
        "minProtocol": 1,
        "maxProtocol": 1,
        "client": { "id": "concierge-cli", "version": env!("CARGO_PKG_VERSION"), "platform": std::env::consts::OS },
    });
    if let Some(token) = concierge::config::resolve_gateway_token(config) {
        params["auth"] = serde_json::json!({ "token": token });
    }
    let connect_req = serde_json::json!({
        "type": "req",
        "id": "1",
        "method": "connect",
        "params": params
    });
    ws.send(Message::Text(connect_req.to_string())).await?;
    await_response(&mut ws, "1")
        .await
        .map_err(|e| anyhow::anyhow!("connect failed: {}", e))?;
    Ok(ws)
}

async fn turn(ws: &mut Socket, id: &str, conversation: Option<&str>, text: &str) -> Result<TurnReply, ChatError> {
    let mut params = serde_json::json!({ "text": text });
    if let Some(c) = conversation {
        params["conversationId"] = serde_json::Value::String(c.to_string());
    }
    let req = serde_json::json!({
        "type": "req",
        "id": id,
        "method": "turn",
        "params": params
    });
    ws.send(Message::Text(req.to_string()))
        .await
        .map_err(|_| ChatError::Closed)?;
    let payload = await_response(ws, id).await?;
    serde_json::from_value(payload).map_err(|e| ChatError::Gateway(format!("malformed turn reply: {}", e)))
}

/// Read frames until the response with `id`; events are skipped, shutdown closes the chat.
async fn await_response(ws: &mut Socket, id: &str) -> Result<serde_json::Value, ChatError> {
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|_| ChatError::Closed)?;
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        match frame.get("type").and_then(|v| v.as_str()) {
            Some("event") => {
                if frame.get("event").and_then(|v| v.as_str()) == Some("shutdown") {
                    return Err(ChatError::Closed);
                }
            }
            Some("res") if frame.get("id").and_then(|v| v.as_str()) == Some(id) => {
                if !frame.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
                    let err = frame
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("request failed");
                    return Err(ChatError::Gateway(err.to_string()));
                }
                return Ok(frame.get("payload").cloned().unwrap_or_default());
            }
            _ => {}
        }
    }
    Err(ChatError::Closed)
}
