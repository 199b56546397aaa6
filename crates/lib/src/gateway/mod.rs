//! Gateway: HTTP + WebSocket front door for the orchestrator.
//!
//! Single port serves HTTP and WebSocket. WebSocket protocol: first frame must be `connect`;
//! then `turn`, `health` and `status` requests (req/res) and server events.

mod protocol;
mod server;

pub use protocol::{
    ConnectAuth, ConnectClient, ConnectParams, HelloOk, HelloPolicy, TurnParams, TurnPart, TurnReply, WsRequest,
    WsResponse,
};
pub use server::{app, run_gateway, GatewayState};
