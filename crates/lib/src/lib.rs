//! Concierge core library: intent routing, specialist support agents, external adapters,
//! the knowledge store and the orchestrator, plus the gateway that serves them.

pub mod adapters;
pub mod agents;
pub mod config;
pub mod gateway;
pub mod init;
pub mod knowledge;
pub mod llm;
pub mod orchestrator;
pub mod router;
