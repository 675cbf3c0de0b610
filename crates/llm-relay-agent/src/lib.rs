//! Local agent for llm-relay
//!
//! Runs next to the user's model server. It dials the relay over WebSocket,
//! keeps the tunnel alive, and turns every `Request` envelope into an HTTP
//! call against the local upstream.

pub mod agent;
pub mod forwarder;
pub mod websocket;

pub use agent::{Agent, AgentConfig, AgentError, LinkOutcome};
pub use forwarder::{ForwardError, UpstreamForwarder};
