//! Relay server
//!
//! Puts the tunnel core behind HTTP: agents dial `GET /v1/tunnel` and hold a
//! WebSocket open, callers hit `/v1/users/{user_id}/proxy/{*path}` and get the
//! agent's buffered response or an RFC 9457 problem.
//!
//! # Example
//!
//! ```no_run
//! use llm_relay_server::{jwt_validator, RelayConfig, RelayServer};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RelayConfig::load("relay.yaml".as_ref())?;
//! let auth = Arc::new(jwt_validator(&config.auth)?);
//! RelayServer::new(&config, auth)?
//!     .run(CancellationToken::new())
//!     .await
//! # }
//! ```

pub mod config;
pub mod problem;
pub mod relay;
pub mod routes;
pub mod server;
mod tunnel_ws;
pub mod watcher;

pub use config::{ConfigError, RelayConfig};
pub use problem::{problem_response, status_for, ApiError};
pub use relay::{ProxyCall, Readiness, Relay};
pub use routes::{router, AppState, PRIORITY_HEADER, SCOPE_ADMIN, TIMEOUT_HEADER};
pub use server::{jwt_validator, RelayServer};
pub use watcher::{ConfigWatcher, DEFAULT_POLL_INTERVAL};
