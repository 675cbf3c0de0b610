//! Authentication validator trait for the external identity collaborator
//!
//! The identity service resolves a bearer token to a user id, a plan tier and
//! a set of scopes. Implement [`AuthValidator`] to plug in any strategy (JWT,
//! API keys, a remote introspection endpoint, ...).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Scope required to hold a tunnel open
pub const SCOPE_TUNNEL: &str = "tunnel";

/// Validated identity returned by the identity collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User ID (tunnel ownership and rate-limit key)
    pub user_id: String,

    /// Plan tier (e.g. "free", "pro")
    pub tier: String,

    /// Granted scopes (empty = all allowed)
    pub scopes: Vec<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: "free".to_string(),
            scopes: Vec::new(),
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = tier.into();
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Check if a scope is granted
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }
}

/// Authentication errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Missing scope: {0}")]
    MissingScope(String),

    #[error("Identity service unavailable: {0}")]
    Unavailable(String),
}

/// Authentication validator trait
///
/// # Example: API Key Validator
///
/// ```ignore
/// struct ApiKeyValidator {
///     keys: HashMap<String, Identity>,
/// }
///
/// #[async_trait]
/// impl AuthValidator for ApiKeyValidator {
///     async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
///         self.keys
///             .get(token)
///             .cloned()
///             .ok_or_else(|| AuthError::InvalidToken("Unknown API key".to_string()))
///     }
/// }
/// ```
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Validate a bearer token and return the authenticated identity
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token table, handy for development relays and tests
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl AuthValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("Unknown token".to_string()))
    }
}
