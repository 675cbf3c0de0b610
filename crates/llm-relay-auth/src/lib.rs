//! Authentication for the relay
//!
//! The relay never issues identities itself; it validates the bearer tokens it
//! is handed through the [`AuthValidator`] trait. [`JwtValidator`] is the
//! default implementation for HMAC or RSA signed tokens.

pub mod jwt;
pub mod validator;

pub use jwt::{JwtClaims, JwtError, JwtValidator};
pub use validator::{AuthError, AuthValidator, Identity, StaticTokenValidator, SCOPE_TUNNEL};

#[cfg(any(test, feature = "mock"))]
pub use validator::MockAuthValidator;

// Re-export useful types
pub use async_trait::async_trait;
