//! JWT (JSON Web Token) handling

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::{AuthError, AuthValidator, Identity};

fn default_tier() -> String {
    "free".to_string()
}

/// JWT claims for relay authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Custom: plan tier
    #[serde(default = "default_tier")]
    pub tier: String,
    /// Custom: granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl JwtClaims {
    pub fn new(user_id: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: user_id,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
            tier: default_tier(),
            scopes: Vec::new(),
        }
    }

    pub fn with_tier(mut self, tier: String) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,
}

/// JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a new JWT validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates signature and expiration only, unless an issuer or audience
    /// is configured with [`with_issuer`](Self::with_issuer) /
    /// [`with_audience`](Self::with_audience).
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Create a new JWT validator using RSA public key (asymmetric)
    ///
    /// The public key should be in PEM format (begins with "-----BEGIN PUBLIC KEY-----")
    pub fn from_rsa_pem(public_key_pem: &[u8]) -> Result<Self, JwtError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Ok(Self {
            decoding_key: DecodingKey::from_rsa_pem(public_key_pem)?,
            validation,
        })
    }

    /// Require `aud` to match; without this the claim is not checked
    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate_claims(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let token_data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[async_trait]
impl AuthValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.validate_claims(token).map_err(|e| match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::EncodingError(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            },
        })?;

        Ok(Identity::new(claims.sub)
            .with_tier(claims.tier)
            .with_scopes(claims.scopes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    #[test]
    fn test_jwt_encode_decode() {
        let claims = JwtClaims::new(
            "alice".to_string(),
            "test-issuer".to_string(),
            "test-audience".to_string(),
            Duration::hours(1),
        );

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET)
            .with_issuer("test-issuer".to_string())
            .with_audience("test-audience".to_string());

        let decoded = validator.validate_claims(&token).unwrap();

        assert_eq!(decoded.sub, claims.sub);
        assert_eq!(decoded.iss, claims.iss);
        assert_eq!(decoded.aud, claims.aud);
        assert_eq!(decoded.tier, "free");
    }

    #[tokio::test]
    async fn test_validator_maps_claims_to_identity() {
        let claims = JwtClaims::new(
            "bob".to_string(),
            "issuer".to_string(),
            "audience".to_string(),
            Duration::hours(1),
        )
        .with_tier("pro".to_string())
        .with_scopes(vec!["tunnel".to_string(), "proxy".to_string()]);

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let validator = JwtValidator::new(TEST_SECRET);

        let identity = AuthValidator::validate(&validator, &token).await.unwrap();
        assert_eq!(identity.user_id, "bob");
        assert_eq!(identity.tier, "pro");
        assert!(identity.has_scope("proxy"));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let claims = JwtClaims::new(
            "carol".to_string(),
            "issuer".to_string(),
            "audience".to_string(),
            Duration::seconds(-120), // Already expired, beyond default leeway
        );

        assert!(claims.is_expired());

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let validator = JwtValidator::new(TEST_SECRET);

        let err = AuthValidator::validate(&validator, &token).await.unwrap_err();
        assert_eq!(err, AuthError::TokenExpired);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_invalid() {
        let claims = JwtClaims::new(
            "dave".to_string(),
            "issuer".to_string(),
            "audience".to_string(),
            Duration::hours(1),
        );

        let token = JwtValidator::encode(b"other-secret", &claims).unwrap();
        let validator = JwtValidator::new(TEST_SECRET);

        let err = AuthValidator::validate(&validator, &token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn test_issuer_mismatch_rejected() {
        let claims = JwtClaims::new(
            "erin".to_string(),
            "someone-else".to_string(),
            "audience".to_string(),
            Duration::hours(1),
        );

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let validator = JwtValidator::new(TEST_SECRET).with_issuer("llm-relay".to_string());

        assert!(validator.validate_claims(&token).is_err());
    }

    #[test]
    fn test_audience_mismatch_rejected() {
        let claims = JwtClaims::new(
            "frank".to_string(),
            "llm-relay".to_string(),
            "someone-else".to_string(),
            Duration::hours(1),
        );

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let validator = JwtValidator::new(TEST_SECRET).with_audience("llm-relay".to_string());

        let err = validator.validate_claims(&token).unwrap_err();
        assert!(matches!(
            err,
            JwtError::EncodingError(ref e)
                if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::InvalidAudience)
        ));
    }

    #[tokio::test]
    async fn test_audience_mismatch_fails_authentication() {
        let claims = JwtClaims::new(
            "frank".to_string(),
            "llm-relay".to_string(),
            "someone-else".to_string(),
            Duration::hours(1),
        );

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let validator = JwtValidator::new(TEST_SECRET).with_audience("llm-relay".to_string());

        let err = AuthValidator::validate(&validator, &token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }
}
