//! Bearer ID token to session conversion.
//!
//! Requests that carry an `Authorization: Bearer <id_token>` header skip the
//! cookie entirely. [`TokenToSession`] verifies the token through an injected
//! [`IdTokenVerifier`] (signature and issuer checks live outside this crate)
//! and maps the verified claims into a [`SessionState`].
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use chrono::{Duration, Utc};
//! use gatekeeper_session::token::{IdTokenVerifier, TokenError, TokenToSession, VerifiedToken};
//!
//! struct Trusting;
//!
//! #[async_trait]
//! impl IdTokenVerifier for Trusting {
//!     async fn verify(&self, _raw: &str) -> Result<VerifiedToken, TokenError> {
//!         Ok(VerifiedToken {
//!             claims: serde_json::json!({ "sub": "1234", "email": "jane@example.com" }),
//!             expiry: Utc::now() + Duration::hours(1),
//!         })
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let session = TokenToSession::new(Trusting).convert("raw.jwt.value").await.unwrap();
//! assert_eq!(session.email, "jane@example.com");
//! assert_eq!(session.user, "1234");
//! # });
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::session::SessionState;

/// Errors raised while turning a bearer token into a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The verifier rejected the token.
    #[error("token verification failed: {0}")]
    Verify(String),

    /// The verified claims have an unexpected shape.
    #[error("failed to parse bearer token claims: {0}")]
    Claims(String),

    /// The token asserts that its email address is unverified.
    #[error("email in id_token ({0}) isn't verified")]
    UnverifiedEmail(String),
}

/// Output of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// The token's claim set.
    pub claims: Value,
    /// The token's `exp` as an instant.
    pub expiry: DateTime<Utc>,
}

/// Verifies raw ID tokens.
#[async_trait]
pub trait IdTokenVerifier: Send + Sync {
    /// Checks signature, issuer and audience, returning the claims.
    async fn verify(&self, raw: &str) -> Result<VerifiedToken, TokenError>;
}

#[derive(Debug, Default, Deserialize)]
struct IdTokenClaims {
    #[serde(rename = "sub", default)]
    subject: String,
    #[serde(default)]
    email: String,
    #[serde(rename = "email_verified", default)]
    verified: Option<bool>,
    #[serde(default)]
    preferred_username: String,
}

/// Converts verified bearer ID tokens into sessions.
#[derive(Debug)]
pub struct TokenToSession<V> {
    verifier: V,
    clock: Clock,
}

impl<V: IdTokenVerifier> TokenToSession<V> {
    /// Creates a converter around `verifier`.
    pub fn new(verifier: V) -> Self {
        Self {
            verifier,
            clock: Clock::system(),
        }
    }

    /// Sets the clock attached to produced sessions.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Verifies `raw` and builds a session from its claims.
    ///
    /// The raw token becomes both the access and the ID token. There is no
    /// refresh token. An empty `email` claim falls back to the subject.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Verify`] when the verifier rejects the token
    /// - [`TokenError::Claims`] when the claims cannot be read
    /// - [`TokenError::UnverifiedEmail`] when `email_verified` is `false`
    pub async fn convert(&self, raw: &str) -> Result<SessionState, TokenError> {
        let verified = self.verifier.verify(raw).await?;

        let mut claims: IdTokenClaims = serde_json::from_value(verified.claims)
            .map_err(|e| TokenError::Claims(e.to_string()))?;

        if claims.email.is_empty() {
            claims.email = claims.subject.clone();
        }

        if claims.verified == Some(false) {
            debug!("Rejected bearer token with unverified email");
            return Err(TokenError::UnverifiedEmail(claims.email));
        }

        let mut session = SessionState::default().with_clock(self.clock.clone());
        session.email = claims.email;
        session.user = claims.subject;
        session.preferred_username = claims.preferred_username;
        session.access_token = raw.to_string();
        session.id_token = raw.to_string();
        session.set_expires_on(verified.expiry);

        debug!(user = %session.user, "Converted bearer token to session");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    const RAW: &str = "header.payload.signature";

    struct StaticVerifier {
        claims: Value,
    }

    #[async_trait]
    impl IdTokenVerifier for StaticVerifier {
        async fn verify(&self, raw: &str) -> Result<VerifiedToken, TokenError> {
            if raw != RAW {
                return Err(TokenError::Verify("bad signature".to_string()));
            }
            Ok(VerifiedToken {
                claims: self.claims.clone(),
                expiry: expiry(),
            })
        }
    }

    fn expiry() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2031, 7, 4, 10, 0, 0).unwrap()
    }

    fn converter(claims: Value) -> TokenToSession<StaticVerifier> {
        TokenToSession::new(StaticVerifier { claims })
    }

    #[tokio::test]
    async fn convert_maps_claims() {
        let session = converter(json!({
            "sub": "123456789",
            "email": "john@example.com",
            "email_verified": true,
            "preferred_username": "John"
        }))
        .convert(RAW)
        .await
        .unwrap();

        assert_eq!(session.email, "john@example.com");
        assert_eq!(session.user, "123456789");
        assert_eq!(session.preferred_username, "John");
        assert_eq!(session.access_token, RAW);
        assert_eq!(session.id_token, RAW);
        assert_eq!(session.refresh_token, "");
        assert_eq!(session.expires_on, Some(expiry()));
    }

    #[tokio::test]
    async fn missing_email_falls_back_to_subject() {
        let session = converter(json!({ "sub": "123456789" }))
            .convert(RAW)
            .await
            .unwrap();
        assert_eq!(session.email, "123456789");
        assert_eq!(session.user, "123456789");
    }

    #[tokio::test]
    async fn missing_verified_claim_is_accepted() {
        let session = converter(json!({ "sub": "s", "email": "a@b.c" }))
            .convert(RAW)
            .await;
        assert!(session.is_ok());
    }

    #[tokio::test]
    async fn unverified_email_is_rejected() {
        let err = converter(json!({
            "sub": "123456789",
            "email": "john@example.com",
            "email_verified": false
        }))
        .convert(RAW)
        .await
        .unwrap_err();

        assert_eq!(err, TokenError::UnverifiedEmail("john@example.com".to_string()));
        assert_eq!(
            err.to_string(),
            "email in id_token (john@example.com) isn't verified"
        );
    }

    #[tokio::test]
    async fn verifier_rejection_is_propagated() {
        let result = converter(json!({ "sub": "s" })).convert("forged").await;
        assert_eq!(result.unwrap_err(), TokenError::Verify("bad signature".to_string()));
    }

    #[tokio::test]
    async fn malformed_claims_are_rejected() {
        let result = converter(json!({ "sub": 42 })).convert(RAW).await;
        assert!(matches!(result, Err(TokenError::Claims(_))));
    }

    #[tokio::test]
    async fn produced_session_uses_converter_clock() {
        let clock = Clock::mocked(expiry() + Duration::seconds(1));
        let session = converter(json!({ "sub": "s" }))
            .with_clock(clock)
            .convert(RAW)
            .await
            .unwrap();
        assert!(session.is_expired());
    }
}
