//! Error types for the session engine.
//!
//! Each component owns a focused error enum. [`SessionError`] gathers them
//! for callers that drive the whole flow and need one answer to "can this be
//! retried, or must the user log in again?".
//!
//! # Error Types
//!
//! - [`crate::cipher::CryptoError`] - cipher failures
//! - [`crate::codec::CodecError`] - malformed or undecryptable cookies
//! - [`crate::lock::LockError`] - refresh coordination failures
//! - [`crate::providers::ProviderError`] - identity provider failures
//! - [`crate::token::TokenError`] - bearer token rejections
//! - [`ConfigError`] - configuration errors
//! - [`SessionError`] - top-level error encompassing every component
//!
//! # Example
//!
//! ```rust
//! use gatekeeper_session::error::SessionError;
//! use gatekeeper_session::providers::ProviderError;
//!
//! let err = SessionError::from(ProviderError::Refresh("invalid_grant".into()));
//! assert!(err.is_terminal());
//!
//! let err = SessionError::from(ProviderError::Transport("connection reset".into()));
//! assert!(err.is_retryable());
//! ```

use std::error::Error;
use std::fmt;

use crate::cipher::CryptoError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::lock::LockError;
use crate::providers::ProviderError;
use crate::token::TokenError;

/// Top-level error type for the session engine.
///
/// # Error Categories
///
/// - **Retryable**: transport failures, timeouts and lock backend outages.
///   The session is still intact; the same call may succeed later.
/// - **Terminal**: everything else. The cookie is unusable or the upstream
///   refused the grant, so the user must go back through login.
#[derive(Debug)]
pub enum SessionError {
    /// Configuration error.
    Config(ConfigError),

    /// Cipher failure outside of cookie decoding.
    Crypto(CryptoError),

    /// The session cookie could not be encoded or decoded.
    Codec(CodecError),

    /// Refresh coordination failure.
    Lock(LockError),

    /// Identity provider failure.
    Provider(ProviderError),

    /// Bearer token could not be turned into a session.
    Token(TokenError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Crypto(err) => write!(f, "cipher error: {err}"),
            Self::Codec(err) => write!(f, "session cookie error: {err}"),
            Self::Lock(err) => write!(f, "session lock error: {err}"),
            Self::Provider(err) => write!(f, "identity provider error: {err}"),
            Self::Token(err) => write!(f, "bearer token error: {err}"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Crypto(err) => Some(err),
            Self::Codec(err) => Some(err),
            Self::Lock(err) => Some(err),
            Self::Provider(err) => Some(err),
            Self::Token(err) => Some(err),
        }
    }
}

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<CryptoError> for SessionError {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err)
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<LockError> for SessionError {
    fn from(err: LockError) -> Self {
        Self::Lock(err)
    }
}

impl From<ProviderError> for SessionError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

impl From<TokenError> for SessionError {
    fn from(err: TokenError) -> Self {
        Self::Token(err)
    }
}

impl SessionError {
    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => err.is_retryable(),
            Self::Lock(LockError::Backend(_)) => true,
            _ => false,
        }
    }

    /// Returns `true` if the session must be discarded and the user sent back
    /// through login.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}

/// A specialized Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
