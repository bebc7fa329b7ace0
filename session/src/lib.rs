//! Gatekeeper Session - session state engine for an authenticating proxy.
//!
//! This crate provides everything the gatekeeper knows about a logged-in user
//! between requests:
//! - The [`SessionState`] entity and its expiry and claim helpers
//! - An encrypted cookie codec with a compact and a rich wire format
//! - A per-session lock contract that serializes token refreshes
//! - Identity providers that redeem codes, refresh tokens and enrich sessions
//! - Conversion of verified bearer ID tokens into sessions
//!
//! # Architecture
//!
//! Sessions live entirely inside the cookie; there is no server-side store.
//! A request decodes its cookie with [`SessionCodec`], asks the
//! [`RefreshCoordinator`] to refresh it when expired, and re-encodes it if
//! anything changed. Concurrent requests for the same session coordinate
//! through the session's [`lock::Lock`] so the provider sees a single refresh.

pub mod cipher;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod providers;
pub mod refresh;
pub mod session;
pub mod token;

pub use codec::{CookieFormat, SessionCodec};
pub use config::Config;
pub use error::{Result, SessionError};
pub use providers::{AzureProvider, Provider};
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use session::SessionState;
