//! The canonical session entity.
//!
//! A [`SessionState`] is what the gatekeeper knows about an authenticated
//! user between requests: the provider's tokens, when they expire, and the
//! identity and group attributes used for authorization. It travels inside an
//! encrypted cookie (see [`crate::codec`]) and is only ever mutated by a
//! successful provider refresh.
//!
//! # Lifecycle
//!
//! ```text
//! NoSession --redeem--> Valid --time passes--> Expired
//!     ^                   ^                       |
//!     |                   +------refresh ok-------+
//!     +------------------refresh failed-----------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use gatekeeper_session::clock::Clock;
//! use gatekeeper_session::session::SessionState;
//!
//! let clock = Clock::mocked(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
//! let mut session = SessionState::default().with_clock(clock.clone());
//! session.email = "user@example.com".to_string();
//! session.expires_in(Duration::hours(1));
//!
//! assert!(!session.is_expired());
//! clock.advance(Duration::hours(2));
//! assert!(session.is_expired());
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, DurationRound, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::clock::Clock;
use crate::lock::{Lock, LockError, NoOpLock};

/// Information about the currently authenticated user session.
///
/// Serialized field names are the short keys used by the rich cookie format.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    /// When the session was established.
    #[serde(rename = "ca", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// When the provider's tokens stop being valid.
    #[serde(rename = "eo", default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<DateTime<Utc>>,

    /// OAuth2 access token.
    #[serde(rename = "at", default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,

    /// OIDC ID token.
    #[serde(rename = "it", default, skip_serializing_if = "String::is_empty")]
    pub id_token: String,

    /// OAuth2 refresh token. Empty means the session cannot be refreshed.
    #[serde(rename = "rt", default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,

    /// Nonce sent with the authentication request.
    #[serde(rename = "n", default, skip_serializing_if = "Vec::is_empty")]
    pub nonce: Vec<u8>,

    /// Email address, if the provider supplied one.
    #[serde(rename = "e", default, skip_serializing_if = "String::is_empty")]
    pub email: String,

    /// User name or subject.
    #[serde(rename = "u", default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Group memberships in provider enumeration order.
    #[serde(rename = "g", default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    /// Display name preferred by the user.
    #[serde(rename = "pu", default, skip_serializing_if = "String::is_empty")]
    pub preferred_username: String,

    #[serde(skip)]
    clock: Clock,

    #[serde(skip)]
    lock: Option<Arc<dyn Lock>>,
}

/// The zero instant, 0001-01-01T00:00:00Z. An expiry equal to it is treated
/// as unset.
pub fn zero_time() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn is_zero(at: &DateTime<Utc>) -> bool {
    *at == zero_time()
}

impl SessionState {
    /// Attaches the clock used for expiry and age calculations.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Attaches the lock guarding refreshes of this session.
    #[must_use]
    pub fn with_lock(mut self, lock: Arc<dyn Lock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Replaces the clock in place.
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    /// Replaces the lock in place.
    pub fn set_lock(&mut self, lock: Arc<dyn Lock>) {
        self.lock = Some(lock);
    }

    /// The clock this session reads time from.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The lock guarding this session, or a [`NoOpLock`] when none was injected.
    pub fn lock(&self) -> Arc<dyn Lock> {
        match &self.lock {
            Some(lock) => Arc::clone(lock),
            None => Arc::new(NoOpLock),
        }
    }

    /// Takes the refresh lock for `ttl`.
    pub async fn obtain_lock(&self, ttl: StdDuration) -> Result<(), LockError> {
        self.lock().obtain(ttl).await
    }

    /// Extends a held refresh lock.
    pub async fn refresh_lock(&self, ttl: StdDuration) -> Result<(), LockError> {
        self.lock().refresh(ttl).await
    }

    /// Releases a held refresh lock.
    pub async fn release_lock(&self) -> Result<(), LockError> {
        self.lock().release().await
    }

    /// Reports whether a refresh is in flight elsewhere.
    pub async fn peek_lock(&self) -> Result<bool, LockError> {
        self.lock().peek().await
    }

    /// Sets `created_at` to the clock's current time.
    pub fn created_at_now(&mut self) {
        self.created_at = Some(self.clock.now());
    }

    /// Sets the expiry.
    pub fn set_expires_on(&mut self, at: DateTime<Utc>) {
        self.expires_on = Some(at);
    }

    /// Sets the expiry to `d` after `created_at`, stamping `created_at` first
    /// if it is unset. Saturates at the representable date range.
    pub fn expires_in(&mut self, d: Duration) {
        let created = match self.created_at {
            Some(created) => created,
            None => {
                self.created_at_now();
                self.clock.now()
            }
        };
        let at = created.checked_add_signed(d).unwrap_or(if d < Duration::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        });
        self.expires_on = Some(at);
    }

    /// Returns true if the expiry is set, non-zero, and strictly in the past.
    pub fn is_expired(&self) -> bool {
        match &self.expires_on {
            Some(at) if !is_zero(at) => *at < self.clock.now(),
            _ => false,
        }
    }

    /// Time since `created_at`, measured against the current second.
    /// Zero when `created_at` is unset.
    pub fn age(&self) -> Duration {
        match &self.created_at {
            Some(created) if !is_zero(created) => {
                let now = self.clock.now();
                let now = now.duration_trunc(Duration::seconds(1)).unwrap_or(now);
                now - *created
            }
            _ => Duration::zero(),
        }
    }

    /// The resolved identity: email when present, otherwise user.
    pub fn user_or_email(&self) -> &str {
        if self.email.is_empty() {
            &self.user
        } else {
            &self.email
        }
    }

    /// Sets email and user from a bare identity string.
    ///
    /// An identity containing `@` is an email; the user is the part before
    /// the first `@`. Anything else is a plain user name.
    pub fn set_identity(&mut self, identity: &str) {
        match identity.split_once('@') {
            Some((user, _)) => {
                self.email = identity.to_string();
                self.user = user.to_string();
            }
            None => {
                self.email.clear();
                self.user = identity.to_string();
            }
        }
    }

    /// Looks up a session attribute by claim name.
    ///
    /// Unknown claims yield an empty list.
    pub fn get_claim(&self, claim: &str) -> Vec<String> {
        let timestamp = |at: &Option<DateTime<Utc>>| {
            at.map(|at| at.to_rfc3339()).unwrap_or_default()
        };

        match claim {
            "access_token" => vec![self.access_token.clone()],
            "id_token" => vec![self.id_token.clone()],
            "created_at" => vec![timestamp(&self.created_at)],
            "expires_on" => vec![timestamp(&self.expires_on)],
            "refresh_token" => vec![self.refresh_token.clone()],
            "email" => vec![self.email.clone()],
            "user" => vec![self.user.clone()],
            "groups" => self.groups.clone(),
            "preferred_username" => vec![self.preferred_username.clone()],
            _ => Vec::new(),
        }
    }

    /// Compares the session nonce with a hashed nonce echoed back by the
    /// provider, in constant time.
    ///
    /// The expected form is unpadded base64url of the SHA-256 of the nonce.
    pub fn check_nonce(&self, hashed: &str) -> bool {
        if self.nonce.is_empty() {
            return false;
        }
        let expected = hash_nonce(&self.nonce);
        expected.as_bytes().ct_eq(hashed.as_bytes()).into()
    }
}

/// Hashes a nonce the way it is embedded in ID tokens.
pub fn hash_nonce(nonce: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(nonce))
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session{{email:{} user:{} PreferredUsername:{}",
            self.email, self.user, self.preferred_username
        )?;
        if !self.access_token.is_empty() {
            f.write_str(" token:true")?;
        }
        if !self.id_token.is_empty() {
            f.write_str(" id_token:true")?;
        }
        if let Some(created) = self.created_at.filter(|at| !is_zero(at)) {
            write!(f, " created:{created}")?;
        }
        if let Some(expires) = self.expires_on.filter(|at| !is_zero(at)) {
            write!(f, " expires:{expires}")?;
        }
        if !self.refresh_token.is_empty() {
            f.write_str(" refresh_token:true")?;
        }
        if !self.groups.is_empty() {
            write!(f, " groups:{:?}", self.groups)?;
        }
        f.write_str("}")
    }
}

// Tokens must never reach logs, so Debug reuses the redacted summary.
impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
