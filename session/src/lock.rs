//! Mutual exclusion for session refresh.
//!
//! A [`Lock`] guards one session identity. Only the holder may exchange the
//! session's refresh token upstream; everyone else can [`Lock::peek`] to see
//! that a refresh is already in flight.
//!
//! # Strategies
//!
//! - [`NoOpLock`]: always succeeds and never reports the lock as held. Used
//!   when no coordination backend is configured.
//! - [`MemoryLock`]: TTL-bounded lock entries in a [`LockTable`] shared by
//!   every request handler of one process.
//!
//! A networked backend plugs in by implementing [`Lock`].
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use gatekeeper_session::lock::{Lock, LockTable};
//!
//! # tokio_test::block_on(async {
//! let table = LockTable::new();
//! let first = table.lock_for("user@example.com");
//! let second = table.lock_for("user@example.com");
//!
//! first.obtain(Duration::from_secs(5)).await.unwrap();
//! assert!(second.peek().await.unwrap());
//! assert!(second.obtain(Duration::from_secs(5)).await.is_err());
//!
//! first.release().await.unwrap();
//! assert!(!second.peek().await.unwrap());
//! # });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

/// Errors returned by [`Lock`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another holder owns the lock.
    #[error("lock already held: {0}")]
    AlreadyHeld(String),

    /// The caller does not hold the lock it tried to refresh or release.
    #[error("lock not held: {0}")]
    NotHeld(String),

    /// The coordination backend could not be reached.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Distributed mutual-exclusion handle keyed by session identity.
///
/// State machine: Free → Held (obtain) → Held (refresh) → Free (release or
/// TTL expiry).
#[async_trait]
pub trait Lock: Send + Sync {
    /// Takes the lock for `ttl`.
    ///
    /// Fails with [`LockError::AlreadyHeld`] while any holder owns it.
    async fn obtain(&self, ttl: Duration) -> Result<(), LockError>;

    /// Extends a lock this handle holds to `ttl` from now.
    async fn refresh(&self, ttl: Duration) -> Result<(), LockError>;

    /// Releases a lock this handle holds.
    async fn release(&self) -> Result<(), LockError>;

    /// Reports whether anyone currently holds the lock, without blocking.
    async fn peek(&self) -> Result<bool, LockError>;
}

/// Lock used when no coordination backend is injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLock;

#[async_trait]
impl Lock for NoOpLock {
    async fn obtain(&self, _ttl: Duration) -> Result<(), LockError> {
        Ok(())
    }

    async fn refresh(&self, _ttl: Duration) -> Result<(), LockError> {
        Ok(())
    }

    async fn release(&self) -> Result<(), LockError> {
        Ok(())
    }

    async fn peek(&self) -> Result<bool, LockError> {
        Ok(false)
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    owner: Uuid,
    expires_at: Instant,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Shared table of lock entries for [`MemoryLock`] handles.
///
/// Cloning the table shares the underlying entries.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl LockTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new handle for `key`.
    ///
    /// Each handle has its own owner identity: two handles for the same key
    /// contend with each other exactly like two processes would.
    pub fn lock_for(&self, key: impl Into<String>) -> MemoryLock {
        MemoryLock {
            table: self.clone(),
            key: key.into(),
            owner: Uuid::new_v4(),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Returns true if no entry is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-process lock handle backed by a [`LockTable`].
#[derive(Debug, Clone)]
pub struct MemoryLock {
    table: LockTable,
    key: String,
    owner: Uuid,
}

impl MemoryLock {
    /// The key this handle guards.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Lock for MemoryLock {
    async fn obtain(&self, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        let mut entries = self.table.entries();

        if let Some(entry) = entries.get(&self.key) {
            if entry.is_live(now) {
                trace!(key = %self.key, "Lock obtain refused, already held");
                return Err(LockError::AlreadyHeld(self.key.clone()));
            }
        }

        entries.insert(
            self.key.clone(),
            LockEntry {
                owner: self.owner,
                expires_at: now + ttl,
            },
        );
        debug!(key = %self.key, ttl_ms = ttl.as_millis() as u64, "Lock obtained");
        Ok(())
    }

    async fn refresh(&self, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        let mut entries = self.table.entries();

        match entries.get_mut(&self.key) {
            Some(entry) if entry.owner == self.owner && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                trace!(key = %self.key, ttl_ms = ttl.as_millis() as u64, "Lock extended");
                Ok(())
            }
            _ => Err(LockError::NotHeld(self.key.clone())),
        }
    }

    async fn release(&self) -> Result<(), LockError> {
        let now = Instant::now();
        let mut entries = self.table.entries();

        match entries.get(&self.key) {
            Some(entry) if entry.owner == self.owner => {
                let live = entry.is_live(now);
                entries.remove(&self.key);
                if live {
                    debug!(key = %self.key, "Lock released");
                    Ok(())
                } else {
                    Err(LockError::NotHeld(self.key.clone()))
                }
            }
            _ => Err(LockError::NotHeld(self.key.clone())),
        }
    }

    async fn peek(&self) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.table.entries();

        match entries.get(&self.key) {
            Some(entry) if entry.is_live(now) => Ok(true),
            Some(_) => {
                entries.remove(&self.key);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}
