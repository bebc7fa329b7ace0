//! Lock-guarded session refresh.
//!
//! Several requests for the same user can find the session expired at the
//! same moment. [`RefreshCoordinator`] makes sure only one of them exchanges
//! the refresh token upstream:
//!
//! 1. A session that is not expired, or has no refresh token, needs nothing.
//! 2. If another holder already has the session's lock, the caller backs off
//!    with [`RefreshOutcome::Deferred`] and keeps serving the current state.
//! 3. Otherwise the caller takes the lock, extends it every half TTL while
//!    the exchange is in flight, and releases it on every exit path.
//!
//! The lock is taken from the session itself (see
//! [`SessionState::with_lock`]); without one, refreshes are uncoordinated.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::lock::{Lock, LockError};
use crate::providers::Provider;
use crate::session::SessionState;

/// Smallest interval between lock extensions.
const MIN_EXTEND_INTERVAL: Duration = Duration::from_millis(10);

/// What [`RefreshCoordinator::refresh_if_needed`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The session is still valid or cannot be refreshed.
    NotNeeded,
    /// Tokens and expiry were replaced.
    Refreshed,
    /// Another holder is refreshing this session.
    Deferred,
}

/// Releases a held lock when dropped.
///
/// [`LockGuard::release`] is the normal path. If the guard is dropped
/// without it (the refresh future was cancelled), the release runs as a
/// background task on the current runtime.
struct LockGuard {
    lock: Option<Arc<dyn Lock>>,
}

impl LockGuard {
    fn new(lock: Arc<dyn Lock>) -> Self {
        Self { lock: Some(lock) }
    }

    async fn release(mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release().await {
                warn!(error = %e, "Failed to release refresh lock");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release().await {
                        debug!(error = %e, "Background refresh lock release failed");
                    }
                });
            }
            Err(_) => warn!("Refresh lock dropped outside a runtime; it will expire on its own"),
        }
    }
}

/// Coordinates refreshes of one provider's sessions.
#[derive(Clone)]
pub struct RefreshCoordinator {
    provider: Arc<dyn Provider>,
    lock_ttl: Duration,
}

impl RefreshCoordinator {
    /// Creates a coordinator whose locks live for `lock_ttl`.
    pub fn new(provider: Arc<dyn Provider>, lock_ttl: Duration) -> Self {
        Self { provider, lock_ttl }
    }

    /// The lock lifetime.
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Refreshes `session` through the provider if it needs it and nobody
    /// else is already doing so.
    ///
    /// # Errors
    ///
    /// Provider failures are returned as-is; `session` is unchanged when an
    /// error is returned. Lock backend failures surface as
    /// [`SessionError::Lock`].
    pub async fn refresh_if_needed(
        &self,
        session: &mut SessionState,
    ) -> Result<RefreshOutcome, SessionError> {
        if !session.is_expired() || session.refresh_token.is_empty() {
            return Ok(RefreshOutcome::NotNeeded);
        }

        let lock = session.lock();
        if lock.peek().await? {
            debug!(user = %session.user_or_email(), "Refresh already in flight, deferring");
            return Ok(RefreshOutcome::Deferred);
        }

        match lock.obtain(self.lock_ttl).await {
            Ok(()) => {}
            Err(LockError::AlreadyHeld(_)) => {
                debug!(user = %session.user_or_email(), "Lost refresh lock race, deferring");
                return Ok(RefreshOutcome::Deferred);
            }
            Err(e) => return Err(e.into()),
        }

        let guard = LockGuard::new(Arc::clone(&lock));
        let result = self.refresh_holding(&lock, session).await;
        guard.release().await;

        match result {
            Ok(true) => Ok(RefreshOutcome::Refreshed),
            Ok(false) => Ok(RefreshOutcome::NotNeeded),
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Session refresh failed");
                Err(e.into())
            }
        }
    }

    /// Runs the provider exchange while periodically extending the lock.
    async fn refresh_holding(
        &self,
        lock: &Arc<dyn Lock>,
        session: &mut SessionState,
    ) -> Result<bool, crate::providers::ProviderError> {
        let period = (self.lock_ttl / 2).max(MIN_EXTEND_INTERVAL);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut refresh = self.provider.refresh_session_if_needed(session);
        loop {
            tokio::select! {
                result = &mut refresh => return result,
                _ = ticker.tick() => {
                    if let Err(e) = lock.refresh(self.lock_ttl).await {
                        warn!(error = %e, "Failed to extend refresh lock");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("provider", &self.provider.name())
            .field("lock_ttl", &self.lock_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockTable;
    use crate::providers::{ProviderData, ProviderError};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    const TTL: Duration = Duration::from_secs(5);

    /// Provider whose refresh sleeps, then rotates the access token.
    struct SlowProvider {
        data: ProviderData,
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl SlowProvider {
        fn new(delay: Duration) -> Self {
            let url = Url::parse("https://idp.example.com/").unwrap();
            Self {
                data: ProviderData::new("Slow", url.clone(), url.clone(), url.clone(), url),
                calls: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Duration::ZERO)
            }
        }
    }

    #[async_trait]
    impl Provider for SlowProvider {
        fn data(&self) -> &ProviderData {
            &self.data
        }

        async fn redeem(&self, _: &str, _: &str) -> Result<SessionState, ProviderError> {
            Err(ProviderError::Redeem("unsupported".into()))
        }

        async fn refresh_session_if_needed(
            &self,
            session: &mut SessionState,
        ) -> Result<bool, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ProviderError::Refresh("invalid_grant".into()));
            }
            session.access_token = "rotated".to_string();
            session.set_expires_on(Utc::now() + chrono::Duration::hours(1));
            Ok(true)
        }

        async fn get_email_address(&self, _: &SessionState) -> Result<String, ProviderError> {
            Ok(String::new())
        }

        async fn validate_session(&self, _: &SessionState) -> bool {
            true
        }

        async fn enrich_session(&self, _: &mut SessionState) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn expired_session() -> SessionState {
        let mut session = SessionState::default();
        session.email = "user@example.com".to_string();
        session.access_token = "stale".to_string();
        session.refresh_token = "refresh".to_string();
        session.expires_on = Some(Utc::now() - chrono::Duration::minutes(5));
        session
    }

    #[tokio::test]
    async fn valid_session_is_not_refreshed() {
        let provider = Arc::new(SlowProvider::new(Duration::ZERO));
        let coordinator = RefreshCoordinator::new(provider.clone(), TTL);

        let mut session = SessionState::default();
        session.refresh_token = "refresh".to_string();
        session.expires_on = Some(Utc::now() + chrono::Duration::hours(1));
        let outcome = coordinator.refresh_if_needed(&mut session).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NotNeeded);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_session_without_refresh_token_is_not_refreshed() {
        let provider = Arc::new(SlowProvider::new(Duration::ZERO));
        let coordinator = RefreshCoordinator::new(provider.clone(), TTL);

        let mut session = expired_session();
        session.refresh_token.clear();
        let outcome = coordinator.refresh_if_needed(&mut session).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NotNeeded);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn holder_refreshes_and_releases_lock() {
        let table = LockTable::new();
        let provider = Arc::new(SlowProvider::new(Duration::ZERO));
        let coordinator = RefreshCoordinator::new(provider.clone(), TTL);

        let mut session = expired_session().with_lock(Arc::new(table.lock_for("user@example.com")));
        let outcome = coordinator.refresh_if_needed(&mut session).await.unwrap();

        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(session.access_token, "rotated");
        assert!(!session.is_expired());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn non_holder_defers() {
        let table = LockTable::new();
        let holder = table.lock_for("user@example.com");
        holder.obtain(TTL).await.unwrap();

        let provider = Arc::new(SlowProvider::new(Duration::ZERO));
        let coordinator = RefreshCoordinator::new(provider.clone(), TTL);
        let mut session = expired_session().with_lock(Arc::new(table.lock_for("user@example.com")));

        let outcome = coordinator.refresh_if_needed(&mut session).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Deferred);
        assert_eq!(session.access_token, "stale");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_refresh_releases_lock_and_keeps_session() {
        let table = LockTable::new();
        let provider = Arc::new(SlowProvider::failing());
        let coordinator = RefreshCoordinator::new(provider, TTL);

        let mut session = expired_session().with_lock(Arc::new(table.lock_for("user@example.com")));
        let err = coordinator.refresh_if_needed(&mut session).await.unwrap_err();

        assert!(err.is_terminal());
        assert!(matches!(err, SessionError::Provider(ProviderError::Refresh(_))));
        assert_eq!(session.access_token, "stale");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn lock_is_extended_during_slow_exchange() {
        let table = LockTable::new();
        let ttl = Duration::from_millis(60);
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(150)));
        let coordinator = RefreshCoordinator::new(provider, ttl);

        let mut session = expired_session().with_lock(Arc::new(table.lock_for("user@example.com")));
        let observer = table.lock_for("user@example.com");

        let refresh = coordinator.refresh_if_needed(&mut session);
        let watch = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            observer.peek().await.unwrap()
        };
        let (outcome, held_past_ttl) = tokio::join!(refresh, watch);

        assert_eq!(outcome.unwrap(), RefreshOutcome::Refreshed);
        assert!(held_past_ttl);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn cancelled_refresh_releases_lock_in_background() {
        let table = LockTable::new();
        let provider = Arc::new(SlowProvider::new(Duration::from_secs(60)));
        let coordinator = RefreshCoordinator::new(provider, TTL);

        let mut session = expired_session().with_lock(Arc::new(table.lock_for("user@example.com")));
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            coordinator.refresh_if_needed(&mut session),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(session.access_token, "stale");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(table.is_empty());
    }
}
