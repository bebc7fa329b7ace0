//! Time source for session expiry decisions.
//!
//! Every expiry and age calculation in the engine goes through a [`Clock`]
//! rather than calling [`Utc::now`] directly, so tests can pin or move time
//! without sleeping.
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use gatekeeper_session::clock::Clock;
//!
//! let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//! let clock = Clock::mocked(start);
//! clock.advance(Duration::minutes(5));
//! assert_eq!(clock.now(), start + Duration::minutes(5));
//! ```

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

/// A clock that reports wall-clock time unless it has been mocked.
///
/// Clones of a mocked clock share the same instant, so advancing one
/// advances them all.
#[derive(Clone, Default)]
pub struct Clock {
    mock: Option<Arc<RwLock<DateTime<Utc>>>>,
}

impl Clock {
    /// Creates a clock that reports the real current time.
    pub fn system() -> Self {
        Self::default()
    }

    /// Creates a clock frozen at `at` until it is set or advanced.
    pub fn mocked(at: DateTime<Utc>) -> Self {
        Self {
            mock: Some(Arc::new(RwLock::new(at))),
        }
    }

    /// Returns the current instant.
    pub fn now(&self) -> DateTime<Utc> {
        match &self.mock {
            Some(mock) => *mock.read().unwrap_or_else(|e| e.into_inner()),
            None => Utc::now(),
        }
    }

    /// Returns true if this clock is mocked.
    pub fn is_mocked(&self) -> bool {
        self.mock.is_some()
    }

    /// Pins a mocked clock to `at`. Has no effect on a system clock.
    pub fn set(&self, at: DateTime<Utc>) {
        if let Some(mock) = &self.mock {
            *mock.write().unwrap_or_else(|e| e.into_inner()) = at;
        }
    }

    /// Moves a mocked clock forward (or backward for negative durations).
    /// Has no effect on a system clock.
    pub fn advance(&self, by: Duration) {
        if let Some(mock) = &self.mock {
            let mut now = mock.write().unwrap_or_else(|e| e.into_inner());
            *now = *now + by;
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mock {
            Some(_) => f.debug_tuple("Clock::Mocked").field(&self.now()).finish(),
            None => f.write_str("Clock::System"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn system_clock_tracks_real_time() {
        let clock = Clock::system();
        let before = Utc::now();
        let now = clock.now();
        assert!(now >= before);
        assert!(!clock.is_mocked());
    }

    #[test]
    fn mocked_clock_is_frozen() {
        let clock = Clock::mocked(instant());
        assert_eq!(clock.now(), instant());
        assert_eq!(clock.now(), instant());
        assert!(clock.is_mocked());
    }

    #[test]
    fn set_and_advance_move_mocked_clock() {
        let clock = Clock::mocked(instant());
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), instant() + Duration::seconds(90));

        clock.set(instant() - Duration::hours(1));
        assert_eq!(clock.now(), instant() - Duration::hours(1));
    }

    #[test]
    fn clones_share_mocked_instant() {
        let clock = Clock::mocked(instant());
        let other = clock.clone();
        clock.advance(Duration::minutes(1));
        assert_eq!(other.now(), instant() + Duration::minutes(1));
    }

    #[test]
    fn set_on_system_clock_is_ignored() {
        let clock = Clock::system();
        clock.set(instant());
        assert_ne!(clock.now(), instant());
    }
}
