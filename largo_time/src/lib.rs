//! Time abstractions for largo.
//!
//! Components never read the wall clock directly; they hold an
//! `Arc<dyn TimeProvider>` so that tests can drive time deterministically.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::{fmt::Debug, ops::Add, ops::Sub, sync::Arc, time::Duration};

/// A wall-clock instant with nanosecond precision.
///
/// Wraps a UTC datetime; ordering and arithmetic are over the underlying
/// nanosecond timestamp.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Debug for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Time {
    /// Create from a unix timestamp in nanoseconds.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Create from a unix timestamp in seconds plus a nanosecond offset.
    pub fn from_timestamp(secs: i64, nanos: u32) -> Self {
        Self(Utc.timestamp(secs, nanos))
    }

    /// Create from a unix timestamp in milliseconds.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis(millis))
    }

    /// Unix timestamp in nanoseconds.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// Unix timestamp in whole seconds.
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    /// The duration since `earlier`, or `None` if `earlier` is later than
    /// `self`.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (*self - earlier).to_std().ok()
    }

    /// Add a duration, returning `None` on overflow.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let duration = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_add_signed(duration).map(Self)
    }

    /// Subtract a duration, returning `None` on overflow.
    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        let duration = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_sub_signed(duration).map(Self)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.checked_add(rhs).expect("time overflow")
    }
}

impl Sub<Self> for Time {
    type Output = chrono::Duration;

    fn sub(self, rhs: Self) -> chrono::Duration {
        self.0 - rhs.0
    }
}

/// A source of [`Time`].
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// [`TimeProvider`] returning a programmable instant, for tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider initially reporting `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Set the reported instant.
    pub fn set(&self, now: Time) {
        *self.now.write() = now
    }

    /// Advance the reported instant, returning the new value.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

impl<T: TimeProvider> TimeProvider for Arc<T> {
    fn now(&self) -> Time {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_round_trip() {
        let t = Time::from_timestamp_nanos(1_234_567_891_234_567_891);
        assert_eq!(t.timestamp_nanos(), 1_234_567_891_234_567_891);
    }

    #[test]
    fn duration_since() {
        let a = Time::from_timestamp_nanos(100);
        let b = Time::from_timestamp_nanos(40);
        assert_eq!(a.checked_duration_since(b), Some(Duration::from_nanos(60)));
        assert_eq!(b.checked_duration_since(a), None);
    }

    #[test]
    fn add_sub() {
        let a = Time::from_timestamp_nanos(0);
        let b = a + Duration::from_secs(1);
        assert_eq!(b.timestamp_nanos(), 1_000_000_000);
        assert_eq!(b.checked_sub(Duration::from_secs(1)), Some(a));
    }

    #[test]
    fn mock_provider() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now().timestamp_nanos(), 0);

        provider.inc(Duration::from_nanos(10));
        assert_eq!(provider.now().timestamp_nanos(), 10);

        provider.set(Time::from_timestamp_nanos(5));
        assert_eq!(provider.now().timestamp_nanos(), 5);
    }
}
