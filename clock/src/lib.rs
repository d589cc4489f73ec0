//! A minimal wall-clock abstraction.
//!
//! Ring heartbeats are unix-second timestamps written into a shared
//! descriptor, and every staleness decision ("is this instance still alive?")
//! compares such a timestamp against "now". Threading a [`TimeProvider`]
//! through those call sites lets tests pin the clock with a [`MockProvider`]
//! instead of sleeping through real heartbeat timeouts.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::ops::{Add, Sub};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

/// A UTC timestamp with whole-second resolution, matching the resolution of
/// heartbeats on the wire.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Default)]
pub struct Time(i64);

impl Time {
    /// Makes a new `Time` from the number of non-leap seconds since
    /// January 1, 1970 0:00:00 UTC (aka "UNIX timestamp").
    pub fn from_timestamp(secs: i64) -> Self {
        Self(secs)
    }

    /// Returns the number of non-leap seconds since January 1, 1970 UTC.
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// Returns the duration elapsed from `other` to `self`, or `None` if
    /// `other` is in the future.
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        u64::try_from(self.0 - other.0).ok().map(Duration::from_secs)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.as_secs() as i64)
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs.as_secs() as i64)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A source of [`Time`].
pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the current [`Time`]. No guarantees are made about
    /// monotonicity.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] that uses [`Utc::now`] as a clock source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Return a new [`SystemProvider`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now().timestamp())
    }
}

/// A [`TimeProvider`] that returns a fixed [`Time`] until moved by
/// [`MockProvider::set`] or [`MockProvider::inc`].
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Return a [`MockProvider`] pinned to `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Pin the clock to `time`.
    pub fn set(&self, time: Time) {
        *self.now.write() = time
    }

    /// Advance the clock by `duration`, returning the new time.
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
