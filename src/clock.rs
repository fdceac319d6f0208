//! The single monotonic millisecond clock every time-dependent decision in
//! this crate is driven by (`spec.md` §5 "Clocks").
//!
//! Wall-clock time never feeds algorithmic decisions; it is only used for
//! logs and statistics timestamps, which live outside this module.

use std::time::Instant;

/// A point in time on the core's monotonic millisecond clock.
///
/// Never constructed from [`std::time::SystemTime`]; always derived from a
/// [`Clock`] implementation so that NTP adjustments and leap seconds cannot
/// perturb algorithmic state.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct MonoMs(pub u64);

impl MonoMs {
    /// Returns the duration from `earlier` to `self`, saturating at zero if
    /// `earlier` is actually later (can happen across clock resets in
    /// tests).
    #[must_use]
    pub fn saturating_sub(self, earlier: MonoMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn checked_sub(self, earlier: MonoMs) -> Option<u64> {
        self.0.checked_sub(earlier.0)
    }

    #[must_use]
    pub fn add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl From<u64> for MonoMs {
    fn from(ms: u64) -> Self {
        Self(ms)
    }
}

/// Source of the monotonic clock. Abstracted so tests can drive time
/// explicitly instead of racing the wall clock.
pub trait Clock: Send + Sync {
    /// Returns the current time, in milliseconds, on an arbitrary epoch that
    /// only ever moves forward.
    fn now_ms(&self) -> MonoMs;
}

/// Production [`Clock`] backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> MonoMs {
        MonoMs(self.epoch.elapsed().as_millis() as u64)
    }
}

/// Test [`Clock`] that only advances when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now
            .fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> MonoMs {
        MonoMs(self.now.load(std::sync::atomic::Ordering::SeqCst))
    }
}
