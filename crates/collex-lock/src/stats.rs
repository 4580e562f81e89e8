//! # Lock Manager Statistics
//!
//! Cheap, always-on atomic counters alongside the full event ledger in
//! [`crate::lock_table`] — the ledger is for diagnosing a specific
//! incident, these are for the dashboard a caller keeps an eye on in
//! passing.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals of lock manager activity. Cheap to read from any
/// thread; never resets for the lifetime of the manager.
#[derive(Debug, Default)]
pub struct LockManagerStats {
    attempts: AtomicU64,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    releases: AtomicU64,
}

impl LockManagerStats {
    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acquired(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Total latch acquisition attempts (including ones still pending,
    /// retried collision skips counted once each).
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Total successful acquisitions.
    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Total acquisitions that failed because a deadline elapsed.
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Total releases performed.
    #[must_use]
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}
