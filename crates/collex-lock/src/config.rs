//! # Lock Manager Configuration
//!
//! Construction-time tuning knobs, mirroring the `Default`-backed config
//! struct pattern used for the storage engine's buffer pool: sensible
//! defaults that work out of the box, validated once at construction so
//! the rest of the crate never has to re-check them.

use std::time::Duration;

use crate::error::{LockError, LockResult};

/// Tunable parameters for a [`crate::manager::LockManager`].
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Number of latches in the collection stripe pool. Higher values
    /// reduce unrelated-path contention at the cost of memory; must be
    /// greater than zero.
    pub concurrency_level: usize,
    /// Number of latches in the document-set stripe pool. Independent
    /// from `concurrency_level` since document ids and collection paths
    /// are different key spaces.
    pub document_concurrency_level: usize,
    /// Default deadline applied to an acquisition if the caller doesn't
    /// supply a per-call one. `None` means block indefinitely.
    pub lock_timeout: Option<Duration>,
    /// Capacity of the lock table's bounded event queue.
    pub event_queue_capacity: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            concurrency_level: 100,
            document_concurrency_level: 100,
            lock_timeout: None,
            event_queue_capacity: 4096,
        }
    }
}

impl LockManagerConfig {
    pub(crate) fn validate(&self) -> LockResult<()> {
        if self.concurrency_level == 0 {
            return Err(LockError::InvalidConfig(
                "concurrency_level must be greater than zero",
            ));
        }
        if self.document_concurrency_level == 0 {
            return Err(LockError::InvalidConfig(
                "document_concurrency_level must be greater than zero",
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(LockError::InvalidConfig(
                "event_queue_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}
