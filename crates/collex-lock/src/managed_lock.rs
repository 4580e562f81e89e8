//! # Managed Lock Handle
//!
//! [`ManagedLock`] is the RAII handle callers actually interact with:
//! it owns one or two latch acquisitions (the locked target, and
//! optionally its retained parent) and guarantees they are released —
//! in reverse acquisition order, and at most once — however the handle
//! goes out of scope.

use std::sync::Arc;

use crate::error::LockMode;
use crate::latch::{Latch, LatchReadGuard, LatchWriteGuard};
use crate::lock_table::LockTable;
use crate::path::CollectionPath;

/// A held latch acquisition in either mode, stored uniformly so the
/// manager's traversal code doesn't need a separate code path per mode.
#[derive(Debug)]
pub(crate) enum HeldGuard {
    Read(LatchReadGuard),
    Write(LatchWriteGuard),
}

/// A single physical acquisition, possibly covering more than one
/// logical path: when two ancestors in a traversal (or two document
/// ids in a set) hash onto the same stripe latch, the manager acquires
/// it once but must still report one `Released` per logical path on
/// disposal, so every path merged onto it is tracked here.
#[derive(Debug)]
struct Held {
    paths: Vec<CollectionPath>,
    mode: LockMode,
    latch: Arc<Latch>,
    guard: HeldGuard,
}

/// Scoped ownership of one or two acquired latches.
///
/// Constructed by [`crate::manager::LockManager`]; never built directly.
/// Held latches are released in reverse acquisition order when the
/// handle is dropped, or earlier via an explicit [`ManagedLock::dispose`]
/// call. Disposing twice (directly, then again on drop) is a no-op —
/// the second release is simply skipped.
#[derive(Debug)]
pub struct ManagedLock<'a> {
    held: Vec<Held>,
    lock_table: &'a LockTable,
    group_id: u64,
    disposed: bool,
    last_released: Option<(CollectionPath, LockMode)>,
}

impl<'a> ManagedLock<'a> {
    pub(crate) fn new(lock_table: &'a LockTable, group_id: u64) -> Self {
        ManagedLock {
            held: Vec::with_capacity(2),
            lock_table,
            group_id,
            disposed: false,
            last_released: None,
        }
    }

    pub(crate) fn push(&mut self, paths: Vec<CollectionPath>, mode: LockMode, latch: Arc<Latch>, guard: HeldGuard) {
        self.held.push(Held {
            paths,
            mode,
            latch,
            guard,
        });
    }

    #[cfg(test)]
    pub(crate) fn push_read(&mut self, path: CollectionPath, latch: Arc<Latch>, guard: LatchReadGuard) {
        self.push(vec![path], LockMode::Read, latch, HeldGuard::Read(guard));
    }

    #[cfg(test)]
    pub(crate) fn push_write(&mut self, path: CollectionPath, latch: Arc<Latch>, guard: LatchWriteGuard) {
        self.push(vec![path], LockMode::Write, latch, HeldGuard::Write(guard));
    }

    /// Append an additional logical path to the entry already covering
    /// `latch`. Used when a caller discovers, after already pushing an
    /// acquisition, that a second logical key (another document id)
    /// hashes onto the same physical latch: no second primitive
    /// acquisition is needed, but the merged path must still get its
    /// own `Released` event on disposal. Returns `true` if a matching
    /// entry was found and extended, `false` if `latch` isn't held yet.
    #[must_use]
    pub(crate) fn merge_into_held(&mut self, latch: &Arc<Latch>, path: CollectionPath) -> bool {
        match self.held.iter_mut().find(|h| Latch::ptr_eq(&h.latch, latch)) {
            Some(held) => {
                held.paths.push(path);
                true
            }
            None => false,
        }
    }

    /// The path this handle most recently had acquired (the target of
    /// the acquisition that produced it). `None` for a handle holding
    /// nothing (never observable through the public API, but kept total).
    #[must_use]
    pub fn target_path(&self) -> Option<&CollectionPath> {
        self.held.last().and_then(|h| h.paths.last())
    }

    /// `true` if this handle currently holds a latch for `path`.
    #[must_use]
    pub fn holds(&self, path: &CollectionPath) -> bool {
        self.held.iter().any(|h| h.paths.iter().any(|p| p == path))
    }

    /// Release every latch this handle holds, in reverse acquisition
    /// order, emitting one `Released` event for every logical path
    /// merged onto it (see [`Self::merge_into_held`]). Idempotent:
    /// calling this more than once, or dropping the handle afterward,
    /// performs no further releases — a second call only logs an
    /// [`crate::error::LockError::UnbalancedRelease`] diagnostic for
    /// the last path this handle released.
    pub fn dispose(&mut self) {
        if self.disposed {
            if let Some((path, mode)) = self.last_released.clone() {
                tracing::warn!(
                    error = %crate::error::LockError::UnbalancedRelease { path, mode },
                    "managed lock disposed more than once",
                );
            }
            return;
        }
        self.disposed = true;
        while let Some(held) = self.held.pop() {
            for path in &held.paths {
                self.lock_table.record_released(path, held.mode, self.group_id);
                self.last_released = Some((path.clone(), held.mode));
            }
            drop(held.guard);
            drop(held.latch);
        }
    }
}

impl Drop for ManagedLock<'_> {
    fn drop(&mut self) {
        self.dispose();
    }
}
