//! # Lock Manager Error Types
//!
//! Error taxonomy for the collection lock manager: malformed paths,
//! acquisition timeouts, listener faults, and unbalanced releases.

use crate::path::CollectionPath;
use std::fmt;
use thiserror::Error;

/// Result type alias for lock manager operations.
pub type LockResult<T> = Result<T, LockError>;

/// Lock mode, reused by several error variants for context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockMode {
    /// Shared access; any number of readers may hold this mode concurrently.
    Read,
    /// Exclusive access; at most one holder across the whole latch.
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "READ"),
            LockMode::Write => write!(f, "WRITE"),
        }
    }
}

/// Errors raised by the collection lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    /// The supplied path is not a well-formed `/db`-rooted collection path.
    #[error("invalid collection path {path:?}: {reason}")]
    InvalidPath {
        /// The offending input, verbatim.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A deadline was supplied and elapsed before the latch could be
    /// acquired. Every latch already held by this acquisition attempt has
    /// been released before this error is returned.
    #[error("timed out acquiring {mode} lock on {path}")]
    LockTimeout {
        /// Path whose latch could not be acquired in time.
        path: CollectionPath,
        /// Mode that was being requested.
        mode: LockMode,
    },

    /// A registered listener's `accept` callback panicked or returned an
    /// error. Caught inside the dispatcher; never propagated to callers.
    #[error("listener {listener} faulted while handling a lock event: {message}")]
    ListenerFault {
        /// Identifier of the faulting listener.
        listener: String,
        /// Human-readable description of the fault.
        message: String,
    },

    /// A `ManagedLock` was disposed more than once. The second call is a
    /// no-op; this variant exists only to carry a diagnostic event, never
    /// returned to a caller.
    #[error("release of {path} ({mode}) attempted after the handle was already disposed")]
    UnbalancedRelease {
        /// Path whose release was redundant.
        path: CollectionPath,
        /// Mode of the redundant release.
        mode: LockMode,
    },

    /// A construction-time configuration value was out of range (for
    /// example `concurrency_level == 0`).
    #[error("invalid lock manager configuration: {0}")]
    InvalidConfig(&'static str),
}
