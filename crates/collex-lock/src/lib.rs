//! # collex-lock
//!
//! Hierarchical collection lock manager for the collex native XML
//! database. Every read or write that touches a collection or its
//! documents goes through [`LockManager`], which walks the collection's
//! ancestor chain top-down, coupling ("crabbing") each child's latch in
//! before releasing its parent's, so a traversal never has a moment
//! where neither is held and two concurrent traversals can never
//! deadlock against each other.
//!
//! Latches are striped across a bounded pool ([`StripePool`]) keyed by
//! path hash rather than allocated per path, so the manager's memory
//! footprint is fixed at construction time regardless of how deep or
//! wide the collection tree grows. Every attempt, acquisition, timeout,
//! and release is recorded in a [`LockTable`] and fanned out
//! asynchronously to whatever diagnostic listeners are registered —
//! useful for deadlock-pattern analysis and for the scenario tests this
//! crate's own test suite replays.
//!
//! ```
//! use collex_lock::LockManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = LockManager::new()?;
//! {
//!     let _read = manager.acquire_collection_read_lock("/db/reports")?;
//!     // ... read the collection ...
//! } // released here
//!
//! {
//!     let _write = manager.acquire_collection_write_lock("/db/reports", false)?;
//!     // ... mutate the collection ...
//! } // released here
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod latch;
pub mod lock_table;
pub mod managed_lock;
pub mod manager;
pub mod path;
pub mod stats;
pub mod stripe;

pub use config::LockManagerConfig;
pub use error::{LockError, LockMode, LockResult};
pub use latch::{Latch, LatchReadGuard, LatchWriteGuard};
pub use lock_table::{LockEvent, LockEventKind, LockEventListener, LockTable};
pub use managed_lock::ManagedLock;
pub use manager::{DocumentId, LockManager};
pub use path::CollectionPath;
pub use stats::LockManagerStats;
pub use stripe::StripePool;
