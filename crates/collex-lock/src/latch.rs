//! # Reader–Writer Latch
//!
//! The lowest-level primitive in the lock manager: a reentrant-free
//! multi-reader/single-writer latch with deadline support and a
//! per-thread reader set for diagnosing which threads currently hold a
//! given latch for reading.
//!
//! Built on `parking_lot::{Mutex, Condvar}` rather than
//! `std::sync::RwLock`: the manager needs a bounded *wait*, and
//! `std::sync::RwLock` has no deadline API at all, while
//! `parking_lot::Condvar::wait_for` gives a straightforward
//! loop-until-condition-or-timeout (the same shape used by
//! `other_examples/38f2efa7_harborgrid-justin-rusty-db__src-transaction-lock_manager.rs.rs`'s
//! wait-queue condvar).

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LatchState {
    readers: u32,
    writer: bool,
}

/// Multi-reader/single-writer latch. Identity matters — two handles to
/// the same `Arc<Latch>` are "the same latch" for the purposes of the
/// manager's collision detection (see [`Latch::ptr_eq`]).
#[derive(Debug)]
pub struct Latch {
    state: Mutex<LatchState>,
    condvar: Condvar,
    reader_threads: Mutex<HashSet<ThreadId>>,
}

/// Held read acquisition. Releases on drop.
#[derive(Debug)]
pub struct LatchReadGuard {
    latch: Arc<Latch>,
    thread: ThreadId,
}

/// Held write acquisition. Releases on drop.
#[derive(Debug)]
pub struct LatchWriteGuard {
    latch: Arc<Latch>,
}

impl Latch {
    /// Construct a new, unheld latch.
    #[must_use]
    pub fn new() -> Arc<Latch> {
        Arc::new(Latch {
            state: Mutex::new(LatchState::default()),
            condvar: Condvar::new(),
            reader_threads: Mutex::new(HashSet::new()),
        })
    }

    /// `true` if `a` and `b` name the same underlying latch (the stripe
    /// pool returned them for paths that hashed to the same slot).
    #[must_use]
    pub fn ptr_eq(a: &Arc<Latch>, b: &Arc<Latch>) -> bool {
        Arc::ptr_eq(a, b)
    }

    /// Acquire in read mode. Blocks while a writer holds the latch.
    ///
    /// Returns `None` if `deadline` is in the past by the time the latch
    /// becomes available (a `LockTimeout`, from the caller's point of
    /// view — the caller attaches path/mode context).
    #[must_use]
    pub fn acquire_read(self: &Arc<Self>, deadline: Option<Instant>) -> Option<LatchReadGuard> {
        let mut state = self.state.lock();
        while state.writer {
            if !Self::wait(&self.condvar, &mut state, deadline) {
                return None;
            }
        }
        state.readers += 1;
        drop(state);

        let thread = std::thread::current().id();
        self.reader_threads.lock().insert(thread);
        Some(LatchReadGuard {
            latch: Arc::clone(self),
            thread,
        })
    }

    /// Acquire in write mode. Blocks while any reader or writer holds the
    /// latch. Returns `None` on deadline expiry, as with `acquire_read`.
    #[must_use]
    pub fn acquire_write(self: &Arc<Self>, deadline: Option<Instant>) -> Option<LatchWriteGuard> {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            if !Self::wait(&self.condvar, &mut state, deadline) {
                return None;
            }
        }
        state.writer = true;
        drop(state);

        Some(LatchWriteGuard {
            latch: Arc::clone(self),
        })
    }

    /// `true` if the calling thread is tracked as currently holding a
    /// read acquisition of this latch. The release path itself never
    /// needs this — every guard already knows its own mode — but it is
    /// useful for diagnosing lock state from outside the guard that
    /// holds it.
    #[must_use]
    pub fn is_held_for_read_by(&self, thread: ThreadId) -> bool {
        self.reader_threads.lock().contains(&thread)
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        drop(state);
        self.condvar.notify_all();
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        drop(state);
        self.condvar.notify_all();
    }

    /// Wait on the condvar, respecting an optional deadline. Returns
    /// `false` if the deadline has already passed.
    fn wait(
        condvar: &Condvar,
        state: &mut parking_lot::MutexGuard<'_, LatchState>,
        deadline: Option<Instant>,
    ) -> bool {
        match deadline {
            None => {
                condvar.wait(state);
                true
            }
            Some(dl) => {
                let now = Instant::now();
                if now >= dl {
                    return false;
                }
                let _ = condvar.wait_for(state, dl - now);
                Instant::now() < dl
            }
        }
    }
}

impl Drop for LatchReadGuard {
    fn drop(&mut self) {
        self.latch.reader_threads.lock().remove(&self.thread);
        self.latch.release_read();
    }
}

impl Drop for LatchWriteGuard {
    fn drop(&mut self) {
        self.latch.release_write();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn multiple_readers_concurrent() {
        let latch = Latch::new();
        let g1 = latch.acquire_read(None).unwrap();
        let g2 = latch.acquire_read(None).unwrap();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn writer_excludes_reader() {
        let latch = Latch::new();
        let _w = latch.acquire_write(None).unwrap();
        let deadline = Some(Instant::now() + Duration::from_millis(50));
        assert!(latch.acquire_read(deadline).is_none());
    }

    #[test]
    fn reader_excludes_writer() {
        let latch = Latch::new();
        let _r = latch.acquire_read(None).unwrap();
        let deadline = Some(Instant::now() + Duration::from_millis(50));
        assert!(latch.acquire_write(deadline).is_none());
    }

    #[test]
    fn write_then_read_succeeds_after_release() {
        let latch = Latch::new();
        let w = latch.acquire_write(None).unwrap();
        drop(w);
        assert!(latch.acquire_read(None).is_some());
    }

    #[test]
    fn is_held_for_read_by_tracks_current_thread() {
        let latch = Latch::new();
        let thread = std::thread::current().id();
        assert!(!latch.is_held_for_read_by(thread));
        let guard = latch.acquire_read(None).unwrap();
        assert!(latch.is_held_for_read_by(thread));
        drop(guard);
        assert!(!latch.is_held_for_read_by(thread));
    }

    #[test]
    fn writer_blocks_until_readers_drain() {
        let latch = Latch::new();
        let r = latch.acquire_read(None).unwrap();
        let latch2 = Arc::clone(&latch);
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = Arc::clone(&barrier);
        let handle = std::thread::spawn(move || {
            barrier2.wait();
            let _w = latch2.acquire_write(None).unwrap();
        });
        barrier.wait();
        std::thread::sleep(Duration::from_millis(20));
        drop(r);
        handle.join().unwrap();
    }
}
