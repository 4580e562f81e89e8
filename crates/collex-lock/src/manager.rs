//! # Lock Manager
//!
//! Orchestrates hierarchical lock coupling ("crabbing") over the
//! collection stripe pool, and flat ascending-order locking over a
//! separate document stripe pool. Every acquisition and release is
//! recorded in the [`crate::lock_table::LockTable`] and reflected in
//! [`crate::stats::LockManagerStats`].
//!
//! Deadlock avoidance here is entirely by acquisition *ordering*
//! (top-down root→leaf for collections, ascending numeric id for
//! documents) — there is no wait-for graph, no cycle detection, and no
//! timeout-based deadlock recovery beyond the plain per-call deadline.
//! A system that needs to detect deadlocks that ordering didn't
//! prevent is a different, bigger problem than this crate solves.

use std::time::{Duration, Instant};

use crate::config::LockManagerConfig;
use crate::error::{LockError, LockMode, LockResult};
use crate::latch::Latch;
use crate::lock_table::LockTable;
use crate::managed_lock::{HeldGuard, ManagedLock};
use crate::path::CollectionPath;
use crate::stats::LockManagerStats;
use crate::stripe::StripePool;

/// Identifies a document within a collection for the purposes of
/// [`LockManager::lock_document_set`]. Plain `u64`: documents are
/// addressed by a flat numeric id, not a path, so there is no ancestor
/// chain to couple through — only an ascending order to acquire in.
pub type DocumentId = u64;

struct Step {
    path: CollectionPath,
    mode: LockMode,
    retain: bool,
}

/// A physical latch acquisition made during one traversal, together
/// with every logical path merged onto it. Usually a single path, but
/// when an ancestor and a descendant hash onto the same stripe the
/// second is merged in rather than causing a second acquire — see
/// `advance`'s `collided` branch.
struct Held {
    latch: std::sync::Arc<Latch>,
    guard: HeldGuard,
    paths: Vec<CollectionPath>,
    mode: LockMode,
    retain: bool,
}

fn mode_satisfies(held: LockMode, requested: LockMode) -> bool {
    held == requested || held == LockMode::Write
}

/// Hierarchical collection lock manager.
///
/// Construct one per database instance and share it (behind an `Arc`,
/// if more than one thread needs it) across every collection access.
#[derive(Debug)]
pub struct LockManager {
    collection_stripes: StripePool,
    document_stripes: StripePool,
    lock_table: LockTable,
    stats: LockManagerStats,
    default_timeout: Option<Duration>,
}

impl LockManager {
    /// Build a manager with default configuration.
    ///
    /// # Errors
    ///
    /// Never fails with the default configuration; kept fallible for
    /// symmetry with [`Self::with_config`], whose validation can.
    pub fn new() -> LockResult<Self> {
        Self::with_config(LockManagerConfig::default())
    }

    /// Build a manager with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `LockError::InvalidConfig` if any field in `config` is
    /// out of range (see [`LockManagerConfig`]).
    pub fn with_config(config: LockManagerConfig) -> LockResult<Self> {
        config.validate()?;
        Ok(LockManager {
            collection_stripes: StripePool::new(config.concurrency_level)?,
            document_stripes: StripePool::new(config.document_concurrency_level)?,
            lock_table: LockTable::new(config.event_queue_capacity),
            stats: LockManagerStats::default(),
            default_timeout: config.lock_timeout,
        })
    }

    /// Running counters of lock activity.
    #[must_use]
    pub fn stats(&self) -> &LockManagerStats {
        &self.stats
    }

    /// The process-wide event ledger. Register a listener here to
    /// observe every attempt, acquisition, timeout, and release this
    /// manager performs.
    #[must_use]
    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    /// Raw accessor for the stripe latch backing `path`, bypassing the
    /// coupling protocol entirely. Intended for diagnostics and tests
    /// that want to assert on latch identity (for example, confirming
    /// two paths collide onto the same stripe) — not for acquiring locks.
    ///
    /// # Errors
    ///
    /// Returns `LockError::InvalidPath` if `path` is malformed.
    pub fn get_collection_latch(&self, path: &str) -> LockResult<std::sync::Arc<Latch>> {
        let path = CollectionPath::parse(path)?;
        Ok(self.collection_stripes.latch_for(&path))
    }

    /// Acquire a read lock on `path`, coupling through every ancestor
    /// on the way down and releasing each as soon as the next one is
    /// held. Only `path` itself is retained in the returned handle.
    ///
    /// # Errors
    ///
    /// Returns `LockError::InvalidPath` if `path` is malformed, or
    /// `LockError::LockTimeout` if a deadline is configured or supplied
    /// and elapses before every required latch is acquired.
    pub fn acquire_collection_read_lock(&self, path: &str) -> LockResult<ManagedLock<'_>> {
        self.acquire_collection_read_lock_with_deadline(path, self.default_deadline())
    }

    /// As [`Self::acquire_collection_read_lock`], with an explicit
    /// absolute deadline overriding the manager's configured default.
    ///
    /// # Errors
    ///
    /// Same as [`Self::acquire_collection_read_lock`].
    #[tracing::instrument(level = "debug", skip(self, deadline))]
    pub fn acquire_collection_read_lock_with_deadline(
        &self,
        path: &str,
        deadline: Option<Instant>,
    ) -> LockResult<ManagedLock<'_>> {
        let path = CollectionPath::parse(path)?;
        let ancestors = path.ancestors();
        let plan = read_plan(&ancestors);
        self.run_plan(plan, deadline)
    }

    /// Acquire a write lock on `path`. Every ancestor is read-coupled on
    /// the way down and released, except the direct parent: if
    /// `lock_parent` is `true`, the parent is acquired in write mode and
    /// retained in the returned handle (released after `path` itself);
    /// otherwise the parent is only coupled through, same as any other
    /// ancestor.
    ///
    /// # Errors
    ///
    /// Same as [`Self::acquire_collection_read_lock`].
    pub fn acquire_collection_write_lock(
        &self,
        path: &str,
        lock_parent: bool,
    ) -> LockResult<ManagedLock<'_>> {
        self.acquire_collection_write_lock_with_deadline(path, lock_parent, self.default_deadline())
    }

    /// As [`Self::acquire_collection_write_lock`], with an explicit
    /// absolute deadline overriding the manager's configured default.
    ///
    /// # Errors
    ///
    /// Same as [`Self::acquire_collection_read_lock`].
    #[tracing::instrument(level = "debug", skip(self, deadline))]
    pub fn acquire_collection_write_lock_with_deadline(
        &self,
        path: &str,
        lock_parent: bool,
        deadline: Option<Instant>,
    ) -> LockResult<ManagedLock<'_>> {
        let path = CollectionPath::parse(path)?;
        let ancestors = path.ancestors();
        let plan = write_plan(&ancestors, lock_parent);
        self.run_plan(plan, deadline)
    }

    /// Lock a set of documents together, avoiding deadlock by always
    /// acquiring in ascending id order regardless of the order `ids`
    /// were supplied in. Duplicate ids are locked once. All locks in
    /// the set are retained in the returned handle and released
    /// together on disposal.
    ///
    /// # Errors
    ///
    /// Returns `LockError::LockTimeout` if a deadline is configured or
    /// supplied and elapses before every document in the set is locked;
    /// every document latch already acquired for this call is released
    /// before the error is returned.
    pub fn lock_document_set(
        &self,
        ids: &[DocumentId],
        mode: LockMode,
    ) -> LockResult<ManagedLock<'_>> {
        self.lock_document_set_with_deadline(ids, mode, self.default_deadline())
    }

    /// As [`Self::lock_document_set`], with an explicit absolute
    /// deadline overriding the manager's configured default.
    ///
    /// # Errors
    ///
    /// Same as [`Self::lock_document_set`].
    #[tracing::instrument(level = "debug", skip(self, deadline))]
    pub fn lock_document_set_with_deadline(
        &self,
        ids: &[DocumentId],
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> LockResult<ManagedLock<'_>> {
        let mut sorted: Vec<DocumentId> = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let group_id = self.lock_table.new_group_id();
        let mut handle = ManagedLock::new(&self.lock_table, group_id);

        for id in sorted {
            // Documents share the same canonical-path machinery as
            // collections purely so every ledger entry has a `CollectionPath`
            // to report; the `/db/__doc__/<id>` string is never parsed back.
            let label = CollectionPath::parse(&format!("/db/__doc__/{id}"))?;
            let latch = self.document_stripes.latch_for_key(&id);

            self.stats.record_attempt();
            self.lock_table.record_attempt(&label, mode, group_id);

            if handle.merge_into_held(&latch, label.clone()) {
                // Same physical latch as an id already locked by this
                // call: no second acquire against the primitive, but
                // `label` is still a distinct logical id and needs its
                // own `Acquired` now and `Released` on disposal.
                self.stats.record_acquired();
                self.lock_table.record_acquired(&label, mode, group_id);
                continue;
            }

            let guard = match mode {
                LockMode::Read => latch.acquire_read(deadline).map(HeldGuard::Read),
                LockMode::Write => latch.acquire_write(deadline).map(HeldGuard::Write),
            };
            let Some(guard) = guard else {
                self.stats.record_timeout();
                self.lock_table.record_failed(&label, mode, group_id);
                // `handle` drops here, releasing (and reporting `Released`
                // for) every document already acquired by this call,
                // including any merged onto a shared stripe.
                return Err(LockError::LockTimeout { path: label, mode });
            };
            self.stats.record_acquired();
            self.lock_table.record_acquired(&label, mode, group_id);
            handle.push(vec![label], mode, latch, guard);
        }

        Ok(handle)
    }

    fn default_deadline(&self) -> Option<Instant> {
        self.default_timeout.map(|timeout| Instant::now() + timeout)
    }

    fn run_plan(&self, plan: Vec<Step>, deadline: Option<Instant>) -> LockResult<ManagedLock<'_>> {
        let group_id = self.lock_table.new_group_id();
        let mut handle = ManagedLock::new(&self.lock_table, group_id);

        let mut prev: Option<Held> = None;
        let mut retained: Vec<Held> = Vec::with_capacity(2);

        for step in plan {
            if let Err(err) = self.advance(step, deadline, group_id, &mut prev, &mut retained) {
                Self::release_all(retained, group_id, &self.lock_table, &self.stats);
                if let Some(p) = prev {
                    Self::release_one(p, group_id, &self.lock_table, &self.stats);
                }
                return Err(err);
            }
        }
        if let Some(p) = prev.take() {
            retained.push(p);
        }

        for held in retained {
            handle.push(held.paths, held.mode, held.latch, held.guard);
        }
        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    fn advance(
        &self,
        step: Step,
        deadline: Option<Instant>,
        group_id: u64,
        prev: &mut Option<Held>,
        retained: &mut Vec<Held>,
    ) -> LockResult<()> {
        let latch = self.collection_stripes.latch_for(&step.path);
        self.stats.record_attempt();
        self.lock_table.record_attempt(&step.path, step.mode, group_id);

        let collided = prev
            .as_ref()
            .is_some_and(|p| Latch::ptr_eq(&p.latch, &latch));

        if collided {
            // `collided` is only true when `prev` is `Some`.
            let Some(mut held) = prev.take() else {
                return Ok(());
            };
            if mode_satisfies(held.mode, step.mode) {
                self.stats.record_acquired();
                self.lock_table.record_acquired(&step.path, step.mode, group_id);
                // Same physical latch as the ancestor just held: no
                // second acquire, but `step.path` is still a distinct
                // logical node and needs its own `Released` event later.
                held.paths.push(step.path);
                held.retain = held.retain || step.retain;
                *prev = Some(held);
                return Ok(());
            }
            // Same latch, but a stronger mode is needed than what this
            // traversal already holds on it: release every logical path
            // merged onto it and reacquire fresh. A brief gap with the
            // stripe unheld is unavoidable here — the underlying latch is
            // not reentrant and upgrade is forbidden by design (see
            // module docs) — but this only happens when two logical
            // nodes collide onto one stripe, not on the normal coupling
            // path below.
            Self::release_one(held, group_id, &self.lock_table, &self.stats);
        }

        // Coupling: acquire the child's latch *before* releasing the
        // parent's, so the descent never has a window with nothing held.
        // `prev` (the parent) is released only after this succeeds.
        let guard = match step.mode {
            LockMode::Read => latch.acquire_read(deadline).map(HeldGuard::Read),
            LockMode::Write => latch.acquire_write(deadline).map(HeldGuard::Write),
        };
        let Some(guard) = guard else {
            self.stats.record_timeout();
            self.lock_table.record_failed(&step.path, step.mode, group_id);
            return Err(LockError::LockTimeout {
                path: step.path,
                mode: step.mode,
            });
        };
        self.stats.record_acquired();
        self.lock_table.record_acquired(&step.path, step.mode, group_id);

        if !collided {
            if let Some(held) = prev.take() {
                if held.retain {
                    retained.push(held);
                } else {
                    Self::release_one(held, group_id, &self.lock_table, &self.stats);
                }
            }
        }

        *prev = Some(Held {
            latch,
            guard,
            paths: vec![step.path],
            mode: step.mode,
            retain: step.retain,
        });
        Ok(())
    }

    /// Emits one `Released` event (and one stats tick) per logical path
    /// merged onto `held`, not just the latest one — matching the
    /// symmetric `Attempt`/`Acquired` pair every merged path already
    /// received in `advance`.
    fn release_one(held: Held, group_id: u64, table: &LockTable, stats: &LockManagerStats) {
        for path in &held.paths {
            table.record_released(path, held.mode, group_id);
            stats.record_released();
        }
        drop(held.guard);
    }

    fn release_all(held: Vec<Held>, group_id: u64, table: &LockTable, stats: &LockManagerStats) {
        for h in held {
            Self::release_one(h, group_id, table, stats);
        }
    }
}

/// Every ancestor, including `path` itself, read-coupled down to the
/// target which alone is retained.
fn read_plan(ancestors: &[CollectionPath]) -> Vec<Step> {
    ancestors
        .iter()
        .enumerate()
        .map(|(idx, p)| Step {
            path: p.clone(),
            mode: LockMode::Read,
            retain: idx + 1 == ancestors.len(),
        })
        .collect()
}

/// Ancestors strictly above the direct parent are read-coupled and
/// released; the direct parent is acquired in write mode and retained
/// if `lock_parent`, otherwise just coupled through like any other
/// ancestor; the target is always acquired in write mode and retained.
fn write_plan(ancestors: &[CollectionPath], lock_parent: bool) -> Vec<Step> {
    let n = ancestors.len();
    if n == 1 {
        return vec![Step {
            path: ancestors[0].clone(),
            mode: LockMode::Write,
            retain: true,
        }];
    }

    let mut plan = Vec::with_capacity(n);
    for path in &ancestors[..n.saturating_sub(2)] {
        plan.push(Step {
            path: path.clone(),
            mode: LockMode::Read,
            retain: false,
        });
    }
    plan.push(Step {
        path: ancestors[n - 2].clone(),
        mode: if lock_parent { LockMode::Write } else { LockMode::Read },
        retain: lock_parent,
    });
    plan.push(Step {
        path: ancestors[n - 1].clone(),
        mode: LockMode::Write,
        retain: true,
    });
    plan
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn read_lock_root_only() {
        let manager = LockManager::new().unwrap();
        let handle = manager.acquire_collection_read_lock("/db").unwrap();
        let root = CollectionPath::parse("/db").unwrap();
        assert!(handle.holds(&root));
    }

    #[test]
    fn read_lock_retains_only_target() {
        let manager = LockManager::new().unwrap();
        let handle = manager
            .acquire_collection_read_lock("/db/colA/colB")
            .unwrap();
        let target = CollectionPath::parse("/db/colA/colB").unwrap();
        let parent = CollectionPath::parse("/db/colA").unwrap();
        assert!(handle.holds(&target));
        assert!(!handle.holds(&parent));
    }

    #[test]
    fn write_lock_without_parent_retains_only_target() {
        let manager = LockManager::new().unwrap();
        let handle = manager
            .acquire_collection_write_lock("/db/colA/colB", false)
            .unwrap();
        let target = CollectionPath::parse("/db/colA/colB").unwrap();
        let parent = CollectionPath::parse("/db/colA").unwrap();
        assert!(handle.holds(&target));
        assert!(!handle.holds(&parent));
    }

    #[test]
    fn write_lock_with_parent_retains_both() {
        let manager = LockManager::new().unwrap();
        let handle = manager
            .acquire_collection_write_lock("/db/colA/colB", true)
            .unwrap();
        let target = CollectionPath::parse("/db/colA/colB").unwrap();
        let parent = CollectionPath::parse("/db/colA").unwrap();
        assert!(handle.holds(&target));
        assert!(handle.holds(&parent));
    }

    #[test]
    fn releasing_read_lock_allows_subsequent_write() {
        let manager = LockManager::new().unwrap();
        {
            let _handle = manager.acquire_collection_read_lock("/db/colA").unwrap();
        }
        let handle = manager
            .acquire_collection_write_lock("/db/colA", false)
            .unwrap();
        drop(handle);
    }

    #[test]
    fn concurrent_writers_on_distinct_subtrees_both_succeed() {
        let manager = std::sync::Arc::new(LockManager::new().unwrap());
        let a = std::sync::Arc::clone(&manager);
        let b = std::sync::Arc::clone(&manager);
        let t1 = std::thread::spawn(move || {
            let _h = a.acquire_collection_write_lock("/db/colA", false).unwrap();
        });
        let t2 = std::thread::spawn(move || {
            let _h = b.acquire_collection_write_lock("/db/colB", false).unwrap();
        });
        t1.join().unwrap();
        t2.join().unwrap();
    }

    #[test]
    fn write_lock_on_sibling_subtree_blocks_until_released() {
        let manager = std::sync::Arc::new(LockManager::new().unwrap());
        let holder = manager
            .acquire_collection_write_lock("/db/colA", true)
            .unwrap();

        let waiter_manager = std::sync::Arc::clone(&manager);
        let handle = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(50);
            waiter_manager.acquire_collection_write_lock_with_deadline("/db/colA", true, Some(deadline))
        });
        let result = handle.join().unwrap();
        assert!(result.is_err());
        drop(holder);
    }

    #[test]
    fn document_set_locks_in_ascending_order_regardless_of_input_order() {
        let manager = LockManager::new().unwrap();
        let handle = manager
            .lock_document_set(&[5, 1, 3, 1], LockMode::Write)
            .unwrap();
        drop(handle);
    }

    #[test]
    fn document_set_timeout_releases_partial_acquisitions() {
        let manager = std::sync::Arc::new(LockManager::new().unwrap());
        let held = manager.lock_document_set(&[7], LockMode::Write).unwrap();

        let waiter = std::sync::Arc::clone(&manager);
        let handle = std::thread::spawn(move || {
            let deadline = Some(Instant::now() + Duration::from_millis(50));
            waiter.lock_document_set_with_deadline(&[1, 7, 20], LockMode::Write, deadline)
        });
        let result = handle.join().unwrap();
        assert!(result.is_err());
        drop(held);

        // Documents 1 and 20 must have been released after the timeout on
        // document 7, not left dangling.
        let retry = manager
            .lock_document_set(&[1, 20], LockMode::Write)
            .unwrap();
        drop(retry);
    }

    #[test]
    fn get_collection_latch_is_stable_and_matches_traversal() {
        let manager = LockManager::new().unwrap();
        let a = manager.get_collection_latch("/db/colA").unwrap();
        let b = manager.get_collection_latch("/db/colA").unwrap();
        assert!(Latch::ptr_eq(&a, &b));
        assert!(manager.get_collection_latch("not-a-path").is_err());
    }

    struct RecordingListener {
        events: std::sync::Mutex<Vec<(crate::lock_table::LockEventKind, String, LockMode)>>,
    }

    impl crate::lock_table::LockEventListener for RecordingListener {
        fn on_event(&self, event: &crate::lock_table::LockEvent) {
            self.events.lock().unwrap().push((
                event.kind,
                event.path.as_str().to_owned(),
                event.mode,
            ));
        }
    }

    fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(predicate(), "condition never became true in time");
    }

    /// Reproduces scenario S2 from the lock manager's test matrix: a
    /// depth-2 read acquisition must couple the child in before the
    /// parent is released, never the reverse.
    #[test]
    fn read_depth_two_matches_s2_event_order() {
        use crate::lock_table::LockEventKind::{Acquired, Attempt, Released};

        let manager = LockManager::new().unwrap();
        let listener = std::sync::Arc::new(RecordingListener {
            events: std::sync::Mutex::new(Vec::new()),
        });
        manager.lock_table().register("s2", std::sync::Arc::clone(&listener) as std::sync::Arc<dyn crate::lock_table::LockEventListener>);
        wait_for(|| manager.lock_table().is_registered("s2"));

        let handle = manager.acquire_collection_read_lock("/db/colA").unwrap();
        drop(handle);
        wait_for(|| listener.events.lock().unwrap().len() >= 6);

        let events = listener.events.lock().unwrap();
        let kinds: Vec<_> = events.iter().map(|(k, p, m)| (*k, p.as_str(), *m)).collect();
        assert_eq!(
            kinds,
            vec![
                (Attempt, "/db", LockMode::Read),
                (Acquired, "/db", LockMode::Read),
                (Attempt, "/db/colA", LockMode::Read),
                (Acquired, "/db/colA", LockMode::Read),
                (Released, "/db", LockMode::Read),
                (Released, "/db/colA", LockMode::Read),
            ]
        );
    }

    /// Reproduces S7: a depth-3 write with `lock_parent = true` couples
    /// and releases the root mid-traversal, then retains the parent and
    /// target, releasing target before parent on dispose — 9 events
    /// total, not 11.
    #[test]
    fn write_depth_three_lock_parent_matches_s7_event_count_and_order() {
        use crate::lock_table::LockEventKind::{Acquired, Attempt, Released};

        let manager = LockManager::new().unwrap();
        let listener = std::sync::Arc::new(RecordingListener {
            events: std::sync::Mutex::new(Vec::new()),
        });
        manager.lock_table().register("s7", std::sync::Arc::clone(&listener) as std::sync::Arc<dyn crate::lock_table::LockEventListener>);
        wait_for(|| manager.lock_table().is_registered("s7"));

        let handle = manager
            .acquire_collection_write_lock("/db/colA/colB", true)
            .unwrap();
        drop(handle);
        wait_for(|| listener.events.lock().unwrap().len() >= 9);

        let events = listener.events.lock().unwrap();
        let kinds: Vec<_> = events.iter().map(|(k, p, m)| (*k, p.as_str(), *m)).collect();
        assert_eq!(kinds.len(), 9);
        assert_eq!(
            kinds,
            vec![
                (Attempt, "/db", LockMode::Read),
                (Acquired, "/db", LockMode::Read),
                (Attempt, "/db/colA", LockMode::Write),
                (Acquired, "/db/colA", LockMode::Write),
                (Released, "/db", LockMode::Read),
                (Attempt, "/db/colA/colB", LockMode::Write),
                (Acquired, "/db/colA/colB", LockMode::Write),
                (Released, "/db/colA/colB", LockMode::Write),
                (Released, "/db/colA", LockMode::Write),
            ]
        );
    }
}
