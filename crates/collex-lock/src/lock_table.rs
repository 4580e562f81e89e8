//! # Lock Table
//!
//! A process-wide, append-only ledger of lock activity. Every latch
//! attempt, acquisition, failure, and release the manager performs is
//! recorded here as a [`LockEvent`] and fanned out asynchronously to
//! whatever diagnostic listeners are currently registered — a tracing
//! exporter, a deadlock-pattern detector, a test harness collecting an
//! expected event trace.
//!
//! Dispatch runs on one dedicated background thread so that recording
//! an event never blocks the thread actually holding the latch. The
//! queue between the two is bounded: under sustained listener slowness
//! the oldest *event* is dropped to make room for the newest (the
//! manager's own latch bookkeeping never depends on the ledger, so a
//! dropped diagnostic event is lossy but harmless). Registration
//! commands are never dropped — losing a listener registration would be
//! a correctness problem for whoever is waiting on [`LockTable::is_registered`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::LockMode;
use crate::path::CollectionPath;

/// The kind of activity a [`LockEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockEventKind {
    /// A latch acquisition was requested but has not yet succeeded.
    Attempt,
    /// A latch was successfully acquired.
    Acquired,
    /// A latch acquisition failed (deadline elapsed).
    Failed,
    /// A previously acquired latch was released.
    Released,
}

/// One entry in the lock table's ledger.
#[derive(Debug, Clone)]
pub struct LockEvent {
    /// What happened.
    pub kind: LockEventKind,
    /// The collection path the event concerns.
    pub path: CollectionPath,
    /// Read or write.
    pub mode: LockMode,
    /// The thread that performed the action.
    pub thread_id: ThreadId,
    /// Monotonic nanosecond timestamp, relative to process start.
    pub timestamp_ns: u64,
    /// Identifies which logical lock request (possibly spanning several
    /// coupled latches) this event belongs to.
    pub group_id: u64,
}

/// Receives fanned-out lock events. Implementations must not block for
/// long — the dispatcher thread is shared by every registered listener.
pub trait LockEventListener: Send + Sync {
    /// Handle one event. Panics are caught by the dispatcher and turned
    /// into a `tracing` warning; they never take down the dispatcher
    /// thread or propagate to the thread that recorded the event.
    fn on_event(&self, event: &LockEvent);

    /// Called on the dispatcher thread once this listener's `register`
    /// has taken effect. Poll [`LockTable::is_registered`] rather than
    /// relying on this firing synchronously with the call that triggered
    /// it — the two threads observe it at different times by design.
    fn registered(&self) {}

    /// Called on the dispatcher thread once this listener's `deregister`
    /// has taken effect. Default no-op, mirroring [`Self::registered`].
    fn unregistered(&self) {}
}

/// Default capacity for [`LockTable::instance`]'s bounded event queue,
/// matching this crate's documented `event_dispatcher_queue_capacity`
/// default.
const DEFAULT_QUEUE_CAPACITY: usize = 4096;

enum Command {
    Register(String, Arc<dyn LockEventListener>),
    Deregister(String),
}

struct Queue {
    events: VecDeque<LockEvent>,
    commands: VecDeque<Command>,
    shutdown: bool,
}

struct LockTableInner {
    registry: DashMap<String, Arc<dyn LockEventListener>>,
    queue: Mutex<Queue>,
    not_empty: Condvar,
    capacity: usize,
    dropped_events: AtomicU64,
    next_group_id: AtomicU64,
}

/// Process-wide lock event ledger with asynchronous listener dispatch.
pub struct LockTable {
    inner: Arc<LockTableInner>,
    dispatcher: Option<JoinHandle<()>>,
}

impl fmt::Debug for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("capacity", &self.inner.capacity)
            .field("dropped_events", &self.dropped_event_count())
            .finish()
    }
}

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn timestamp_ns() -> u64 {
    u64::try_from(process_start().elapsed().as_nanos()).unwrap_or(u64::MAX)
}

impl LockTable {
    /// The process-wide ledger, lazily started on first use with
    /// [`DEFAULT_QUEUE_CAPACITY`]. Most collaborators reach a `LockTable`
    /// through the [`crate::manager::LockManager`] that owns it instead —
    /// this accessor exists for diagnostics code that wants to observe
    /// lock activity without threading a manager reference through, and
    /// for the rare deployment that shares one ledger across managers.
    #[must_use]
    pub fn instance() -> &'static LockTable {
        static INSTANCE: OnceLock<LockTable> = OnceLock::new();
        INSTANCE.get_or_init(|| LockTable::new(DEFAULT_QUEUE_CAPACITY))
    }

    /// Build a new ledger with a dedicated dispatcher thread and a
    /// bounded event queue of `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let inner = Arc::new(LockTableInner {
            registry: DashMap::new(),
            queue: Mutex::new(Queue {
                events: VecDeque::with_capacity(capacity.max(1)),
                commands: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            capacity: capacity.max(1),
            dropped_events: AtomicU64::new(0),
            next_group_id: AtomicU64::new(1),
        });

        let dispatcher_inner = Arc::clone(&inner);
        let dispatcher = std::thread::Builder::new()
            .name("collex-lock-table".to_owned())
            .spawn(move || Self::dispatch_loop(&dispatcher_inner))
            .ok();

        LockTable { inner, dispatcher }
    }

    /// Mint a fresh identifier grouping the events of one logical lock
    /// request (which may span several coupled latch acquisitions).
    #[must_use]
    pub fn new_group_id(&self) -> u64 {
        self.inner.next_group_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Record an attempt to acquire `path` in `mode`.
    pub fn record_attempt(&self, path: &CollectionPath, mode: LockMode, group_id: u64) {
        self.push_event(LockEventKind::Attempt, path, mode, group_id);
    }

    /// Record a successful acquisition of `path` in `mode`.
    pub fn record_acquired(&self, path: &CollectionPath, mode: LockMode, group_id: u64) {
        self.push_event(LockEventKind::Acquired, path, mode, group_id);
    }

    /// Record a failed acquisition attempt (deadline elapsed).
    pub fn record_failed(&self, path: &CollectionPath, mode: LockMode, group_id: u64) {
        self.push_event(LockEventKind::Failed, path, mode, group_id);
    }

    /// Record a release of `path` held in `mode`.
    pub fn record_released(&self, path: &CollectionPath, mode: LockMode, group_id: u64) {
        self.push_event(LockEventKind::Released, path, mode, group_id);
    }

    fn push_event(&self, kind: LockEventKind, path: &CollectionPath, mode: LockMode, group_id: u64) {
        let event = LockEvent {
            kind,
            path: path.clone(),
            mode,
            thread_id: std::thread::current().id(),
            timestamp_ns: timestamp_ns(),
            group_id,
        };
        let mut queue = self.inner.queue.lock();
        if queue.events.len() >= self.inner.capacity {
            queue.events.pop_front();
            self.inner.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        queue.events.push_back(event);
        self.inner.not_empty.notify_one();
    }

    /// Register a listener under `id`. Registration is processed
    /// asynchronously by the dispatcher thread; poll [`Self::is_registered`]
    /// to observe when it has taken effect.
    pub fn register(&self, id: impl Into<String>, listener: Arc<dyn LockEventListener>) {
        let mut queue = self.inner.queue.lock();
        queue.commands.push_back(Command::Register(id.into(), listener));
        self.inner.not_empty.notify_one();
    }

    /// Deregister the listener under `id`, asynchronously as with
    /// [`Self::register`].
    pub fn deregister(&self, id: impl Into<String>) {
        let mut queue = self.inner.queue.lock();
        queue.commands.push_back(Command::Deregister(id.into()));
        self.inner.not_empty.notify_one();
    }

    /// `true` once the dispatcher thread has processed a `register` for
    /// `id` and no matching `deregister` since.
    #[must_use]
    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.registry.contains_key(id)
    }

    /// Number of events dropped so far because the queue was full.
    #[must_use]
    pub fn dropped_event_count(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::Relaxed)
    }

    /// Stop the dispatcher thread and wait for it to exit, processing
    /// any commands and events already queued beforehand. Idempotent:
    /// calling this more than once (or dropping the table afterward) is
    /// a harmless no-op once the thread has already exited.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.inner.queue.lock();
            queue.shutdown = true;
            self.inner.not_empty.notify_all();
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }

    fn dispatch_loop(inner: &Arc<LockTableInner>) {
        loop {
            let (command, event) = {
                let mut queue = inner.queue.lock();
                loop {
                    if let Some(command) = queue.commands.pop_front() {
                        break (Some(command), None);
                    }
                    if let Some(event) = queue.events.pop_front() {
                        break (None, Some(event));
                    }
                    if queue.shutdown {
                        return;
                    }
                    inner.not_empty.wait(&mut queue);
                }
            };

            if let Some(command) = command {
                match command {
                    Command::Register(id, listener) => {
                        inner.registry.insert(id, Arc::clone(&listener));
                        listener.registered();
                    }
                    Command::Deregister(id) => {
                        if let Some((_, listener)) = inner.registry.remove(&id) {
                            listener.unregistered();
                        }
                    }
                }
                continue;
            }

            let Some(event) = event else { continue };
            for entry in &inner.registry {
                let listener = Arc::clone(entry.value());
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    listener.on_event(&event);
                }));
                if let Err(panic) = outcome {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "listener panicked with a non-string payload".to_owned());
                    tracing::warn!(listener = %entry.key(), %message, "lock table listener faulted");
                }
            }
        }
    }
}

impl Drop for LockTable {
    fn drop(&mut self) {
        self.shutdown();
    }
}
