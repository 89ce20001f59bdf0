//! Keyed memoizing cache with single-flight loading and preemptible refresh.
//!
//! Each key owns a slot holding its current generation, the cancel handle of
//! the in-flight computation (if any) and the last committed outcome. Only the
//! computation holding the slot's current generation may commit; anything
//! else finishing late is discarded. Slots are locked individually so
//! unrelated keys never serialize each other.
//!
//! The first [`get`](CancelableLoadingCache::get) of a key computes on the
//! caller's thread. [`refresh_async`](CancelableLoadingCache::refresh_async)
//! runs on a per-cache background thread, spawned on first use.

use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::cancel::{CancelChecker, CancelHandle};
use crate::error::is_cancellation;

// ---------------------------------------------------------------------------
// Public contracts
// ---------------------------------------------------------------------------

/// Receives committed value changes.
///
/// Called synchronously by whichever thread commits the change, at most once
/// per committed transition and only when the new value differs from the
/// previously visible one.
pub trait CacheListener<K, V>: Send + Sync {
    fn after_value_changed(&self, key: &K, old: Option<&V>, new: &V);
}

impl<K, V, F> CacheListener<K, V> for F
where
    F: Fn(&K, Option<&V>, &V) + Send + Sync,
{
    fn after_value_changed(&self, key: &K, old: Option<&V>, new: &V) {
        self(key, old, new);
    }
}

type ComputeFn<K, V> = dyn Fn(&K, &CancelChecker) -> anyhow::Result<V> + Send + Sync;

/// A computation failure shared by every caller that observes it.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// The error returned by the compute function.
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = &**self.0;
        inner.source()
    }
}

/// Errors returned by [`CancelableLoadingCache::get`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The committed computation for the key failed. Returned on every `get`
    /// until a refresh commits a value.
    #[error("computation in cache '{cache}' failed: {source}")]
    ComputationFailed {
        cache: String,
        #[source]
        source: SharedError,
    },
    /// The computation started by this call canceled itself without being
    /// superseded. Nothing was committed; the next `get` recomputes.
    #[error("computation in cache '{0}' was canceled")]
    Canceled(String),
    /// The cache was closed.
    #[error("cache '{0}' is closed")]
    Closed(String),
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

struct SlotState<V> {
    generation: u64,
    loading: Option<CancelHandle>,
    committed: Option<Result<V, SharedError>>,
}

struct Slot<V> {
    state: Mutex<SlotState<V>>,
    settled: Condvar,
    /// Generation of the last change handed to the listener.
    notified: Mutex<u64>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                generation: 0,
                loading: None,
                committed: None,
            }),
            settled: Condvar::new(),
            notified: Mutex::new(0),
        }
    }

    /// Moves the slot to a new generation, canceling whatever was in flight.
    /// Returns the new generation.
    fn supersede(state: &mut SlotState<V>) -> u64 {
        state.generation += 1;
        if let Some(previous) = state.loading.take() {
            previous.cancel();
        }
        state.generation
    }
}

struct RefreshJob<K> {
    key: K,
    generation: u64,
    cancel: CancelChecker,
}

struct RefreshWorker<K> {
    tx: mpsc::UnboundedSender<RefreshJob<K>>,
    handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared<K, V> {
    name: String,
    slots: DashMap<K, Arc<Slot<V>>>,
    compute: Box<ComputeFn<K, V>>,
    listener: Box<dyn CacheListener<K, V>>,
    closed: AtomicBool,
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn slot(&self, key: &K) -> Arc<Slot<V>> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new()))
                .value(),
        )
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn compute_guarded(&self, key: &K, checker: &CancelChecker) -> anyhow::Result<V> {
        match catch_unwind(AssertUnwindSafe(|| (self.compute)(key, checker))) {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!("compute function panicked")),
        }
    }

    /// Commits `outcome` if `generation` is still current. Returns `true` when
    /// the outcome was a cancellation left uncommitted.
    fn commit(&self, key: &K, slot: &Slot<V>, generation: u64, outcome: anyhow::Result<V>) -> bool {
        let mut state = slot.state.lock();
        if state.generation != generation {
            debug!(
                cache = %self.name,
                ?key,
                generation,
                current = state.generation,
                "discarding superseded computation"
            );
            return false;
        }
        state.loading = None;
        let change = match outcome {
            Ok(value) => {
                let old = match state.committed.replace(Ok(value.clone())) {
                    Some(Ok(old)) => Some(old),
                    _ => None,
                };
                if old.as_ref() == Some(&value) {
                    None
                } else {
                    Some((old, value))
                }
            }
            Err(err) if is_cancellation(&err) => {
                // Keeps the previous outcome; an empty slot is recomputed.
                debug!(cache = %self.name, ?key, generation, "computation canceled itself");
                drop(state);
                slot.settled.notify_all();
                return true;
            }
            Err(err) => {
                warn!(cache = %self.name, ?key, generation, error = %err, "computation failed");
                state.committed = Some(Err(SharedError::new(err)));
                None
            }
        };
        drop(state);
        slot.settled.notify_all();

        if let Some((old, new)) = change {
            let mut notified = slot.notified.lock();
            if *notified > generation {
                trace!(cache = %self.name, ?key, generation, "newer change already notified");
                return false;
            }
            *notified = generation;
            self.listener.after_value_changed(key, old.as_ref(), &new);
        }
        false
    }

    /// Releases waiters of a generation that will never run.
    fn abandon(&self, slot: &Slot<V>, generation: u64) {
        let mut state = slot.state.lock();
        if state.generation == generation {
            state.loading = None;
        }
        drop(state);
        slot.settled.notify_all();
    }

    fn run_refresh(&self, job: RefreshJob<K>) {
        if job.cancel.is_canceled() || self.is_closed() {
            trace!(cache = %self.name, key = ?job.key, generation = job.generation, "skipping canceled refresh");
            return;
        }
        let Some(slot) = self.slots.get(&job.key).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let outcome = self.compute_guarded(&job.key, &job.cancel);
        self.commit(&job.key, &slot, job.generation, outcome);
    }
}

// ---------------------------------------------------------------------------
// CancelableLoadingCache
// ---------------------------------------------------------------------------

/// Keyed, single-flight, asynchronously refreshable memoizing cache.
///
/// The compute function receives a [`CancelChecker`] and is trusted to return
/// promptly (typically with [`Canceled`](crate::Canceled)) once it reports
/// canceled.
pub struct CancelableLoadingCache<K: Eq + Hash, V> {
    shared: Arc<Shared<K, V>>,
    worker: Mutex<Option<RefreshWorker<K>>>,
}

impl<K: Eq + Hash, V> fmt::Debug for CancelableLoadingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelableLoadingCache")
            .field("name", &self.shared.name)
            .field("keys", &self.shared.slots.len())
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K, V> CancelableLoadingCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates an empty cache. `name` identifies the cache in logs and names
    /// its refresh thread.
    pub fn new<F, L>(name: impl Into<String>, compute: F, listener: L) -> Self
    where
        F: Fn(&K, &CancelChecker) -> anyhow::Result<V> + Send + Sync + 'static,
        L: CacheListener<K, V> + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                slots: DashMap::new(),
                compute: Box::new(compute),
                listener: Box::new(listener),
                closed: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the value for `key`, computing it if needed.
    ///
    /// If nothing was ever loaded, computes on the calling thread. If a
    /// computation is in flight, blocks until the key's current generation
    /// settles, following any refresh that supersedes it in the meantime.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ComputationFailed`] while the committed outcome
    /// is a failure, [`CacheError::Canceled`] if the computation run by this
    /// call canceled itself, and [`CacheError::Closed`] once the cache is
    /// closed.
    pub fn get(&self, key: &K) -> Result<V, CacheError> {
        let shared = &self.shared;
        let slot = shared.slot(key);
        loop {
            let mut state = slot.state.lock();
            loop {
                if shared.is_closed() {
                    return Err(CacheError::Closed(shared.name.clone()));
                }
                if state.loading.is_some() {
                    slot.settled.wait(&mut state);
                    continue;
                }
                match &state.committed {
                    Some(Ok(value)) => return Ok(value.clone()),
                    Some(Err(err)) => {
                        return Err(CacheError::ComputationFailed {
                            cache: shared.name.clone(),
                            source: err.clone(),
                        })
                    }
                    None => break,
                }
            }

            let generation = Slot::supersede(&mut state);
            let handle = CancelHandle::new();
            let checker = handle.checker();
            state.loading = Some(handle);
            drop(state);

            trace!(cache = %shared.name, ?key, generation, "loading on caller thread");
            let outcome = shared.compute_guarded(key, &checker);
            if shared.commit(key, &slot, generation, outcome) {
                return Err(CacheError::Canceled(shared.name.clone()));
            }
        }
    }

    /// Starts recomputing `key` in the background and returns immediately.
    ///
    /// A computation already in flight for `key` is signaled canceled and its
    /// result, whenever it arrives, is discarded. Callers blocked in
    /// [`get`](Self::get) receive the new computation's outcome.
    pub fn refresh_async(&self, key: K) {
        let shared = &self.shared;
        if shared.is_closed() {
            debug!(cache = %shared.name, ?key, "ignoring refresh on closed cache");
            return;
        }
        let slot = shared.slot(&key);
        let job = {
            let mut state = slot.state.lock();
            let generation = Slot::supersede(&mut state);
            let handle = CancelHandle::new();
            let job = RefreshJob {
                key,
                generation,
                cancel: handle.checker(),
            };
            state.loading = Some(handle);
            job
        };
        let generation = job.generation;
        if !self.submit(job) {
            shared.abandon(&slot, generation);
        }
    }

    /// Forgets `key`: cancels its in-flight computation and drops its value.
    /// The next `get` recomputes, including for callers already waiting.
    pub fn clear(&self, key: &K) {
        let Some(slot) = self.shared.slots.get(key).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut state = slot.state.lock();
        Slot::supersede(&mut state);
        state.committed = None;
        drop(state);
        slot.settled.notify_all();
    }

    /// Cancels every in-flight computation and stops the refresh thread.
    ///
    /// Refreshes queued but not started never run. Every current and future
    /// `get` returns [`CacheError::Closed`]. Idempotent.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let slots: Vec<Arc<Slot<V>>> = shared
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for slot in slots {
            let mut state = slot.state.lock();
            Slot::supersede(&mut state);
            drop(state);
            slot.settled.notify_all();
        }

        if let Some(worker) = self.worker.lock().take() {
            drop(worker.tx);
            if worker.handle.thread().id() == std::thread::current().id() {
                // Closed from a listener or compute function running on the
                // worker; it exits on its own once the channel drains.
                return;
            }
            if worker.handle.join().is_err() {
                error!(cache = %shared.name, "refresh worker panicked");
            }
        }
        debug!(cache = %shared.name, "cache closed");
    }

    fn submit(&self, job: RefreshJob<K>) -> bool {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            if self.shared.is_closed() {
                return false;
            }
            match self.spawn_worker() {
                Ok(spawned) => *worker = Some(spawned),
                Err(err) => {
                    error!(cache = %self.shared.name, error = %err, "failed to spawn refresh worker");
                    return false;
                }
            }
        }
        match worker.as_ref() {
            Some(w) => w.tx.send(job).is_ok(),
            None => false,
        }
    }

    fn spawn_worker(&self) -> std::io::Result<RefreshWorker<K>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RefreshJob<K>>();
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("{}-refresh", self.shared.name))
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    shared.run_refresh(job);
                }
            })?;
        Ok(RefreshWorker { tx, handle })
    }
}

impl<K: Eq + Hash, V> Drop for CancelableLoadingCache<K, V> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        for entry in self.shared.slots.iter() {
            let slot = entry.value();
            Slot::supersede(&mut slot.state.lock());
            slot.settled.notify_all();
        }
        if let Some(worker) = self.worker.get_mut().take() {
            drop(worker.tx);
            if worker.handle.thread().id() != std::thread::current().id() {
                let _ = worker.handle.join();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
