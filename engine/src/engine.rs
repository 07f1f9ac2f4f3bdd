//! Per-object transactional storage operator (§4.5): owns the shadow
//! buffer, the OCC write-set history, and the flush pipeline. This is
//! the ≈45% component of the system (§2).
//!
//! A [`StorageEngine`] is a thin, `Clone`-able handle over `Arc`-shared
//! state. That is what lets a write return to its caller as soon as its
//! shadow mutation is visible (I5) while its flush to the backing store
//! runs detached in the background — the idiomatic Rust translation of
//! the source's eagerly-executing, possibly-unawaited `Promise` (§9
//! "await-a-microtask yielding to coalesce writes"): a Rust `Future`
//! does nothing until polled, so emulating "started, maybe not yet
//! awaited by the caller" requires `tokio::spawn`, not a bare future.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{CResult, Error};
use crate::gates::{InputGate, OutputGate};
use crate::limits::{
    ALARM_RESERVED_KEY, MAX_KEY_BYTES, MAX_KEYS_PER_CALL, MAX_VALUE_BYTES,
};
use crate::mutex::ReadWriteMutex;
use crate::shadow::{AlarmState, RawLookup, ShadowStore};
use crate::storage::{ListOptions, Storage, StoredEntry};
use crate::transaction::Transaction;

/// A boxed, `Send` future with an explicit lifetime, rather than the
/// usual `'static`-only box-future alias: `StorageEngine::transaction`'s
/// closure returns a future borrowing its `&Transaction<S>` argument, and
/// a plain generic `Fut: Future` parameter cannot express "the future's
/// type varies with the borrow's lifetime" without this (the same
/// boxed-HRTB shape used by e.g. `sqlx`'s transaction closures).
pub type BoxFuture<'a, T = ()> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identifies the object a [`StorageEngine`] or an alarm belongs to.
/// A thin newtype over `String`, generic enough for the host's object
/// namespace (out of scope per §1) to hand the engine and the
/// [`crate::alarm::AlarmScheduler`] a stable key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(pub String);

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self {
        ObjectKey(s.to_string())
    }
}

impl From<String> for ObjectKey {
    fn from(s: String) -> Self {
        ObjectKey(s)
    }
}

/// The per-engine handle used to mirror alarm changes into the
/// process-wide [`crate::alarm::AlarmScheduler`] (§4.7 "alarm bridge").
/// Kept as a trait object so `StorageEngine` does not need to be generic
/// over the scheduler's own backing-store type.
pub trait AlarmBridge: Send + Sync {
    fn set_alarm(&self, key: ObjectKey, scheduled_time_ms: i64) -> BoxFuture<'static>;
    fn delete_alarm(&self, key: ObjectKey) -> BoxFuture<'static>;
}

/// Per-call overrides for the gate behavior of §4.6.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallOptions {
    /// Skip the input gate: lets this call run even while the gate is
    /// held closed by a `blockConcurrencyWhile`-style section.
    pub allow_concurrency: bool,
    /// Skip registering the write's flush with the output gate: the
    /// caller accepts that an enclosing transaction's commit might
    /// observe this write as durable slightly later than usual.
    pub allow_unconfirmed: bool,
}

/// An alarm notification `flush` decided on but hasn't yet told the
/// bridge about; resolved after the write lock is released, since
/// `AlarmBridge` calls are async and the mutex closure is not required
/// to be.
enum PendingAlarmNotify {
    Set(i64),
    Deleted,
}

/// State guarded by the engine's [`ReadWriteMutex`] (§3): the backing
/// store handle, the coalescing shadow, the OCC bookkeeping, and the
/// flag gating `setAlarm`.
struct EngineState<S: Storage> {
    /// Wrapped in its own plain mutex (not just `S` directly) so a reader
    /// holding only the shared [`ReadWriteMutex`] guard can still reach a
    /// `&mut S` to satisfy [`Storage`]'s `&mut self` methods — see
    /// [`EngineBelowRead`].
    inner: std::sync::Mutex<S>,
    shadow: ShadowStore,
    txn_count: u64,
    write_set_history: HashMap<u64, HashSet<Vec<u8>>>,
    deleted_key_sets: Vec<Vec<Vec<u8>>>,
    alarm_exists: bool,
    history_capacity: u64,
    pending_alarm_notify: Option<PendingAlarmNotify>,
}

impl<S: Storage> EngineState<S> {
    /// §4.7: records `write_set` at the next `txn_count` and evicts
    /// whatever fell out of the retention window.
    fn commit_write_set(&mut self, write_set: HashSet<Vec<u8>>) -> u64 {
        self.txn_count += 1;
        self.write_set_history.insert(self.txn_count, write_set);
        if let Some(evict_at) = self.txn_count.checked_sub(self.history_capacity) {
            self.write_set_history.remove(&evict_at);
        }
        self.txn_count
    }

    /// §4.5 `flush()`. Always called while holding the write lock.
    fn flush(&mut self, object_key: &ObjectKey) {
        let inner = self.inner.get_mut().unwrap();
        match self.shadow.alarm_state() {
            AlarmState::Set(t) => {
                if let Err(err) = inner.put(
                    ALARM_RESERVED_KEY.as_bytes(),
                    StoredEntry::with_metadata(Vec::new(), t),
                ) {
                    log::error!("{object_key}: failed to persist alarm: {err}");
                }
                self.pending_alarm_notify = Some(PendingAlarmNotify::Set(t));
                self.shadow.set_alarm_state(AlarmState::Unchanged);
            }
            AlarmState::Cleared => {
                if let Err(err) = inner.delete(ALARM_RESERVED_KEY.as_bytes()) {
                    log::error!("{object_key}: failed to clear alarm: {err}");
                }
                self.pending_alarm_notify = Some(PendingAlarmNotify::Deleted);
                self.shadow.set_alarm_state(AlarmState::Unchanged);
            }
            AlarmState::Unchanged => {}
        }

        if self.shadow.is_empty() && self.deleted_key_sets.is_empty() {
            return;
        }

        let inner = self.inner.get_mut().unwrap();
        let deleted_batches = std::mem::take(&mut self.deleted_key_sets);
        let mut all_deleted_keys: HashSet<Vec<u8>> = HashSet::new();
        for batch in deleted_batches {
            if let Err(err) = inner.delete_many(&batch) {
                log::error!("{object_key}: delete_many failed during flush: {err}");
            }
            all_deleted_keys.extend(batch);
        }

        let drained = self.shadow.drain();
        let mut put_entries = Vec::with_capacity(drained.len());
        let mut delete_keys = Vec::new();
        for (key, value) in drained {
            match value {
                Some(entry) => put_entries.push((key, entry)),
                None => {
                    if !all_deleted_keys.contains(&key) {
                        delete_keys.push(key);
                    }
                }
            }
        }

        if !put_entries.is_empty() {
            log::debug!("{object_key}: flushing {} put(s)", put_entries.len());
            if let Err(err) = inner.put_many(put_entries) {
                log::error!("{object_key}: put_many failed during flush: {err}");
            }
        }
        if !delete_keys.is_empty() {
            log::debug!("{object_key}: flushing {} delete(s)", delete_keys.len());
            if let Err(err) = inner.delete_many(&delete_keys) {
                log::error!("{object_key}: delete_many failed during flush: {err}");
            }
        }
    }
}

/// The bridge between a [`ShadowStore`] layered directly over the
/// backing store (the engine's own top-level shadow) and the
/// [`RawLookup`] trait a nested transaction shadow needs to fall through
/// to (§9 "two levels of shadow").
pub(crate) struct EngineBelow<'a, S: Storage> {
    shadow: &'a mut ShadowStore,
    inner: &'a mut S,
}

impl<S: Storage> RawLookup for EngineBelow<'_, S> {
    fn has_many_raw(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<bool>> {
        self.shadow.has_many(self.inner, keys)
    }

    fn get_many_raw(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<Option<StoredEntry>>> {
        self.shadow.get_many(self.inner, keys)
    }

    fn list_raw(&mut self, opts: &ListOptions) -> CResult<Vec<(Vec<u8>, StoredEntry)>> {
        self.shadow.list(self.inner, opts)
    }

    fn alarm_raw(&mut self) -> CResult<Option<i64>> {
        self.shadow.get_alarm(self.inner)
    }
}

/// Read-lock counterpart of [`EngineBelow`]: holds only shared references,
/// so it can be built from a [`crate::mutex::ReadWriteMutex::with_read`]
/// guard. `inner` is reached through its own short-lived `std::sync::Mutex`
/// lock rather than `&mut S` directly, since [`Storage`]'s methods all take
/// `&mut self` regardless of whether the call reads or writes.
pub(crate) struct EngineBelowRead<'a, S: Storage> {
    shadow: &'a ShadowStore,
    inner: &'a std::sync::Mutex<S>,
}

impl<S: Storage> RawLookup for EngineBelowRead<'_, S> {
    fn has_many_raw(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<bool>> {
        self.shadow.has_many_ro(&mut *self.inner.lock().unwrap(), keys)
    }

    fn get_many_raw(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<Option<StoredEntry>>> {
        self.shadow.get_many_ro(&mut *self.inner.lock().unwrap(), keys)
    }

    fn list_raw(&mut self, opts: &ListOptions) -> CResult<Vec<(Vec<u8>, StoredEntry)>> {
        self.shadow.list_ro(&mut *self.inner.lock().unwrap(), opts)
    }

    fn alarm_raw(&mut self) -> CResult<Option<i64>> {
        self.shadow.get_alarm(&mut *self.inner.lock().unwrap())
    }
}

struct EngineShared<S: Storage> {
    object_key: ObjectKey,
    state: ReadWriteMutex<EngineState<S>>,
    input_gate: InputGate,
    output_gate: OutputGate,
    pending_flushes: AtomicUsize,
    sync_notify: Notify,
    /// Set at most once, shortly after construction, via
    /// [`StorageEngine::with_alarm_bridge`]; a `OnceLock` rather than a
    /// plain field so it can be attached after the handle has already
    /// been cloned out to callers.
    alarm_bridge: std::sync::OnceLock<Arc<dyn AlarmBridge>>,
}

/// The per-object storage operator (§4.5). A cheap, `Clone`-able handle:
/// cloning shares the same underlying object state, gates, and backing
/// store handle.
pub struct StorageEngine<S: Storage>(Arc<EngineShared<S>>);

impl<S: Storage> Clone for StorageEngine<S> {
    fn clone(&self) -> Self {
        StorageEngine(self.0.clone())
    }
}

/// Validates a key against I1/I2 before anything touches storage (§7).
pub(crate) fn check_key(op: &'static str, key: Option<&[u8]>) -> CResult<()> {
    let key = key.ok_or(Error::UndefinedKey { op })?;
    if key.len() > MAX_KEY_BYTES {
        return Err(Error::KeyTooLarge { len: key.len() });
    }
    Ok(())
}

pub(crate) fn check_keys(keys: &[Vec<u8>]) -> CResult<()> {
    if keys.len() > MAX_KEYS_PER_CALL {
        return Err(Error::TooManyKeys { count: keys.len() });
    }
    for key in keys {
        if key.len() > MAX_KEY_BYTES {
            return Err(Error::KeyTooLarge { len: key.len() });
        }
    }
    Ok(())
}

pub(crate) fn check_value(value: &[u8]) -> CResult<()> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(Error::ValueTooLarge { len: value.len() });
    }
    Ok(())
}

pub(crate) fn check_list_options(opts: &ListOptions) -> CResult<()> {
    if let Some(limit) = opts.limit {
        if limit == 0 {
            return Err(Error::InvalidListOptions("limit must be > 0".to_string()));
        }
    }
    if opts.start.is_some() && opts.start_after.is_some() {
        return Err(Error::InvalidListOptions(
            "start and start_after are mutually exclusive".to_string(),
        ));
    }
    Ok(())
}

/// Strips the reserved alarm key out of a `list` result and, if the
/// caller asked for `start_after`, drops the echo of that key (§4.3),
/// then re-truncates to the caller's original limit.
///
/// The echoed key is dropped by value, not position: under `reverse` it
/// is the smallest key in range, so it sorts to the *tail* of `entries`,
/// not the front.
pub(crate) fn postprocess_list(
    mut entries: Vec<(Vec<u8>, StoredEntry)>,
    opts: &ListOptions,
    limit: Option<usize>,
) -> Vec<(Vec<u8>, StoredEntry)> {
    entries.retain(|(k, _)| k != ALARM_RESERVED_KEY.as_bytes());
    if let Some(start_after) = &opts.start_after {
        entries.retain(|(k, _)| k != start_after);
    }
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    entries
}

impl<S: Storage + 'static> StorageEngine<S> {
    pub fn new(object_key: ObjectKey, inner: S, alarm_exists: bool) -> Self {
        Self::with_history_capacity(
            object_key,
            inner,
            alarm_exists,
            crate::limits::WRITE_SET_HISTORY_CAPACITY,
        )
    }

    pub fn with_history_capacity(
        object_key: ObjectKey,
        inner: S,
        alarm_exists: bool,
        history_capacity: u64,
    ) -> Self {
        StorageEngine(Arc::new(EngineShared {
            object_key,
            state: ReadWriteMutex::new(EngineState {
                inner: std::sync::Mutex::new(inner),
                shadow: ShadowStore::new(false),
                txn_count: 0,
                write_set_history: HashMap::new(),
                deleted_key_sets: Vec::new(),
                alarm_exists,
                history_capacity,
                pending_alarm_notify: None,
            }),
            input_gate: InputGate::new(),
            output_gate: OutputGate::new(),
            pending_flushes: AtomicUsize::new(0),
            sync_notify: Notify::new(),
            alarm_bridge: std::sync::OnceLock::new(),
        }))
    }

    /// Attaches the process-wide alarm scheduler this engine mirrors
    /// alarm changes into. Expected to be called once, shortly after
    /// construction; a second call is a no-op.
    pub fn with_alarm_bridge(self, bridge: Arc<dyn AlarmBridge>) -> Self {
        let _ = self.0.alarm_bridge.set(bridge);
        self
    }

    pub fn object_key(&self) -> &ObjectKey {
        &self.0.object_key
    }

    /// `blockConcurrencyWhile` (§4.6): runs `f` with the input gate held
    /// closed, deferring any other request delivery to this object for
    /// the duration.
    pub async fn block_concurrency_while<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.0.input_gate.run_with_closed(f).await
    }

    async fn gated_read<F, Fut, R>(&self, opts: CallOptions, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if opts.allow_concurrency {
            f().await
        } else {
            self.0.input_gate.run_with_closed(f).await
        }
    }

    /// §4.5's steps 3-4: yields once (letting other mutate-only calls
    /// piggyback on this flush, producing write-coalescing per P7), then
    /// re-acquires the write lock and flushes. Runs detached from the
    /// caller unless `allow_unconfirmed` is false, in which case it is
    /// registered with the output gate instead so a transaction attempt
    /// or `sync()` call can still observe its completion.
    async fn schedule_flush(&self, allow_unconfirmed: bool) {
        self.0.pending_flushes.fetch_add(1, Ordering::AcqRel);
        let shared = self.0.clone();
        let fut: BoxFuture<'static> = Box::pin(async move {
            tokio::task::yield_now().await;
            let object_key = shared.object_key.clone();
            let notify = shared
                .state
                .with_write(|mut state| async move {
                    state.flush(&object_key);
                    state.pending_alarm_notify.take()
                })
                .await;
            if let (Some(bridge), Some(notify)) = (shared.alarm_bridge.get(), notify) {
                match notify {
                    PendingAlarmNotify::Set(t) => bridge.set_alarm(object_key, t).await,
                    PendingAlarmNotify::Deleted => bridge.delete_alarm(object_key).await,
                }
            }
            if shared.pending_flushes.fetch_sub(1, Ordering::AcqRel) == 1 {
                shared.sync_notify.notify_waiters();
            }
        });

        if allow_unconfirmed {
            tokio::spawn(fut);
        } else {
            self.0.output_gate.wait_until(fut).await;
        }
    }

    /// §4.5: resolves once every in-flight direct write (and transaction
    /// commit) has flushed.
    pub async fn sync(&self) {
        loop {
            if self.0.pending_flushes.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.0.sync_notify.notified();
            if self.0.pending_flushes.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    // ---- reads ----------------------------------------------------

    pub async fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        check_key("get", Some(key))?;
        Ok(self.get_many(std::slice::from_ref(&key.to_vec())).await?.into_iter().next().unwrap())
    }

    pub async fn get_many(&self, keys: &[Vec<u8>]) -> CResult<Vec<Option<Vec<u8>>>> {
        self.get_many_with_options(keys, CallOptions::default()).await
    }

    pub async fn get_many_with_options(
        &self,
        keys: &[Vec<u8>],
        opts: CallOptions,
    ) -> CResult<Vec<Option<Vec<u8>>>> {
        check_keys(keys)?;
        let keys = keys.to_vec();
        self.gated_read(opts, || async {
            self.0
                .state
                .with_read(|state| async move {
                    let mut inner = state.inner.lock().unwrap();
                    Ok(state
                        .shadow
                        .get_many_ro(&mut *inner, &keys)?
                        .into_iter()
                        .map(|v| v.map(|e| e.value))
                        .collect())
                })
                .await
        })
        .await
    }

    pub async fn has(&self, key: &[u8]) -> CResult<bool> {
        check_key("has", Some(key))?;
        let key = key.to_vec();
        self.gated_read(CallOptions::default(), || async {
            self.0
                .state
                .with_read(|state| async move {
                    let mut inner = state.inner.lock().unwrap();
                    state.shadow.has_ro(&mut *inner, &key)
                })
                .await
        })
        .await
    }

    pub async fn list(&self, opts: ListOptions) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.list_with_options(opts, CallOptions::default()).await
    }

    pub async fn list_with_options(
        &self,
        opts: ListOptions,
        call_opts: CallOptions,
    ) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        check_list_options(&opts)?;
        // §4.3: ask for one extra so filtering out the reserved alarm
        // key (or an echoed `start_after`) still leaves `limit` results.
        let inner_opts = ListOptions {
            start: opts.start_after.clone().or_else(|| opts.start.clone()),
            start_after: None,
            limit: opts.limit.map(|l| l + 1),
            ..opts.clone()
        };
        let caller_limit = opts.limit;
        self.gated_read(call_opts, || async {
            self.0
                .state
                .with_read(|state| async move {
                    let mut inner = state.inner.lock().unwrap();
                    let entries = state.shadow.list_ro(&mut *inner, &inner_opts)?;
                    Ok(postprocess_list(entries, &opts, caller_limit)
                        .into_iter()
                        .map(|(k, e)| (k, e.value))
                        .collect())
                })
                .await
        })
        .await
    }

    pub async fn get_alarm(&self) -> CResult<Option<i64>> {
        self.gated_read(CallOptions::default(), || async {
            self.0
                .state
                .with_read(|state| async move {
                    if !state.alarm_exists {
                        return Ok(None);
                    }
                    let mut inner = state.inner.lock().unwrap();
                    state.shadow.get_alarm(&mut *inner)
                })
                .await
        })
        .await
    }

    // ---- writes -----------------------------------------------------

    pub async fn put(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.put_with_options(key, value, CallOptions::default()).await
    }

    pub async fn put_with_options(
        &self,
        key: &[u8],
        value: Vec<u8>,
        opts: CallOptions,
    ) -> CResult<()> {
        check_key("put", Some(key))?;
        check_value(&value)?;
        self.put_many_with_options(vec![(key.to_vec(), value)], opts).await
    }

    pub async fn put_many(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> CResult<()> {
        self.put_many_with_options(entries, CallOptions::default()).await
    }

    pub async fn put_many_with_options(
        &self,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        opts: CallOptions,
    ) -> CResult<()> {
        if entries.len() > MAX_KEYS_PER_CALL {
            return Err(Error::TooManyPairs { count: entries.len() });
        }
        for (key, value) in &entries {
            if key.len() > MAX_KEY_BYTES {
                return Err(Error::KeyTooLarge { len: key.len() });
            }
            if value.len() > MAX_VALUE_BYTES {
                return Err(Error::ValueTooLarge { len: value.len() });
            }
        }

        self.gated_read_write(opts, || async {
            self.0
                .state
                .with_write(|mut state| async move {
                    let write_set: HashSet<Vec<u8>> =
                        entries.iter().map(|(k, _)| k.clone()).collect();
                    for (key, value) in entries {
                        state.shadow.put(&key, StoredEntry::new(value));
                    }
                    state.commit_write_set(write_set);
                    Ok::<(), Error>(())
                })
                .await
        })
        .await
    }

    pub async fn delete(&self, key: &[u8]) -> CResult<bool> {
        self.delete_with_options(key, CallOptions::default()).await
    }

    pub async fn delete_with_options(&self, key: &[u8], opts: CallOptions) -> CResult<bool> {
        check_key("delete", Some(key))?;
        let count = self.delete_many_with_options(vec![key.to_vec()], opts).await?;
        Ok(count == 1)
    }

    pub async fn delete_many(&self, keys: Vec<Vec<u8>>) -> CResult<usize> {
        self.delete_many_with_options(keys, CallOptions::default()).await
    }

    pub async fn delete_many_with_options(
        &self,
        keys: Vec<Vec<u8>>,
        opts: CallOptions,
    ) -> CResult<usize> {
        check_keys(&keys)?;
        self.gated_read_write(opts, || async {
            self.0
                .state
                .with_write(|mut state| async move {
                    let count = state.shadow.delete_many(state.inner.get_mut().unwrap(), &keys)?;
                    state.deleted_key_sets.push(keys.clone());
                    state.commit_write_set(keys.iter().cloned().collect());
                    Ok::<usize, Error>(count)
                })
                .await
        })
        .await
    }

    /// §9: `deleteAll` at the engine level lists the current shadow,
    /// tombstones every key, commits a write-set containing all of them,
    /// and flushes — it does not go through OCC history validation the
    /// way a transaction's write-set does, since there is no read-set to
    /// validate against.
    pub async fn delete_all(&self) -> CResult<usize> {
        self.delete_all_with_options(CallOptions::default()).await
    }

    pub async fn delete_all_with_options(&self, opts: CallOptions) -> CResult<usize> {
        self.gated_read_write(opts, || async {
            self.0
                .state
                .with_write(|mut state| async move {
                    let all =
                        state.shadow.list(state.inner.get_mut().unwrap(), &ListOptions::default())?;
                    let keys: Vec<Vec<u8>> = all
                        .into_iter()
                        .map(|(k, _)| k)
                        .filter(|k| k != ALARM_RESERVED_KEY.as_bytes())
                        .collect();
                    state.shadow.tombstone_many(&keys);
                    state.deleted_key_sets.push(keys.clone());
                    state.commit_write_set(keys.iter().cloned().collect());
                    Ok::<usize, Error>(keys.len())
                })
                .await
        })
        .await
    }

    pub async fn set_alarm(&self, scheduled_time_ms: i64) -> CResult<()> {
        self.set_alarm_with_options(scheduled_time_ms, CallOptions::default()).await
    }

    pub async fn set_alarm_with_options(
        &self,
        scheduled_time_ms: i64,
        opts: CallOptions,
    ) -> CResult<()> {
        if scheduled_time_ms <= 0 {
            return Err(Error::AlarmTimeNonPositive { millis: scheduled_time_ms });
        }
        self.gated_read_write(opts, || async {
            self.0
                .state
                .with_write(|mut state| async move {
                    if !state.alarm_exists {
                        return Err(Error::NoAlarmHandler);
                    }
                    state.shadow.set_alarm(scheduled_time_ms);
                    let mut write_set = HashSet::new();
                    write_set.insert(ALARM_RESERVED_KEY.as_bytes().to_vec());
                    state.commit_write_set(write_set);
                    Ok(())
                })
                .await
        })
        .await
    }

    pub async fn delete_alarm(&self) -> CResult<()> {
        self.delete_alarm_with_options(CallOptions::default()).await
    }

    pub async fn delete_alarm_with_options(&self, opts: CallOptions) -> CResult<()> {
        self.gated_read_write(opts, || async {
            self.0
                .state
                .with_write(|mut state| async move {
                    state.shadow.delete_alarm();
                    let mut write_set = HashSet::new();
                    write_set.insert(ALARM_RESERVED_KEY.as_bytes().to_vec());
                    state.commit_write_set(write_set);
                    Ok::<(), Error>(())
                })
                .await
        })
        .await
    }

    /// Runs the synchronous shadow-mutation step of a write under the
    /// input gate (closed only for that brief step, per §4.6 and the
    /// coalescing note in §4.5), then schedules its flush (§4.6
    /// `waitUntilOnOutputGate`).
    async fn gated_read_write<F, Fut, R>(&self, opts: CallOptions, f: F) -> CResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CResult<R>>,
    {
        let result = if opts.allow_concurrency {
            f().await
        } else {
            self.0.input_gate.run_with_closed(f).await
        }?;
        self.schedule_flush(opts.allow_unconfirmed).await;
        Ok(result)
    }

    // ---- transactions -------------------------------------------------

    /// §4.5 "interactive transactions": runs `closure` against a
    /// [`Transaction`], retrying on OCC conflict until it validates and
    /// commits cleanly.
    pub async fn transaction<F, T>(&self, closure: F) -> CResult<T>
    where
        F: for<'a> Fn(&'a Transaction<S>) -> BoxFuture<'a, CResult<T>>,
    {
        let engine = self.clone();
        self.0
            .output_gate
            .run_with(|| async move {
                loop {
                    let start_txn_count =
                        engine.0.state.with_read(|s| async move { s.txn_count }).await;
                    let txn = Transaction::new(engine.clone(), start_txn_count);

                    let closure_result = closure(&txn).await;
                    txn.mark_committed();

                    let value = closure_result?;

                    if txn.rolled_back() {
                        return Ok(value);
                    }

                    let (read_set, write_set, shadow_entries, alarm_state) = txn.into_parts();

                    let committed = engine
                        .0
                        .state
                        .with_write(|mut state| async move {
                            for t in (start_txn_count + 1)..=state.txn_count {
                                match state.write_set_history.get(&t) {
                                    Some(historical) if historical.is_disjoint(&read_set) => {}
                                    _ => return false,
                                }
                            }

                            state.commit_write_set(write_set);
                            for (key, entry) in shadow_entries {
                                match entry {
                                    Some(e) => state.shadow.put(&key, e),
                                    None => {
                                        state.shadow.tombstone_many(std::slice::from_ref(&key))
                                    }
                                }
                            }
                            if !matches!(alarm_state, AlarmState::Unchanged) {
                                state.shadow.set_alarm_state(alarm_state);
                            }
                            true
                        })
                        .await;

                    if committed {
                        engine.schedule_flush(false).await;
                        return Ok(value);
                    }
                    log::debug!(
                        "{}: transaction conflict detected, retrying (start_txn_count={start_txn_count})",
                        engine.object_key()
                    );
                }
            })
            .await
    }

    /// Internal accessor used by [`Transaction`] for ops that need to
    /// fall through to the engine's own shadow-over-backing view (§9
    /// "two levels of shadow"): `get`/`list`/`getAlarm` (to read through),
    /// and `delete` (to resolve prior presence).
    /// Named (not elided) lifetime on `&'a self`/`EngineBelow<'a, S>`, for
    /// the same reason [`crate::mutex::ReadWriteMutex::with_write`]'s own
    /// doc comment gives: eliding it would make the bound higher-ranked,
    /// which has no solution once `f`'s returned future borrows from it.
    pub(crate) async fn with_below<'a, F, Fut, R>(&'a self, f: F) -> R
    where
        F: FnOnce(&mut EngineBelow<'a, S>) -> Fut,
        Fut: Future<Output = R>,
    {
        self.0
            .state
            .with_write(|mut state| async move {
                let mut below = EngineBelow {
                    shadow: &mut state.shadow,
                    inner: state.inner.get_mut().unwrap(),
                };
                f(&mut below).await
            })
            .await
    }

    /// Read-lock counterpart of [`Self::with_below`] (spec.md:130: "get/list
    /// proceed under the engine's mutex read lock"): used by
    /// [`Transaction`]'s own read operators, which only ever consult the
    /// engine's shadow/backing store to fall through for keys their own
    /// private shadow hasn't seen yet. Concurrent callers share the outer
    /// `ReadWriteMutex` read lock; [`EngineBelowRead`] reaches the backing
    /// store through its own short-lived lock instead of the write guard's
    /// exclusive access.
    pub(crate) async fn with_below_read<'a, F, Fut, R>(&'a self, f: F) -> R
    where
        F: FnOnce(&mut EngineBelowRead<'a, S>) -> Fut,
        Fut: Future<Output = R>,
    {
        self.0
            .state
            .with_read(|state| async move {
                let mut below = EngineBelowRead { shadow: &state.shadow, inner: &state.inner };
                f(&mut below).await
            })
            .await
    }

    /// Internal accessor for ops that merely need the write lock for
    /// mutual exclusion, without touching the engine's own shadow or
    /// backing store (a transaction's `put`/`setAlarm`/`deleteAlarm`,
    /// which only mutate the transaction's private shadow, per §4.4).
    pub(crate) async fn with_write_lock<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.0.state.with_write(|_state| f()).await
    }

    pub(crate) async fn alarm_exists(&self) -> bool {
        self.0.state.with_read(|s| async move { s.alarm_exists }).await
    }
}
