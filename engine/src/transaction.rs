//! Interactive transactions (§4.4): a private, read-tracking shadow
//! layered on top of the engine's own shadow, consumed by
//! [`crate::engine::StorageEngine::transaction`] once the user's closure
//! returns.
//!
//! A transaction's own bookkeeping (its shadow, and whether it has
//! already committed or rolled back) is protected by a plain
//! `std::sync::Mutex`, not the engine's `ReadWriteMutex`: every access to
//! it is a short, synchronous critical section (no `.await` while held),
//! so there is no reason to pay for an async lock here. Access to the
//! engine's own state — the thing that *does* need the async lock —
//! goes through `StorageEngine::with_below_read` for pure reads,
//! `with_below`/`with_write_lock` for anything that needs the write
//! lock.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::engine::{check_key, check_keys, check_list_options, check_value, postprocess_list};
use crate::engine::StorageEngine;
use crate::error::{CResult, Error};
use crate::limits::{ALARM_RESERVED_KEY, MAX_KEYS_PER_CALL, MAX_WRITE_SET};
use crate::shadow::{AlarmState, ShadowStore};
use crate::storage::{ListOptions, Storage, StoredEntry};

struct TxnState {
    shadow: ShadowStore,
    committed: bool,
    rolled_back: bool,
}

/// A handle passed to the closure given to [`StorageEngine::transaction`].
/// Every operator mirrors its [`StorageEngine`] counterpart, but reads
/// and writes land in this transaction's own private shadow until the
/// closure returns and the attempt validates (§4.4, §9).
pub struct Transaction<S: Storage> {
    engine: StorageEngine<S>,
    state: Mutex<TxnState>,
}

fn write_set_size(shadow: &ShadowStore) -> usize {
    let alarm_touched = !matches!(shadow.alarm_state(), AlarmState::Unchanged);
    shadow.len() + usize::from(alarm_touched)
}

impl<S: Storage + 'static> Transaction<S> {
    /// `start_txn_count` is not consulted here: conflict validation
    /// against it happens once, in `StorageEngine::transaction`, after
    /// the closure returns. It is still a parameter (rather than omitted)
    /// so the snapshot is taken at the same instant the transaction is
    /// constructed, not sometime later.
    pub(crate) fn new(engine: StorageEngine<S>, _start_txn_count: u64) -> Self {
        Transaction {
            engine,
            state: Mutex::new(TxnState {
                shadow: ShadowStore::new(true),
                committed: false,
                rolled_back: false,
            }),
        }
    }

    fn ensure_active(&self) -> CResult<()> {
        let state = self.state.lock().unwrap();
        if state.rolled_back {
            return Err(Error::MisuseAfterRollback);
        }
        if state.committed {
            return Err(Error::MisuseAfterCommit);
        }
        Ok(())
    }

    fn check_write_set_limit(state: &TxnState) -> CResult<()> {
        let count = write_set_size(&state.shadow);
        if count > MAX_WRITE_SET {
            return Err(Error::TooManyWrites { count });
        }
        Ok(())
    }

    /// Marks this transaction unusable from here on: called once the
    /// user's closure has returned (successfully or not), so that a
    /// closure which stashed `&txn` somewhere and tries to reuse it after
    /// returning gets [`Error::MisuseAfterCommit`] instead of silently
    /// mutating a shadow nobody will look at again.
    pub(crate) fn mark_committed(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.rolled_back {
            state.committed = true;
        }
    }

    pub(crate) fn rolled_back(&self) -> bool {
        self.state.lock().unwrap().rolled_back
    }

    /// Consumes the transaction, returning what
    /// [`StorageEngine::transaction`] needs to validate and commit it:
    /// the read-set, the write-set, the shadow's pending writes/tombstones,
    /// and its alarm decision.
    pub(crate) fn into_parts(
        self,
    ) -> (HashSet<Vec<u8>>, HashSet<Vec<u8>>, Vec<(Vec<u8>, Option<StoredEntry>)>, AlarmState) {
        let state = self.state.into_inner().unwrap();
        let read_set = state.shadow.read_set().cloned().unwrap_or_default();
        let mut write_set: HashSet<Vec<u8>> =
            state.shadow.iter().map(|(k, _)| k.clone()).collect();
        let alarm_state = state.shadow.alarm_state();
        if !matches!(alarm_state, AlarmState::Unchanged) {
            write_set.insert(ALARM_RESERVED_KEY.as_bytes().to_vec());
        }
        let mut shadow = state.shadow;
        let shadow_entries = shadow.drain();
        (read_set, write_set, shadow_entries, alarm_state)
    }

    // ---- reads --------------------------------------------------------

    pub async fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.ensure_active()?;
        check_key("get", Some(key))?;
        let key = key.to_vec();
        self.engine
            .with_below_read(|below| async move {
                let mut state = self.state.lock().unwrap();
                Ok(state.shadow.get(below, &key)?.map(|e| e.value))
            })
            .await
    }

    pub async fn get_many(&self, keys: &[Vec<u8>]) -> CResult<Vec<Option<Vec<u8>>>> {
        self.ensure_active()?;
        check_keys(keys)?;
        let keys = keys.to_vec();
        self.engine
            .with_below_read(|below| async move {
                let mut state = self.state.lock().unwrap();
                Ok(state
                    .shadow
                    .get_many(below, &keys)?
                    .into_iter()
                    .map(|v| v.map(|e| e.value))
                    .collect())
            })
            .await
    }

    pub async fn has(&self, key: &[u8]) -> CResult<bool> {
        self.ensure_active()?;
        check_key("has", Some(key))?;
        let key = key.to_vec();
        self.engine
            .with_below_read(|below| async move {
                let mut state = self.state.lock().unwrap();
                state.shadow.has(below, &key)
            })
            .await
    }

    pub async fn list(&self, opts: ListOptions) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_active()?;
        check_list_options(&opts)?;
        let inner_opts = ListOptions {
            start: opts.start_after.clone().or_else(|| opts.start.clone()),
            start_after: None,
            limit: opts.limit.map(|l| l + 1),
            ..opts.clone()
        };
        let caller_limit = opts.limit;
        let entries = self
            .engine
            .with_below_read(|below| async move {
                let mut state = self.state.lock().unwrap();
                state.shadow.list(below, &inner_opts)
            })
            .await?;
        Ok(postprocess_list(entries, &opts, caller_limit)
            .into_iter()
            .map(|(k, e)| (k, e.value))
            .collect())
    }

    pub async fn get_alarm(&self) -> CResult<Option<i64>> {
        self.ensure_active()?;
        if !self.engine.alarm_exists().await {
            return Ok(None);
        }
        self.engine
            .with_below_read(|below| async move {
                let mut state = self.state.lock().unwrap();
                state.shadow.get_alarm(below)
            })
            .await
    }

    // ---- writes ---------------------------------------------------------

    pub async fn put(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        check_key("put", Some(key))?;
        check_value(&value)?;
        self.put_many(vec![(key.to_vec(), value)]).await
    }

    pub async fn put_many(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> CResult<()> {
        self.ensure_active()?;
        if entries.len() > MAX_KEYS_PER_CALL {
            return Err(Error::TooManyPairs { count: entries.len() });
        }
        for (key, value) in &entries {
            check_key("put", Some(key))?;
            check_value(value)?;
        }
        self.engine
            .with_write_lock(|| async {
                let mut state = self.state.lock().unwrap();
                for (key, value) in entries {
                    state.shadow.put(&key, StoredEntry::new(value));
                }
                Self::check_write_set_limit(&state)
            })
            .await
    }

    pub async fn delete(&self, key: &[u8]) -> CResult<bool> {
        check_key("delete", Some(key))?;
        let count = self.delete_many(vec![key.to_vec()]).await?;
        Ok(count == 1)
    }

    pub async fn delete_many(&self, keys: Vec<Vec<u8>>) -> CResult<usize> {
        self.ensure_active()?;
        check_keys(&keys)?;
        let result = self
            .engine
            .with_below(|below| async move {
                let mut state = self.state.lock().unwrap();
                state.shadow.delete_many(below, &keys)
            })
            .await?;
        let state = self.state.lock().unwrap();
        Self::check_write_set_limit(&state)?;
        Ok(result)
    }

    /// §4.4: `deleteAll` has no meaning inside a transaction (there is no
    /// way to express "every key, including ones I haven't read" as an
    /// OCC-validated write-set), so it is rejected outright rather than
    /// silently scoped to what the transaction happens to have seen.
    pub async fn delete_all(&self) -> CResult<usize> {
        self.ensure_active()?;
        Err(Error::UnsupportedInTransaction { op: "deleteAll" })
    }

    pub async fn set_alarm(&self, scheduled_time_ms: i64) -> CResult<()> {
        self.ensure_active()?;
        if scheduled_time_ms <= 0 {
            return Err(Error::AlarmTimeNonPositive { millis: scheduled_time_ms });
        }
        if !self.engine.alarm_exists().await {
            return Err(Error::NoAlarmHandler);
        }
        self.engine
            .with_write_lock(|| async {
                let mut state = self.state.lock().unwrap();
                state.shadow.set_alarm(scheduled_time_ms);
                Self::check_write_set_limit(&state)
            })
            .await
    }

    pub async fn delete_alarm(&self) -> CResult<()> {
        self.ensure_active()?;
        self.engine
            .with_write_lock(|| async {
                let mut state = self.state.lock().unwrap();
                state.shadow.delete_alarm();
                Self::check_write_set_limit(&state)
            })
            .await
    }

    /// Aborts the transaction: the closure's return value is still
    /// handed back to the caller of `transaction()`, but none of this
    /// attempt's writes are committed or flushed (§4.4).
    pub async fn rollback(&self) -> CResult<()> {
        self.ensure_active()?;
        self.state.lock().unwrap().rolled_back = true;
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ObjectKey;
    use crate::storage::memory::MemoryStorage;

    fn new_engine() -> StorageEngine<MemoryStorage> {
        StorageEngine::new(ObjectKey::from("test"), MemoryStorage::new(), true)
    }

    #[tokio::test]
    async fn read_your_writes_inside_a_transaction() -> CResult<()> {
        let engine = new_engine();
        let value = engine
            .transaction(|tx| {
                Box::pin(async move {
                    tx.put(b"k", b"v".to_vec()).await?;
                    tx.get(b"k").await
                })
            })
            .await?;
        assert_eq!(value, Some(b"v".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn delete_all_is_rejected_inside_a_transaction() -> CResult<()> {
        let engine = new_engine();
        let result =
            engine.transaction(|tx| Box::pin(async move { tx.delete_all().await })).await;
        assert!(matches!(result, Err(Error::UnsupportedInTransaction { op: "deleteAll" })));
        Ok(())
    }

    #[tokio::test]
    async fn rollback_discards_writes() -> CResult<()> {
        let engine = new_engine();
        engine
            .transaction(|tx| {
                Box::pin(async move {
                    tx.put(b"k", b"v".to_vec()).await?;
                    tx.rollback().await?;
                    Ok::<(), Error>(())
                })
            })
            .await?;
        assert_eq!(engine.get(b"k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn misuse_after_commit_is_rejected() -> CResult<()> {
        let engine = new_engine();
        // Exercise the guard directly rather than via `transaction()`,
        // since the closure's own `&Transaction` never outlives the call.
        let txn = Transaction::new(engine.clone(), 0);
        txn.mark_committed();
        let err = txn.get(b"k").await.unwrap_err();
        assert!(matches!(err, Error::MisuseAfterCommit));
        Ok(())
    }
}
