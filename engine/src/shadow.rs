//! Write-coalescing overlay buffering pending writes and tombstones over
//! a backing store, plus (optionally) a read-set for OCC (§4.2, §4.3).

use std::collections::{BTreeMap, HashSet};

use crate::error::{CResult, Error};
use crate::limits::{ALARM_RESERVED_KEY, MAX_KEYS_PER_CALL};
use crate::storage::{ListOptions, StoredEntry};

/// The shadow's view of the alarm: unchanged since the shadow was built,
/// explicitly set to a new time, or explicitly cleared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlarmState {
    #[default]
    Unchanged,
    Set(i64),
    Cleared,
}

/// Anything a [`ShadowStore`] can fall through to when a key isn't
/// present in its `copies` map: either the raw backing store, or another
/// `ShadowStore` (the two-level overlay a transaction builds on top of
/// the engine's own coalescing shadow — §9 "two levels of shadow").
pub trait RawLookup {
    fn has_many_raw(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<bool>>;
    fn get_many_raw(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<Option<StoredEntry>>>;
    fn list_raw(&mut self, opts: &ListOptions) -> CResult<Vec<(Vec<u8>, StoredEntry)>>;
    fn alarm_raw(&mut self) -> CResult<Option<i64>>;
}

impl<S: crate::storage::Storage> RawLookup for S {
    fn has_many_raw(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<bool>> {
        Ok(self.get_many(keys)?.into_iter().map(|v| v.is_some()).collect())
    }

    fn get_many_raw(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<Option<StoredEntry>>> {
        self.get_many(keys)
    }

    fn list_raw(&mut self, opts: &ListOptions) -> CResult<Vec<(Vec<u8>, StoredEntry)>> {
        self.list(opts)
    }

    fn alarm_raw(&mut self) -> CResult<Option<i64>> {
        Ok(self.get(ALARM_RESERVED_KEY.as_bytes())?.and_then(|e| e.metadata))
    }
}

pub struct ShadowStore {
    copies: BTreeMap<Vec<u8>, Option<StoredEntry>>,
    read_set: Option<HashSet<Vec<u8>>>,
    alarm: AlarmState,
}

impl ShadowStore {
    /// `track_reads` enables read-set recording; only a transaction's
    /// outermost shadow does this (§9).
    pub fn new(track_reads: bool) -> Self {
        Self {
            copies: BTreeMap::new(),
            read_set: track_reads.then(HashSet::new),
            alarm: AlarmState::Unchanged,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub fn read_set(&self) -> Option<&HashSet<Vec<u8>>> {
        self.read_set.as_ref()
    }

    fn record_read(&mut self, key: &[u8]) {
        if let Some(set) = self.read_set.as_mut() {
            set.insert(key.to_vec());
        }
    }

    fn record_reads<'a>(&mut self, keys: impl Iterator<Item = &'a Vec<u8>>) {
        if self.read_set.is_some() {
            for k in keys {
                self.record_read(k);
            }
        }
    }

    pub fn has(&mut self, below: &mut impl RawLookup, key: &[u8]) -> CResult<bool> {
        Ok(self.has_many(below, std::slice::from_ref(&key.to_vec()))?[0])
    }

    pub fn has_many(&mut self, below: &mut impl RawLookup, keys: &[Vec<u8>]) -> CResult<Vec<bool>> {
        Ok(self.get_many(below, keys)?.into_iter().map(|v| v.is_some()).collect())
    }

    pub fn get(&mut self, below: &mut impl RawLookup, key: &[u8]) -> CResult<Option<StoredEntry>> {
        Ok(self.get_many(below, std::slice::from_ref(&key.to_vec()))?.into_iter().next().unwrap())
    }

    pub fn get_many(
        &mut self,
        below: &mut impl RawLookup,
        keys: &[Vec<u8>],
    ) -> CResult<Vec<Option<StoredEntry>>> {
        self.record_reads(keys.iter());
        self.lookup_many(below, keys)
    }

    /// Read-lock counterpart of [`Self::has`]: does not record a read-set
    /// entry, so only valid for a shadow that never tracks reads (the
    /// engine's own top-level shadow, not a transaction's).
    pub fn has_ro(&self, below: &mut impl RawLookup, key: &[u8]) -> CResult<bool> {
        Ok(self.has_many_ro(below, std::slice::from_ref(&key.to_vec()))?[0])
    }

    pub fn has_many_ro(&self, below: &mut impl RawLookup, keys: &[Vec<u8>]) -> CResult<Vec<bool>> {
        Ok(self.get_many_ro(below, keys)?.into_iter().map(|v| v.is_some()).collect())
    }

    /// Read-lock counterpart of [`Self::get`] (see [`Self::has_ro`]).
    pub fn get_ro(&self, below: &mut impl RawLookup, key: &[u8]) -> CResult<Option<StoredEntry>> {
        Ok(self.get_many_ro(below, std::slice::from_ref(&key.to_vec()))?.into_iter().next().unwrap())
    }

    /// Read-lock counterpart of [`Self::get_many`] (see [`Self::has_ro`]).
    pub fn get_many_ro(
        &self,
        below: &mut impl RawLookup,
        keys: &[Vec<u8>],
    ) -> CResult<Vec<Option<StoredEntry>>> {
        self.lookup_many(below, keys)
    }

    fn lookup_many(
        &self,
        below: &mut impl RawLookup,
        keys: &[Vec<u8>],
    ) -> CResult<Vec<Option<StoredEntry>>> {
        if self.copies.is_empty() {
            return below.get_many_raw(keys);
        }

        let mut results: Vec<Option<Option<StoredEntry>>> = vec![None; keys.len()];
        let mut below_indices = Vec::new();
        let mut below_keys = Vec::new();

        for (i, key) in keys.iter().enumerate() {
            match self.copies.get(key) {
                Some(Some(entry)) => results[i] = Some(Some(entry.clone())),
                Some(None) => results[i] = Some(None),
                None => {
                    below_indices.push(i);
                    below_keys.push(key.clone());
                }
            }
        }

        if !below_keys.is_empty() {
            let fetched = below.get_many_raw(&below_keys)?;
            for (idx, value) in below_indices.into_iter().zip(fetched) {
                results[idx] = Some(value);
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap()).collect())
    }

    pub fn put(&mut self, key: &[u8], entry: StoredEntry) {
        self.copies.insert(key.to_vec(), Some(entry));
    }

    /// Tombstones a single key, returning whether it was present
    /// beforehand (consulting `below` for keys not already shadowed).
    pub fn delete(&mut self, below: &mut impl RawLookup, key: &[u8]) -> CResult<bool> {
        Ok(self.delete_many(below, std::slice::from_ref(&key.to_vec()))? == 1)
    }

    /// Tombstones a batch of keys, returning how many were present
    /// beforehand.
    pub fn delete_many(&mut self, below: &mut impl RawLookup, keys: &[Vec<u8>]) -> CResult<usize> {
        let present = self.has_many(below, keys)?;
        for key in keys {
            self.copies.insert(key.clone(), None);
        }
        Ok(present.into_iter().filter(|p| *p).count())
    }

    /// Merges the filter/sort logic of §4.2's `list`, asking `below` for
    /// `limit + deletedMatching` so that filtering out shadow tombstones
    /// still leaves at least `limit` live results when possible.
    pub fn list(
        &mut self,
        below: &mut impl RawLookup,
        opts: &ListOptions,
    ) -> CResult<Vec<(Vec<u8>, StoredEntry)>> {
        let matches = |key: &[u8]| -> bool {
            if let Some(prefix) = &opts.prefix {
                if !key.starts_with(prefix.as_slice()) {
                    return false;
                }
            }
            if let Some(start) = &opts.start {
                if key < start.as_slice() {
                    return false;
                }
            }
            if let Some(start_after) = &opts.start_after {
                if key <= start_after.as_slice() {
                    return false;
                }
            }
            if let Some(end) = &opts.end {
                if key >= end.as_slice() {
                    return false;
                }
            }
            true
        };

        let shadow_matching: Vec<(Vec<u8>, Option<StoredEntry>)> = self
            .copies
            .iter()
            .filter(|(k, _)| matches(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let deleted_matching = shadow_matching.iter().filter(|(_, v)| v.is_none()).count();

        let below_opts = ListOptions {
            limit: opts.limit.map(|l| l + deleted_matching),
            ..opts.clone()
        };
        let from_below = below.list_raw(&below_opts)?;

        let shadow_keys: HashSet<&Vec<u8>> = shadow_matching.iter().map(|(k, _)| k).collect();
        let mut merged: Vec<(Vec<u8>, StoredEntry)> =
            from_below.into_iter().filter(|(k, _)| !shadow_keys.contains(k)).collect();
        merged.extend(shadow_matching.into_iter().filter_map(|(k, v)| v.map(|e| (k, e))));

        merged.sort_by(|a, b| a.0.cmp(&b.0));
        if opts.reverse {
            merged.reverse();
        }
        if let Some(limit) = opts.limit {
            merged.truncate(limit);
        }

        self.record_reads(merged.iter().map(|(k, _)| k));
        Ok(merged)
    }

    /// Never mutates the shadow (there's nothing to record — an alarm
    /// isn't part of the read-set), so this is `&self` and needs no
    /// separate `_ro` counterpart.
    pub fn get_alarm(&self, below: &mut impl RawLookup) -> CResult<Option<i64>> {
        match self.alarm {
            AlarmState::Set(t) => Ok(Some(t)),
            AlarmState::Cleared => Ok(None),
            AlarmState::Unchanged => below.alarm_raw(),
        }
    }

    pub fn set_alarm(&mut self, millis: i64) {
        self.alarm = AlarmState::Set(millis);
    }

    pub fn delete_alarm(&mut self) {
        self.alarm = AlarmState::Cleared;
    }

    pub fn alarm_state(&self) -> AlarmState {
        self.alarm
    }

    pub fn set_alarm_state(&mut self, state: AlarmState) {
        self.alarm = state;
    }

    /// Drains this shadow's pending writes, returning them in key order.
    /// Used both by the engine's own flush and by transaction commit,
    /// which merges a txn's shadow forward into the engine's.
    pub fn drain(&mut self) -> Vec<(Vec<u8>, Option<StoredEntry>)> {
        std::mem::take(&mut self.copies).into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Option<StoredEntry>)> {
        self.copies.iter()
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    /// Tombstones `keys` unconditionally, without consulting `below` for
    /// their prior presence. Used by `deleteAll`, which already knows
    /// the keys exist because it just listed them (§9).
    pub fn tombstone_many(&mut self, keys: &[Vec<u8>]) {
        for key in keys {
            self.copies.insert(key.clone(), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::Storage;

    #[test]
    fn read_your_writes() -> CResult<()> {
        let mut backing = MemoryStorage::new();
        let mut shadow = ShadowStore::new(false);
        shadow.put(b"k", StoredEntry::new(b"v".to_vec()));
        assert_eq!(shadow.get(&mut backing, b"k")?, Some(StoredEntry::new(b"v".to_vec())));
        Ok(())
    }

    #[test]
    fn delete_reports_prior_presence_from_backing() -> CResult<()> {
        let mut backing = MemoryStorage::new();
        backing.put(b"k", StoredEntry::new(vec![1]))?;
        let mut shadow = ShadowStore::new(false);
        assert!(shadow.delete(&mut backing, b"k")?);
        assert_eq!(shadow.get(&mut backing, b"k")?, None);
        // Idempotent: second delete (still shadowed) reports false.
        assert!(!shadow.delete(&mut backing, b"k")?);
        Ok(())
    }

    #[test]
    fn list_filters_tombstones_and_preserves_limit() -> CResult<()> {
        let mut backing = MemoryStorage::new();
        for (k, v) in [("a", 1u8), ("b", 2), ("c", 3), ("d", 4)] {
            backing.put(k.as_bytes(), StoredEntry::new(vec![v]))?;
        }
        let mut shadow = ShadowStore::new(false);
        shadow.delete(&mut backing, b"b")?;
        shadow.put(b"e", StoredEntry::new(vec![5]));

        let listed = shadow.list(&mut backing, &ListOptions::default())?;
        let keys: Vec<_> =
            listed.iter().map(|(k, _)| String::from_utf8(k.clone()).unwrap()).collect();
        assert_eq!(keys, vec!["a", "c", "d", "e"]);
        Ok(())
    }

    #[test]
    fn list_with_limit_requests_extra_for_tombstones() -> CResult<()> {
        let mut backing = MemoryStorage::new();
        for k in ["a", "b", "c", "d"] {
            backing.put(k.as_bytes(), StoredEntry::new(vec![0]))?;
        }
        let mut shadow = ShadowStore::new(false);
        shadow.delete(&mut backing, b"a")?;

        let listed = shadow.list(&mut backing, &ListOptions { limit: Some(2), ..Default::default() })?;
        let keys: Vec<_> =
            listed.iter().map(|(k, _)| String::from_utf8(k.clone()).unwrap()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        Ok(())
    }

    #[test]
    fn alarm_state_forwards_when_unchanged() -> CResult<()> {
        let mut backing = MemoryStorage::new();
        backing.put(
            crate::limits::ALARM_RESERVED_KEY.as_bytes(),
            StoredEntry::with_metadata(vec![], 42),
        )?;
        let mut shadow = ShadowStore::new(false);
        assert_eq!(shadow.get_alarm(&mut backing)?, Some(42));
        shadow.set_alarm(100);
        assert_eq!(shadow.get_alarm(&mut backing)?, Some(100));
        shadow.delete_alarm();
        assert_eq!(shadow.get_alarm(&mut backing)?, None);
        Ok(())
    }

    #[test]
    fn read_set_records_gets_and_lists() -> CResult<()> {
        let mut backing = MemoryStorage::new();
        backing.put(b"k", StoredEntry::new(vec![1]))?;
        let mut shadow = ShadowStore::new(true);
        shadow.get(&mut backing, b"k")?;
        assert!(shadow.read_set().unwrap().contains(b"k".as_slice()));
        Ok(())
    }
}
