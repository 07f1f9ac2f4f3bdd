//! The minimal backing-store contract the engine depends on (§6), plus
//! the two concrete implementations that ship with this crate.
//!
//! The backing store itself is out of scope for the engine's semantics:
//! it is an opaque, ordered key→value byte store. Everything the engine
//! needs from it is captured in the [`Storage`] trait.

pub mod file;
pub mod log;
pub mod memory;

use crate::error::CResult;

/// A value as held by the backing store: an opaque byte buffer plus
/// optional metadata. Metadata is only ever used to carry an alarm's
/// scheduled time (ms since epoch); the engine never inspects the value
/// bytes themselves.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub metadata: Option<i64>,
}

impl StoredEntry {
    pub fn new(value: Vec<u8>) -> Self {
        Self { value, metadata: None }
    }

    pub fn with_metadata(value: Vec<u8>, metadata: i64) -> Self {
        Self { value, metadata: Some(metadata) }
    }
}

/// Options accepted by [`Storage::list`], mirroring the operator-level
/// `list` options of §4.2/§4.3.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Inclusive lower bound. Mutually exclusive with `start_after`.
    pub start: Option<Vec<u8>>,
    /// Exclusive lower bound. Mutually exclusive with `start`.
    pub start_after: Option<Vec<u8>>,
    /// Exclusive upper bound.
    pub end: Option<Vec<u8>>,
    /// Restrict to keys with this byte prefix.
    pub prefix: Option<Vec<u8>>,
    /// Iterate in reverse lexicographic order.
    pub reverse: bool,
    /// Maximum number of keys to return.
    pub limit: Option<usize>,
}

/// Status/diagnostics for a backing store, following the shape of the
/// teacher's `storage::Status`.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Status {
    pub name: String,
    pub keys: u64,
    pub size: u64,
}

/// The backing K→V byte store the engine is built on top of. Implementors
/// own an ordered key space and support the batch operations the
/// engine's flush pipeline requires.
///
/// Like the teacher's `Engine` trait, every method takes `&mut self`:
/// a `Storage` is owned exclusively by the one `StorageEngine` built on
/// top of it, and all access to it is already serialized by that
/// engine's [`crate::mutex::ReadWriteMutex`].
pub trait Storage: Send + Sync {
    fn get(&mut self, key: &[u8]) -> CResult<Option<StoredEntry>>;

    fn get_many(&mut self, keys: &[Vec<u8>]) -> CResult<Vec<Option<StoredEntry>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    fn put(&mut self, key: &[u8], entry: StoredEntry) -> CResult<()>;

    fn put_many(&mut self, pairs: Vec<(Vec<u8>, StoredEntry)>) -> CResult<()> {
        for (k, v) in pairs {
            self.put(&k, v)?;
        }
        Ok(())
    }

    /// Deletes a key, returning whether it was present beforehand.
    fn delete(&mut self, key: &[u8]) -> CResult<bool>;

    /// Deletes a batch of keys, returning how many were present beforehand.
    fn delete_many(&mut self, keys: &[Vec<u8>]) -> CResult<usize> {
        let mut count = 0;
        for k in keys {
            if self.delete(k)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Sorted key enumeration, honoring `start`/`start_after`/`end`/
    /// `prefix`/`reverse`/`limit`.
    fn list(&mut self, opts: &ListOptions) -> CResult<Vec<(Vec<u8>, StoredEntry)>>;

    fn status(&mut self) -> CResult<Status>;
}

/// Applies the non-prefix bounds of [`ListOptions`] to an already
/// lexicographically sorted key set, shared by every `Storage`
/// implementation's `list`.
pub(crate) fn apply_list_options(
    mut entries: Vec<(Vec<u8>, StoredEntry)>,
    opts: &ListOptions,
) -> Vec<(Vec<u8>, StoredEntry)> {
    if let Some(prefix) = &opts.prefix {
        entries.retain(|(k, _)| k.starts_with(prefix.as_slice()));
    }
    if let Some(start) = &opts.start {
        entries.retain(|(k, _)| k >= start);
    }
    if let Some(start_after) = &opts.start_after {
        entries.retain(|(k, _)| k > start_after);
    }
    if let Some(end) = &opts.end {
        entries.retain(|(k, _)| k < end);
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    if opts.reverse {
        entries.reverse();
    }
    if let Some(limit) = opts.limit {
        entries.truncate(limit);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Generates the common point-op and scan test battery for any
    /// `Storage` implementation, mirroring the teacher's `test_engine!`
    /// macro in `kv::storage::tests`.
    macro_rules! test_storage {
        ($setup:expr) => {
            #[test]
            fn point_ops() -> CResult<()> {
                let mut s = $setup;
                assert_eq!(s.get(b"a")?, None);
                s.put(b"a", StoredEntry::new(vec![1]))?;
                assert_eq!(s.get(b"a")?, Some(StoredEntry::new(vec![1])));
                s.put(b"a", StoredEntry::new(vec![2]))?;
                assert_eq!(s.get(b"a")?, Some(StoredEntry::new(vec![2])));
                assert!(s.delete(b"a")?);
                assert_eq!(s.get(b"a")?, None);
                assert!(!s.delete(b"a")?);
                Ok(())
            }

            #[test]
            fn list_ordering_and_limit() -> CResult<()> {
                let mut s = $setup;
                for k in [b"a", b"b", b"c", b"d"] {
                    s.put(k, StoredEntry::new(vec![0]))?;
                }
                let all = s.list(&ListOptions::default())?;
                assert_eq!(
                    all.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
                    vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
                );
                let limited = s.list(&ListOptions { limit: Some(2), ..Default::default() })?;
                assert_eq!(limited.len(), 2);
                let reversed = s.list(&ListOptions { reverse: true, ..Default::default() })?;
                assert_eq!(
                    reversed.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
                    vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
                );
                Ok(())
            }

            #[test]
            fn metadata_round_trips() -> CResult<()> {
                let mut s = $setup;
                s.put(b"alarm", StoredEntry::with_metadata(vec![], 12345))?;
                assert_eq!(s.get(b"alarm")?.unwrap().metadata, Some(12345));
                Ok(())
            }
        };
    }

    mod memory {
        use super::super::memory::MemoryStorage;
        use super::*;
        test_storage!(MemoryStorage::new());
    }

    mod file {
        use super::super::file::FileStorage;
        use super::*;
        test_storage!(FileStorage::create(
            tempfile::tempdir().unwrap().path().join("objstore.db")
        )?);
    }
}
