//! A pure in-memory backing store, storing entries directly in a
//! `BTreeMap` with no persistence — descended from the teacher's
//! `kv::storage::memory::Memory`, generalized to carry `StoredEntry`
//! (value + optional metadata) instead of a bare byte buffer.

use std::collections::BTreeMap;

use crate::error::CResult;
use crate::storage::{apply_list_options, ListOptions, Status, Storage, StoredEntry};

pub struct MemoryStorage {
    data: BTreeMap<Vec<u8>, StoredEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&mut self, key: &[u8]) -> CResult<Option<StoredEntry>> {
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], entry: StoredEntry) -> CResult<()> {
        self.data.insert(key.to_vec(), entry);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> CResult<bool> {
        Ok(self.data.remove(key).is_some())
    }

    fn list(&mut self, opts: &ListOptions) -> CResult<Vec<(Vec<u8>, StoredEntry)>> {
        let entries: Vec<_> = self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(apply_list_options(entries, opts))
    }

    fn status(&mut self) -> CResult<Status> {
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size: self
                .data
                .iter()
                .fold(0, |size, (k, v)| size + k.len() as u64 + v.value.len() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_returns_prior_presence() {
        let mut s = MemoryStorage::new();
        assert!(!s.delete(b"k").unwrap());
        s.put(b"k", StoredEntry::new(vec![1])).unwrap();
        assert!(s.delete(b"k").unwrap());
        assert!(!s.delete(b"k").unwrap());
    }

    #[test]
    fn prefix_filtering() {
        let mut s = MemoryStorage::new();
        for k in [b"aa".to_vec(), b"ab".to_vec(), b"ba".to_vec()] {
            s.put(&k, StoredEntry::new(vec![])).unwrap();
        }
        let listed =
            s.list(&ListOptions { prefix: Some(b"a".to_vec()), ..Default::default() }).unwrap();
        assert_eq!(listed.len(), 2);
    }
}
