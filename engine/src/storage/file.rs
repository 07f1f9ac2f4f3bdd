//! An on-disk backing store, descended from the teacher's
//! `kv::storage::log_cask::LogCask`: a single append-only log plus an
//! in-memory [`KeyDir`] rebuilt by scanning the log on open. Entries are
//! `bincode`-encoded before being appended, since the log format only
//! understands raw byte values.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;
use crate::storage::log::{KeyDir, Log};
use crate::storage::{apply_list_options, ListOptions, Status, Storage, StoredEntry};

/// On-disk representation of a [`StoredEntry`]; kept separate so the log
/// format doesn't need to know about `objstore`'s entry shape.
#[derive(Serialize, Deserialize)]
struct Envelope {
    value: Vec<u8>,
    metadata: Option<i64>,
}

impl From<StoredEntry> for Envelope {
    fn from(e: StoredEntry) -> Self {
        Envelope { value: e.value, metadata: e.metadata }
    }
}

impl From<Envelope> for StoredEntry {
    fn from(e: Envelope) -> Self {
        StoredEntry { value: e.value, metadata: e.metadata }
    }
}

pub struct FileStorage {
    log: Log,
    keydir: KeyDir,
}

impl FileStorage {
    /// Opens or creates a file-backed store at `path`, taking an
    /// exclusive lock on it for the lifetime of this handle.
    pub fn create(path: PathBuf) -> CResult<Self> {
        Self::create_with_lock(path, true)
    }

    pub fn create_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        let mut log = Log::new_with_lock(path, try_lock)?;
        let keydir = log.build_keydir()?;
        Ok(Self { log, keydir })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.log.path
    }
}

impl Storage for FileStorage {
    fn get(&mut self, key: &[u8]) -> CResult<Option<StoredEntry>> {
        let Some((value_pos, value_len)) = self.keydir.get(key).copied() else {
            return Ok(None);
        };
        let bytes = self.log.read_value(value_pos, value_len)?;
        let envelope: Envelope = bincode::deserialize(&bytes)?;
        Ok(Some(envelope.into()))
    }

    fn put(&mut self, key: &[u8], entry: StoredEntry) -> CResult<()> {
        let envelope: Envelope = entry.into();
        let bytes = bincode::serialize(&envelope)?;
        let (pos, len) = self.log.write_entry(key, Some(&bytes))?;
        let value_len = bytes.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> CResult<bool> {
        let existed = self.keydir.remove(key).is_some();
        if existed {
            self.log.write_entry(key, None)?;
        }
        Ok(existed)
    }

    fn list(&mut self, opts: &ListOptions) -> CResult<Vec<(Vec<u8>, StoredEntry)>> {
        let positions: Vec<_> =
            self.keydir.iter().map(|(k, (pos, len))| (k.clone(), *pos, *len)).collect();
        let mut entries = Vec::with_capacity(positions.len());
        for (key, pos, len) in positions {
            let bytes = self.log.read_value(pos, len)?;
            let envelope: Envelope = bincode::deserialize(&bytes)?;
            entries.push((key, StoredEntry::from(envelope)));
        }
        Ok(apply_list_options(entries, opts))
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.keydir.len() as u64;
        let size =
            self.keydir.iter().fold(0, |size, (k, (_, len))| size + k.len() as u64 + *len as u64);
        Ok(Status { name: "file".to_string(), keys, size })
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if let Err(err) = self.log.file.sync_all() {
            log::error!("failed to flush {}: {err}", self.log.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_preserves_state() -> CResult<()> {
        let path = tempfile::tempdir().unwrap().path().join("db");
        let mut s = FileStorage::create(path.clone())?;
        s.put(b"a", StoredEntry::with_metadata(vec![1, 2, 3], 42))?;
        s.put(b"b", StoredEntry::new(vec![]))?;
        s.delete(b"b")?;
        drop(s);

        let mut reopened = FileStorage::create(path)?;
        assert_eq!(
            reopened.get(b"a")?,
            Some(StoredEntry::with_metadata(vec![1, 2, 3], 42))
        );
        assert_eq!(reopened.get(b"b")?, None);
        Ok(())
    }
}
