//! An append-only log file, descended from the teacher's
//! `kv::storage::log::Log`. Entries are encoded as:
//!
//! - Key length as big-endian u32.
//! - Value length as big-endian i32, or -1 for tombstones.
//! - Key as raw bytes.
//! - Value as raw bytes (the `bincode`-encoded [`crate::storage::StoredEntry`]).
//!
//! The log itself knows nothing about `StoredEntry`; it just shuffles
//! opaque byte buffers. [`super::file::FileStorage`] is the layer that
//! encodes/decodes entries before writing them through the log.

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs4::FileExt;

use crate::error::{CResult, Error};

/// Maps a key to its most recent value's position and length in the log
/// file. Ordered so the engine can serve `list` by walking the map.
pub type KeyDir = BTreeMap<Vec<u8>, (u64, u32)>;

pub struct Log {
    pub(crate) path: PathBuf,
    pub(crate) file: std::fs::File,
}

impl Log {
    /// Opens a log file, creating it if missing, and takes an exclusive
    /// lock on it for the lifetime of this handle.
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let file =
            std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        if try_lock {
            file.try_lock_exclusive().map_err(|err| {
                Error::Internal(format!("failed to lock {}: {err}", path.display()))
            })?;
        }

        Ok(Self { path, file })
    }

    /// Scans the log from the start to rebuild the in-memory key directory,
    /// truncating a torn write left by an unclean shutdown.
    pub fn build_keydir(&mut self) -> CResult<KeyDir> {
        let mut len_buf = [0u8; 4];
        let mut keydir = KeyDir::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            let mut read_entry = || -> Result<(Vec<u8>, u64, Option<u32>), std::io::Error> {
                r.read_exact(&mut len_buf)?;
                let key_len = u32::from_be_bytes(len_buf);
                r.read_exact(&mut len_buf)?;
                let value_len_or_tombstone = match i32::from_be_bytes(len_buf) {
                    l if l >= 0 => Some(l as u32),
                    _ => None,
                };
                let value_pos = pos + 4 + 4 + key_len as u64;

                let mut key = vec![0; key_len as usize];
                r.read_exact(&mut key)?;

                if let Some(value_len) = value_len_or_tombstone {
                    if value_pos + value_len as u64 > file_len {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "value extends beyond end of file",
                        ));
                    }
                    r.seek_relative(value_len as i64)?;
                }

                Ok((key, value_pos, value_len_or_tombstone))
            };

            match read_entry() {
                Ok((key, value_pos, Some(value_len))) => {
                    keydir.insert(key, (value_pos, value_len));
                    pos = value_pos + value_len as u64;
                }
                Ok((key, value_pos, None)) => {
                    keydir.remove(&key);
                    pos = value_pos;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!("found incomplete entry at offset {pos}, truncating file");
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(keydir)
    }

    pub fn read_value(&mut self, value_pos: u64, value_len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends a key/value entry, using `None` for a tombstone. Returns
    /// the position and length of the whole entry.
    pub fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len = value.map_or(0, |v| v.len() as u32);
        let value_len_or_tombstone = value.map_or(-1, |v| v.len() as i32);
        let len = 4 + 4 + key_len + value_len;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(len as usize, &mut self.file);
        w.write_all(&key_len.to_be_bytes())?;
        w.write_all(&value_len_or_tombstone.to_be_bytes())?;
        w.write_all(key)?;
        if let Some(value) = value {
            w.write_all(value)?;
        }
        w.flush()?;

        Ok((pos, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_prefix_on_torn_write() -> CResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("complete");
        let trunc_path = dir.path().join("truncated");

        let mut log = Log::new(path.clone())?;
        let (pos, len) = log.write_entry(b"key", Some(&[1, 2, 3]))?;
        let end = pos + len as u64;
        drop(log);

        let size = std::fs::metadata(&path)?.len();
        for cut in 0..end {
            std::fs::copy(&path, &trunc_path)?;
            let f = std::fs::OpenOptions::new().write(true).open(&trunc_path)?;
            f.set_len(cut)?;
            drop(f);

            let mut log = Log::new_with_lock(trunc_path.clone(), false)?;
            let keydir = log.build_keydir()?;
            assert!(keydir.is_empty());
        }

        std::fs::copy(&path, &trunc_path)?;
        let mut log = Log::new_with_lock(trunc_path, false)?;
        let keydir = log.build_keydir()?;
        assert_eq!(keydir.len(), 1);
        assert_eq!(size, end);
        Ok(())
    }

    #[test]
    fn exclusive_lock_rejects_second_opener() -> CResult<()> {
        let path = tempfile::tempdir().unwrap().path().join("locked");
        let log = Log::new(path.clone())?;
        assert!(Log::new(path.clone()).is_err());
        drop(log);
        assert!(Log::new(path).is_ok());
        Ok(())
    }
}
