//! A per-object transactional storage engine: optimistic-concurrency
//! transactions, a write-coalescing shadow buffer, cooperative I/O gates
//! ordering request delivery and confirmation, and a cross-object alarm
//! scheduler, layered over a pluggable backing key-value store.

pub mod alarm;
pub mod config;
pub mod engine;
pub mod error;
pub mod gates;
pub mod limits;
pub mod mutex;
pub mod serialize;
pub mod shadow;
pub mod storage;
pub mod transaction;

pub use engine::{AlarmBridge, CallOptions, ObjectKey, StorageEngine};
pub use error::{CResult, Error};
pub use storage::{ListOptions, Status, Storage, StoredEntry};
pub use transaction::Transaction;
