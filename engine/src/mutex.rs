//! Fair multi-reader/single-writer lock with writer priority (§4.1).
//!
//! Built directly on `tokio::sync::RwLock`: tokio documents that lock
//! acquisitions are granted in the order they were requested and that a
//! writer does not starve behind a stream of readers — once a writer is
//! queued, subsequently-requested readers queue behind it. That is
//! exactly the writer-preference contract this module's callers need, so
//! there is no reason to hand-roll a second implementation of it.
//!
//! `with_read`/`with_write` hand the closure the guard itself (not a
//! reference borrowed from one), with the guard's lifetime named as an
//! explicit parameter of the method rather than elided. Eliding it would
//! make the closure bound `for<'r> FnOnce(&'r T) -> Fut`, which has no
//! solution once the closure's returned future borrows from `'r` — every
//! caller here returns an `async` block that does exactly that. Naming
//! the lifetime ties it to this one call instead of quantifying over all
//! possible calls, which is all a `FnOnce` ever needs.

use std::future::Future;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct ReadWriteMutex<T> {
    inner: RwLock<T>,
}

impl<T> ReadWriteMutex<T> {
    pub fn new(value: T) -> Self {
        Self { inner: RwLock::new(value) }
    }

    /// Acquires the read lock, runs `f` with shared access, and releases
    /// it once `f`'s future resolves (on success or error).
    pub async fn with_read<'a, F, Fut, R>(&'a self, f: F) -> R
    where
        F: FnOnce(RwLockReadGuard<'a, T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let guard = self.inner.read().await;
        f(guard).await
    }

    /// Acquires the write lock, runs `f` with exclusive access, and
    /// releases it once `f`'s future resolves (on success or error).
    pub async fn with_write<'a, F, Fut, R>(&'a self, f: F) -> R
    where
        F: FnOnce(RwLockWriteGuard<'a, T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let guard = self.inner.write().await;
        f(guard).await
    }

    /// Acquires the write lock directly. Used by callers that need to
    /// build a borrowed view spanning more than one field of `T` (e.g.
    /// [`crate::engine::EngineBelow`]) rather than running a single
    /// self-contained closure.
    pub async fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn readers_observe_writer_writes() {
        let mutex = Arc::new(ReadWriteMutex::new(0));
        mutex.with_write(|mut v| async move { *v += 1 }).await;
        let seen = mutex.with_read(|v| async move { *v }).await;
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn concurrent_readers_run_together() {
        let mutex = Arc::new(ReadWriteMutex::new(5));
        let (a, b) = tokio::join!(
            mutex.with_read(|v| async move { *v }),
            mutex.with_read(|v| async move { *v }),
        );
        assert_eq!((a, b), (5, 5));
    }

    #[tokio::test]
    async fn write_error_still_releases_lock() {
        let mutex = ReadWriteMutex::new(0);
        let result: Result<(), &'static str> =
            mutex.with_write(|_v| async { Err("boom") }).await;
        assert!(result.is_err());
        // A subsequent acquisition must not deadlock.
        mutex.with_write(|mut v| async move { *v = 1 }).await;
        assert_eq!(mutex.with_read(|v| async move { *v }).await, 1);
    }
}
