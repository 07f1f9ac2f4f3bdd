//! Per-object cooperative gates ordering request delivery and
//! confirmation (§4.6).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cooperative barrier ordering request delivery to an object. While
/// closed, new `run_with` callers wait for it to re-open; `run_with_closed`
/// nests (a close counter, not a boolean), so overlapping closures each
/// hold the gate shut until they are all done.
pub struct InputGate {
    closed: AtomicUsize,
    notify: Notify,
}

impl InputGate {
    pub fn new() -> Self {
        Self { closed: AtomicUsize::new(0), notify: Notify::new() }
    }

    /// Suspends until the gate's close counter is zero.
    pub async fn wait_open(&self) {
        loop {
            if self.closed.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.notify.notified();
            if self.closed.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Runs `f` with the gate held closed, blocking any concurrent
    /// `run_with`/`wait_open` callers until it (and any other
    /// concurrently-closing caller) finishes.
    pub async fn run_with_closed<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.closed.fetch_add(1, Ordering::AcqRel);
        let result = f().await;
        if self.closed.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
        result
    }

    /// Waits for the gate to be open, then runs `f`. Does not itself
    /// close the gate.
    pub async fn run_with<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.wait_open().await;
        f().await
    }
}

impl Default for InputGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative barrier ordering confirmation of responses until the
/// writes that caused them are durable. Each `run_with` call opens a
/// fresh nested scope: futures registered via `wait_until` during that
/// scope are awaited before `run_with` returns, letting a retried
/// transaction attempt keep its own independent set of unconfirmed work.
pub struct OutputGate {
    scopes: Mutex<Vec<Vec<BoxFuture>>>,
}

impl OutputGate {
    pub fn new() -> Self {
        Self { scopes: Mutex::new(Vec::new()) }
    }

    /// Registers `fut` to be awaited before the innermost open scope's
    /// `run_with` returns. If no scope is currently open, the future is
    /// spawned in the background instead.
    pub async fn wait_until(&self, fut: BoxFuture) {
        let mut scopes = self.scopes.lock().await;
        match scopes.last_mut() {
            Some(scope) => scope.push(fut),
            None => {
                drop(scopes);
                tokio::spawn(fut);
            }
        }
    }

    pub async fn run_with<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.scopes.lock().await.push(Vec::new());
        let result = f().await;
        let pending = self.scopes.lock().await.pop().unwrap_or_default();
        for fut in pending {
            fut.await;
        }
        result
    }
}

impl Default for OutputGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as O};
    use std::sync::Arc;

    #[tokio::test]
    async fn run_with_closed_blocks_wait_open() {
        let gate = Arc::new(InputGate::new());
        let ran_read = Arc::new(AtomicBool::new(false));

        let gate2 = gate.clone();
        let closed = tokio::spawn(async move {
            gate2
                .run_with_closed(|| async {
                    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                })
                .await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let ran_read2 = ran_read.clone();
        let gate3 = gate.clone();
        let reader = tokio::spawn(async move {
            gate3.run_with(|| async { ran_read2.store(true, O::SeqCst) }).await;
        });

        closed.await.unwrap();
        reader.await.unwrap();
        assert!(ran_read.load(O::SeqCst));
    }

    #[tokio::test]
    async fn output_gate_awaits_registered_futures() {
        let gate = OutputGate::new();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();

        gate.run_with(|| async {
            gate.wait_until(Box::pin(async move {
                flag2.store(true, O::SeqCst);
            }))
            .await;
        })
        .await;

        assert!(flag.load(O::SeqCst));
    }
}
