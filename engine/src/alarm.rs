//! Process-wide alarm scheduler (§4.7): persists `(objectKey →
//! scheduledTime)` in its own backing store, keeps one in-memory timer
//! per near-future alarm, and re-scans periodically to arm alarms as
//! they cross into the near-future window.
//!
//! Like [`crate::engine::StorageEngine`], this is a thin `Clone`-able
//! handle over `Arc`-shared state, for the same reason: individual
//! alarm timers are `tokio::spawn`ed tasks that outlive the call that
//! armed them, so they need an owned, `'static` handle back to the
//! scheduler to fire through.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::ResolvedConfig;
use crate::engine::{AlarmBridge, BoxFuture, ObjectKey};
use crate::error::{CResult, Error};
use crate::storage::{ListOptions, Storage, StoredEntry};

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

type Callback = Arc<dyn Fn(ObjectKey) -> BoxFuture<'static> + Send + Sync>;

struct AlarmEntry {
    scheduled_time_ms: i64,
    timer: Option<JoinHandle<()>>,
}

struct SchedulerShared<S: Storage> {
    store: AsyncMutex<S>,
    alarms: AsyncMutex<HashMap<ObjectKey, AlarmEntry>>,
    poll_timer: AsyncMutex<Option<JoinHandle<()>>>,
    callback: OnceLock<Callback>,
    near_future_ms: i64,
    arm_window_ms: i64,
    poll_interval_ms: i64,
}

pub struct AlarmScheduler<S: Storage>(Arc<SchedulerShared<S>>);

impl<S: Storage> Clone for AlarmScheduler<S> {
    fn clone(&self) -> Self {
        AlarmScheduler(self.0.clone())
    }
}

impl<S: Storage + 'static> AlarmScheduler<S> {
    pub fn new(store: S, cfg: &ResolvedConfig) -> Self {
        AlarmScheduler(Arc::new(SchedulerShared {
            store: AsyncMutex::new(store),
            alarms: AsyncMutex::new(HashMap::new()),
            poll_timer: AsyncMutex::new(None),
            callback: OnceLock::new(),
            near_future_ms: cfg.alarm_near_future_ms,
            arm_window_ms: cfg.alarm_arm_window_ms,
            poll_interval_ms: cfg.alarm_poll_interval_ms,
        }))
    }

    /// Loads the `objectKey -> scheduledTime` mapping from the backing
    /// store, reconstructing each entry's scheduled time from its
    /// metadata. Timers are not armed here; call [`Self::setup_alarms`]
    /// afterward to do that.
    pub async fn setup_store(&self) -> CResult<()> {
        let entries = self.0.store.lock().await.list(&ListOptions::default())?;
        let mut alarms = self.0.alarms.lock().await;
        for (key_bytes, entry) in entries {
            if let Some(scheduled_time_ms) = entry.metadata {
                let key = ObjectKey(String::from_utf8_lossy(&key_bytes).into_owned());
                alarms.insert(key, AlarmEntry { scheduled_time_ms, timer: None });
            }
        }
        Ok(())
    }

    /// Installs `callback`, arms a timer for every alarm already due
    /// within the near-future window (§4.7), and starts the recurring
    /// poll timer that keeps re-arming alarms as they cross into that
    /// window. A `scheduledTime` already in the past arms at delay zero,
    /// firing on the runtime's next tick — the catch-up behavior §4.7
    /// describes for alarms missed while the process was down.
    pub async fn setup_alarms(&self, callback: impl Fn(ObjectKey) -> BoxFuture<'static> + Send + Sync + 'static) {
        let _ = self.0.callback.set(Arc::new(callback));
        self.arm_near_future().await;
        self.ensure_poll_timer().await;
    }

    async fn arm_near_future(&self) {
        let now = now_ms();
        let mut alarms = self.0.alarms.lock().await;
        let due: Vec<(ObjectKey, i64)> = alarms
            .iter()
            .filter(|(_, e)| e.timer.is_none() && e.scheduled_time_ms < now + self.0.near_future_ms)
            .map(|(k, e)| (k.clone(), e.scheduled_time_ms))
            .collect();
        for (key, scheduled_time_ms) in due {
            let handle = self.spawn_timer(key.clone(), scheduled_time_ms);
            if let Some(entry) = alarms.get_mut(&key) {
                entry.timer = Some(handle);
            }
        }
    }

    async fn ensure_poll_timer(&self) {
        let mut guard = self.0.poll_timer.lock().await;
        if guard.is_some() {
            return;
        }
        let scheduler = self.clone();
        let interval = Duration::from_millis(self.0.poll_interval_ms.max(1) as u64);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately; setup_alarms already armed the initial batch
            loop {
                ticker.tick().await;
                scheduler.arm_near_future().await;
            }
        });
        *guard = Some(handle);
    }

    fn spawn_timer(&self, key: ObjectKey, scheduled_time_ms: i64) -> JoinHandle<()> {
        let scheduler = self.clone();
        let delay_ms = (scheduled_time_ms - now_ms()).max(0) as u64;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            scheduler.fire(key).await;
        })
    }

    async fn fire(&self, key: ObjectKey) {
        let _ = self.delete_alarm(key.clone()).await;
        if let Some(callback) = self.0.callback.get() {
            callback(key).await;
        }
    }

    /// §4.7 `setAlarm`: replaces any prior alarm for `key`, re-arming the
    /// individual timer if the new time falls within the arm window.
    pub async fn set_alarm(&self, key: ObjectKey, scheduled_time_ms: i64) -> CResult<()> {
        if scheduled_time_ms <= 0 {
            return Err(Error::AlarmTimeNonPositive { millis: scheduled_time_ms });
        }

        self.0
            .store
            .lock()
            .await
            .put(key.0.as_bytes(), StoredEntry::with_metadata(Vec::new(), scheduled_time_ms))?;

        let mut alarms = self.0.alarms.lock().await;
        if let Some(prev) = alarms.remove(&key) {
            if let Some(timer) = prev.timer {
                timer.abort();
            }
        }
        let timer = if scheduled_time_ms - now_ms() <= self.0.arm_window_ms {
            Some(self.spawn_timer(key.clone(), scheduled_time_ms))
        } else {
            None
        };
        alarms.insert(key, AlarmEntry { scheduled_time_ms, timer });
        Ok(())
    }

    /// §4.7 `deleteAlarm`: cancels the timer (if any), drops the
    /// in-memory entry, and deletes the persisted record.
    pub async fn delete_alarm(&self, key: ObjectKey) -> CResult<()> {
        if let Some(entry) = self.0.alarms.lock().await.remove(&key) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
        self.0.store.lock().await.delete(key.0.as_bytes())?;
        Ok(())
    }

    /// §4.7 `flushAlarms`: forces the given alarms (or every alarm
    /// currently tracked, if `None`) to fire immediately and in order,
    /// regardless of their scheduled time.
    pub async fn flush_alarms(&self, keys: Option<Vec<ObjectKey>>) {
        let targets = match keys {
            Some(keys) => keys,
            None => self.0.alarms.lock().await.keys().cloned().collect(),
        };
        for key in targets {
            let _ = self.delete_alarm(key.clone()).await;
            if let Some(callback) = self.0.callback.get() {
                callback(key).await;
            }
        }
    }

    /// §4.7 `dispose`: cancels the poll timer and every individual timer,
    /// and drops the in-memory alarm map. Does not touch the backing
    /// store.
    pub async fn dispose(&self) {
        if let Some(handle) = self.0.poll_timer.lock().await.take() {
            handle.abort();
        }
        for (_, entry) in self.0.alarms.lock().await.drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }
}

impl<S: Storage + 'static> AlarmBridge for AlarmScheduler<S> {
    fn set_alarm(&self, key: ObjectKey, scheduled_time_ms: i64) -> BoxFuture<'static> {
        let scheduler = self.clone();
        Box::pin(async move {
            if let Err(err) = scheduler.set_alarm(key, scheduled_time_ms).await {
                log::error!("alarm scheduler: failed to mirror set_alarm: {err}");
            }
        })
    }

    fn delete_alarm(&self, key: ObjectKey) -> BoxFuture<'static> {
        let scheduler = self.clone();
        Box::pin(async move {
            if let Err(err) = scheduler.delete_alarm(key).await {
                log::error!("alarm scheduler: failed to mirror delete_alarm: {err}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_scheduler() -> AlarmScheduler<MemoryStorage> {
        AlarmScheduler::new(MemoryStorage::new(), &ResolvedConfig::default())
    }

    #[tokio::test]
    async fn set_then_fire_invokes_callback() {
        let scheduler = test_scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        scheduler
            .setup_alarms(move |_key| {
                let fired3 = fired2.clone();
                Box::pin(async move {
                    fired3.fetch_add(1, Ordering::SeqCst);
                })
            })
            .await;

        scheduler.set_alarm(ObjectKey::from("obj-1"), now_ms() + 20).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn past_due_alarm_fires_promptly_after_setup() {
        let store = MemoryStorage::new();
        let scheduler = AlarmScheduler::new(store, &ResolvedConfig::default());
        scheduler
            .set_alarm(ObjectKey::from("late"), now_ms() - 1000)
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        scheduler
            .setup_alarms(move |_key| {
                let fired3 = fired2.clone();
                Box::pin(async move {
                    fired3.fetch_add(1, Ordering::SeqCst);
                })
            })
            .await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn set_alarm_rejects_non_positive_time() {
        let scheduler = test_scheduler();
        let err = scheduler.set_alarm(ObjectKey::from("k"), 0).await.unwrap_err();
        assert!(matches!(err, Error::AlarmTimeNonPositive { millis: 0 }));
    }

    #[tokio::test]
    async fn delete_alarm_cancels_pending_timer() {
        let scheduler = test_scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        scheduler
            .setup_alarms(move |_key| {
                let fired3 = fired2.clone();
                Box::pin(async move {
                    fired3.fetch_add(1, Ordering::SeqCst);
                })
            })
            .await;

        let key = ObjectKey::from("cancel-me");
        scheduler.set_alarm(key.clone(), now_ms() + 50).await.unwrap();
        scheduler.delete_alarm(key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
