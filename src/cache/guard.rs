//! Concurrency Guard - Cache-Stampede Prevention
//!
//! Collapses concurrent miss resolutions for the same key into one.
//!
//! ```text
//!   caller ──► check ──hit──► Cached
//!                │
//!               miss
//!                │
//!         in flight? ──yes──► wait on Notify (bounded) ──cleared──► check ──hit──► Cached
//!                │                      │                            │
//!                no                  timeout ──► load() unlocked    miss (evicted, or the
//!                │                                                   │  load failed)
//!                ├◄──────────────────────────────────────────────────┘
//!                │
//!        lock key ──► check ──hit──► Cached
//!                │
//!          mark in flight ──► load() ──► Loaded | Miss
//!                │
//!         (drop) clear marker, notify waiters
//! ```
//!
//! Slots are created lazily per key. The registry is swept of slots nobody
//! holds once it grows past a threshold, and on demand via [`ConcurrencyGuard::sweep`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::error::Result;

/// Guard configuration
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Longest a caller waits on someone else's in-flight load
    pub wait_timeout: Duration,
    /// Registry size above which idle slots are swept
    pub sweep_threshold: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(30),
            sweep_threshold: 4096,
        }
    }
}

/// How a key was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    /// Found by `check`, possibly after waiting on another caller's load
    Cached(T),
    /// Produced by this caller's `load`
    Loaded(T),
    /// Neither `check` nor `load` produced a value
    Miss,
}

impl<T> Resolution<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Resolution::Cached(v) | Resolution::Loaded(v) => Some(v),
            Resolution::Miss => None,
        }
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Resolution::Miss)
    }
}

struct KeySlot {
    lock: Mutex<()>,
    in_flight: AtomicBool,
    done: Notify,
}

impl KeySlot {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            in_flight: AtomicBool::new(false),
            done: Notify::new(),
        }
    }
}

/// Clears the in-flight marker on every exit path, including cancellation
struct InFlight<'a> {
    slot: &'a KeySlot,
}

impl<'a> InFlight<'a> {
    fn mark(slot: &'a KeySlot) -> Self {
        slot.in_flight.store(true, Ordering::Release);
        Self { slot }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.slot.in_flight.store(false, Ordering::Release);
        self.slot.done.notify_waiters();
    }
}

/// Per-key mutual exclusion and in-flight tracking
pub struct ConcurrencyGuard {
    slots: DashMap<String, Arc<KeySlot>>,
    config: GuardConfig,
    stampede_prevented: AtomicU64,
    wait_timeouts: AtomicU64,
    loads: AtomicU64,
    slots_swept: AtomicU64,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::with_config(GuardConfig::default())
    }

    pub fn with_config(config: GuardConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
            stampede_prevented: AtomicU64::new(0),
            wait_timeouts: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            slots_swept: AtomicU64::new(0),
        }
    }

    fn slot(&self, key: &str) -> Arc<KeySlot> {
        let existing = self.slots.get(key).map(|slot| slot.value().clone());
        let slot = match existing {
            Some(slot) => slot,
            None => self
                .slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(KeySlot::new()))
                .value()
                .clone(),
        };
        if self.slots.len() > self.config.sweep_threshold {
            self.sweep();
        }
        slot
    }

    /// Resolve `key` through `check`, running `load` at most once across
    /// concurrent callers.
    ///
    /// `check` must be cheap and non-blocking (an L1 lookup). `load` runs
    /// with the key's lock held and should populate whatever `check` reads.
    /// Errors from `load` propagate to its caller only. A waiter that wakes
    /// and still finds nothing through `check` runs its own `load` under the
    /// lock, so a failed, cancelled or evicted load never turns into a miss
    /// for the callers queued behind it.
    pub async fn resolve<T, C, L, Fut>(&self, key: &str, check: C, load: L) -> Result<Resolution<T>>
    where
        C: Fn() -> Option<T>,
        L: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(value) = check() {
            return Ok(Resolution::Cached(value));
        }

        let slot = self.slot(key);

        if slot.in_flight.load(Ordering::Acquire) {
            self.stampede_prevented.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Load in flight, waiting");

            if !self.wait_for(&slot).await {
                self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key,
                    timeout_ms = self.config.wait_timeout.as_millis() as u64,
                    "Timed out waiting on in-flight load, loading independently"
                );
                self.loads.fetch_add(1, Ordering::Relaxed);
                return Ok(match load().await? {
                    Some(value) => Resolution::Loaded(value),
                    None => Resolution::Miss,
                });
            }
            if let Some(value) = check() {
                return Ok(Resolution::Cached(value));
            }
            // The leader's result is already gone from `check`; resolve it
            // ourselves under the lock
            debug!(key, "Value not visible after wait, loading under lock");
        }

        let _lock = slot.lock.lock().await;
        if let Some(value) = check() {
            // Someone finished between the first check and the lock
            self.stampede_prevented.fetch_add(1, Ordering::Relaxed);
            return Ok(Resolution::Cached(value));
        }

        let _marker = InFlight::mark(&slot);
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(match load().await? {
            Some(value) => Resolution::Loaded(value),
            None => Resolution::Miss,
        })
    }

    /// Wait until the slot's in-flight marker clears. Returns false if the
    /// bound elapsed first.
    async fn wait_for(&self, slot: &KeySlot) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.wait_timeout;
        loop {
            let notified = slot.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !slot.in_flight.load(Ordering::Acquire) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !slot.in_flight.load(Ordering::Acquire);
            }
        }
    }

    /// Run `f` holding the key's exclusive lock
    pub async fn run_exclusive<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = self.slot(key);
        let _lock = slot.lock.lock().await;
        f().await
    }

    /// Whether a load for `key` is running right now
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .map_or(false, |slot| slot.in_flight.load(Ordering::Acquire))
    }

    /// Drop slots no caller currently holds. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            self.slots_swept.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = self.slots.len(), "Swept idle key slots");
        }
        removed
    }

    /// Number of key slots currently registered
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn stampede_prevented(&self) -> u64 {
        self.stampede_prevented.load(Ordering::Relaxed)
    }

    pub fn wait_timeouts(&self) -> u64 {
        self.wait_timeouts.load(Ordering::Relaxed)
    }

    /// Number of times a `load` closure was run
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            slots: self.slot_count(),
            loads: self.loads(),
            stampede_prevented: self.stampede_prevented(),
            wait_timeouts: self.wait_timeouts(),
            slots_swept: self.slots_swept.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GuardStats {
    pub slots: usize,
    pub loads: u64,
    pub stampede_prevented: u64,
    pub wait_timeouts: u64,
    pub slots_swept: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use tokio::sync::oneshot;

    type Store = Arc<SyncMutex<HashMap<String, u32>>>;

    fn check(store: &Store, key: &str) -> Option<u32> {
        store.lock().get(key).copied()
    }

    #[tokio::test]
    async fn test_hit_skips_load() {
        let guard = ConcurrencyGuard::new();
        let store: Store = Arc::new(SyncMutex::new(HashMap::from([("k".to_string(), 7)])));

        let res = guard
            .resolve("k", || check(&store, "k"), || async { Ok(Some(0)) })
            .await
            .unwrap();
        assert_eq!(res, Resolution::Cached(7));
        assert_eq!(guard.loads(), 0);
        assert_eq!(guard.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_load_and_miss() {
        let guard = ConcurrencyGuard::new();
        let res: Resolution<u32> = guard
            .resolve("k", || None, || async { Ok(None) })
            .await
            .unwrap();
        assert!(res.is_miss());

        let res = guard
            .resolve("k", || None, || async { Ok(Some(3)) })
            .await
            .unwrap();
        assert_eq!(res, Resolution::Loaded(3));
        assert!(!guard.is_in_flight("k"));
    }

    #[tokio::test]
    async fn test_load_error_clears_marker() {
        let guard = ConcurrencyGuard::new();
        let res: Result<Resolution<u32>> = guard
            .resolve("k", || None, || async { Err(Error::Internal("boom".into())) })
            .await;
        assert_matches!(res, Err(Error::Internal(_)));
        assert!(!guard.is_in_flight("k"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let guard = Arc::new(ConcurrencyGuard::new());
        let store: Store = Arc::new(SyncMutex::new(HashMap::new()));
        let loads = Arc::new(AtomicU64::new(0));
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let leader = {
            let (guard, store, loads) = (guard.clone(), store.clone(), loads.clone());
            let writer = store.clone();
            tokio::spawn(async move {
                guard
                    .resolve(
                        "k",
                        || check(&store, "k"),
                        || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            let _ = started_tx.send(());
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            writer.lock().insert("k".into(), 42);
                            Ok(Some(42))
                        },
                    )
                    .await
            })
        };
        started_rx.await.unwrap();

        let followers: Vec<_> = (0..7)
            .map(|_| {
                let (guard, store, loads) = (guard.clone(), store.clone(), loads.clone());
                tokio::spawn(async move {
                    guard
                        .resolve(
                            "k",
                            || check(&store, "k"),
                            || async move {
                                loads.fetch_add(1, Ordering::SeqCst);
                                Ok(Some(0))
                            },
                        )
                        .await
                })
            })
            .collect();

        assert_eq!(leader.await.unwrap().unwrap(), Resolution::Loaded(42));
        for follower in followers {
            assert_eq!(follower.await.unwrap().unwrap(), Resolution::Cached(42));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(guard.stampede_prevented(), 7);
        assert_eq!(guard.wait_timeouts(), 0);
    }

    #[tokio::test]
    async fn test_wait_timeout_degrades_to_own_load() {
        let guard = Arc::new(ConcurrencyGuard::with_config(GuardConfig {
            wait_timeout: Duration::from_millis(50),
            ..Default::default()
        }));
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let slow = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .resolve("k", || None::<u32>, || async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok(Some(1))
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let res = guard
            .resolve("k", || None, || async { Ok(Some(2)) })
            .await
            .unwrap();
        assert_eq!(res, Resolution::Loaded(2));
        assert_eq!(guard.wait_timeouts(), 1);
        assert_eq!(slow.await.unwrap().unwrap(), Resolution::Loaded(1));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let guard = Arc::new(ConcurrencyGuard::new());
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocked = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .resolve("a", || None::<u32>, || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(Some(1))
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            guard.resolve("b", || None, || async { Ok(Some(2)) }),
        )
        .await
        .expect("key b must not wait on key a")
        .unwrap();
        assert_eq!(other, Resolution::Loaded(2));

        release_tx.send(()).unwrap();
        assert_eq!(blocked.await.unwrap().unwrap(), Resolution::Loaded(1));
    }

    #[tokio::test]
    async fn test_waiter_loads_when_value_is_not_visible() {
        let guard = Arc::new(ConcurrencyGuard::new());
        let loads = Arc::new(AtomicU64::new(0));
        let (started_tx, started_rx) = oneshot::channel::<()>();

        // `check` never sees anything, as with a zero-capacity memory tier
        let leader = {
            let (guard, loads) = (guard.clone(), loads.clone());
            tokio::spawn(async move {
                guard
                    .resolve("k", || None::<u32>, || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Some(7))
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let (guard, loads) = (guard.clone(), loads.clone());
                tokio::spawn(async move {
                    guard
                        .resolve("k", || None::<u32>, || async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            Ok(Some(7))
                        })
                        .await
                })
            })
            .collect();

        assert_eq!(leader.await.unwrap().unwrap(), Resolution::Loaded(7));
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), Resolution::Loaded(7));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 4);
        assert_eq!(guard.stampede_prevented(), 3);
        assert_eq!(guard.wait_timeouts(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_load_releases_waiters() {
        let guard = Arc::new(ConcurrencyGuard::new());
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let doomed = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .resolve("k", || None::<u32>, || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<()>().await;
                        Ok(Some(1))
                    })
                    .await
            })
        };
        started_rx.await.unwrap();
        assert!(guard.is_in_flight("k"));

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.resolve("k", || None::<u32>, || async { Ok(Some(9)) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        doomed.abort();

        let res = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter must wake when the load is cancelled")
            .unwrap()
            .unwrap();
        assert_eq!(res, Resolution::Loaded(9));
        assert!(!guard.is_in_flight("k"));
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_slots() {
        let guard = ConcurrencyGuard::with_config(GuardConfig {
            sweep_threshold: 8,
            ..Default::default()
        });
        for i in 0..8 {
            guard
                .resolve(&format!("k{}", i), || None::<u32>, || async { Ok(None) })
                .await
                .unwrap();
        }
        assert_eq!(guard.slot_count(), 8);

        // The ninth slot pushes the registry past the threshold
        guard
            .resolve("k8", || None::<u32>, || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(guard.slot_count(), 1);
        assert_eq!(guard.stats().slots_swept, 8);

        assert_eq!(guard.sweep(), 1);
        assert_eq!(guard.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_run_exclusive_serializes_same_key() {
        let guard = Arc::new(ConcurrencyGuard::new());
        let active = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let (guard, active, peak) = (guard.clone(), active.clone(), peak.clone());
                tokio::spawn(async move {
                    guard
                        .run_exclusive("k", || async {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
