//! Concurrent map with a sliding, map-wide time-to-live.
//!
//! Every `set` and every successful `get` pushes the key's deadline to `now + ttl`.
//! Keys nobody touches for longer than `ttl` are reclaimed by a background task that
//! wakes every `ttl` and sweeps an expiry-ordered queue from the oldest entry,
//! stopping at the first one that is still alive.
//!
//! The value table and the expiry queue have separate locks. Note that `get` is not
//! read-only at the queue level: renewing a deadline takes the queue lock.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::clock::{duration_millis, Clock, MonotonicClock};
use crate::error::ConfigError;

// Stale queue entries are compacted away once they outnumber live keys by this factor.
const COMPACT_FACTOR: usize = 2;
const COMPACT_MIN_LEN: usize = 64;

struct QueueEntry<K> {
    key: K,
    generation: u64,
    deadline: u64,
}

#[derive(Clone, Copy)]
struct Slot {
    generation: u64,
    deadline: u64,
}

/// Expiry-ordered queue. Re-registering a key appends a new entry and bumps the
/// key's generation; older entries for the key become stale and are skipped.
struct ExpiryQueue<K> {
    order: VecDeque<QueueEntry<K>>,
    live: HashMap<K, Slot>,
    next_generation: u64,
    ttl_millis: u64,
}

impl<K: Eq + Hash + Clone> ExpiryQueue<K> {
    fn new(ttl: Duration) -> Self {
        Self {
            order: VecDeque::new(),
            live: HashMap::new(),
            next_generation: 0,
            ttl_millis: duration_millis(ttl),
        }
    }

    fn add(&mut self, key: K, now: u64) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let deadline = now.saturating_add(self.ttl_millis);
        self.live.insert(key.clone(), Slot { generation, deadline });
        self.order.push_back(QueueEntry { key, generation, deadline });
        self.maybe_compact();
    }

    fn is_live(&self, key: &K, now: u64) -> bool {
        self.live.get(key).is_some_and(|slot| slot.deadline > now)
    }

    /// Push the key's deadline forward. Returns false if the key is unknown or
    /// already past its deadline.
    fn renew(&mut self, key: &K, now: u64) -> bool {
        if !self.is_live(key, now) {
            return false;
        }
        self.add(key.clone(), now);
        true
    }

    fn forget(&mut self, key: &K) {
        self.live.remove(key);
    }

    fn purge(&mut self, now: u64) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(front) = self.order.front() {
            let current = self.live.get(&front.key).map(|slot| slot.generation);
            if current != Some(front.generation) {
                self.order.pop_front();
                continue;
            }
            if front.deadline > now {
                break;
            }
            if let Some(entry) = self.order.pop_front() {
                self.live.remove(&entry.key);
                expired.push(entry.key);
            }
        }
        expired
    }

    fn maybe_compact(&mut self) {
        if self.order.len() < COMPACT_MIN_LEN
            || self.order.len() <= self.live.len().saturating_mul(COMPACT_FACTOR)
        {
            return;
        }
        let live = &self.live;
        self.order.retain(|entry| {
            live.get(&entry.key).is_some_and(|slot| slot.generation == entry.generation)
        });
    }
}

struct Inner<K, V> {
    items: RwLock<HashMap<K, V>>,
    queue: Mutex<ExpiryQueue<K>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn items(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn items_mut(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, ExpiryQueue<K>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge(&self) -> usize {
        let now = self.clock.now_millis();
        let mut items = self.items_mut();
        let expired = self.queue().purge(now);
        for key in &expired {
            items.remove(key);
        }
        expired.len()
    }
}

/// Generic concurrent map whose entries expire `ttl` after their last `set` or `get`.
///
/// Owns a background reclamation task, started at construction and stopped by
/// [`ExpiringMap::stop`] or on drop.
pub struct ExpiringMap<K, V> {
    inner: Arc<Inner<K, V>>,
    ttl: Duration,
    stopped: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a map on the monotonic clock. Must be called inside a Tokio runtime.
    pub fn new(ttl: Duration) -> Result<Self, ConfigError> {
        Self::with_clock(ttl, MonotonicClock::default())
    }

    /// Create a map with an explicit clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(ttl: Duration, clock: C) -> Result<Self, ConfigError> {
        Self::with_shared_clock(ttl, Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::InvalidTtl(ttl));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let inner = Arc::new(Inner {
            items: RwLock::new(HashMap::new()),
            queue: Mutex::new(ExpiryQueue::new(ttl)),
            clock,
        });

        let weak = Arc::downgrade(&inner);
        let reaper = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + ttl, ttl);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let evicted = inner.purge();
                if evicted > 0 {
                    trace!(target: "herdgate::expiring_map", evicted, "expired keys reclaimed");
                }
            }
        });

        Ok(Self { inner, ttl, stopped: AtomicBool::new(false), reaper: Mutex::new(Some(reaper)) })
    }

    /// Map-wide time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or overwrite `key`, resetting its deadline to `now + ttl`.
    pub fn set(&self, key: K, value: V) {
        let now = self.inner.clock.now_millis();
        let mut items = self.inner.items_mut();
        items.insert(key.clone(), value);
        self.inner.queue().add(key, now);
    }

    /// Read `key` and renew its deadline to `now + ttl`.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.inner.items().get(key).cloned()?;
        let now = self.inner.clock.now_millis();
        if self.inner.queue().renew(key, now) {
            Some(value)
        } else {
            None
        }
    }

    /// Read `key` without renewing its deadline.
    pub fn peek(&self, key: &K) -> Option<V> {
        let value = self.inner.items().get(key).cloned()?;
        let now = self.inner.clock.now_millis();
        if self.inner.queue().is_live(key, now) {
            Some(value)
        } else {
            None
        }
    }

    /// Return the live value for `key`, inserting `make()` if there is none.
    ///
    /// Concurrent callers for the same key all observe the same value.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }

        let now = self.inner.clock.now_millis();
        let mut items = self.inner.items_mut();
        let mut queue = self.inner.queue();
        if let Some(value) = items.get(&key) {
            if queue.renew(&key, now) {
                return value.clone();
            }
        }
        let value = make();
        items.insert(key.clone(), value.clone());
        queue.add(key, now);
        value
    }

    /// Remove `key` immediately, regardless of its deadline.
    pub fn delete(&self, key: &K) -> Option<V> {
        let mut items = self.inner.items_mut();
        let removed = items.remove(key);
        self.inner.queue().forget(key);
        removed
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.inner.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one reclamation sweep now. Returns how many keys were evicted.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge()
    }

    /// Stop the background reclamation task. Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self.reaper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl<K, V> Drop for ExpiringMap<K, V> {
    fn drop(&mut self) {
        let handle = self.reaper.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl<K, V> std::fmt::Debug for ExpiringMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringMap")
            .field("ttl", &self.ttl)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}
