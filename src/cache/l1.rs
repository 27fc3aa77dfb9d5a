//! L1 Cache - In-Process Memory Tier
//!
//! Bounded LRU map for one cache family. Capacity is counted in entries, not
//! bytes: byte-budget eviction is the disk tier's job.
//!
//! # Design
//!
//! - `HashMap` for lookups plus a `BTreeMap` keyed by a logical access tick,
//!   whose first element is always the least-recently-used key
//! - TTL is checked lazily on lookup; expired entries are dropped as misses
//! - Every hit bumps the access count, which stretches the entry's TTL

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::entry::{CacheEntry, Payload};

/// Default base TTL (24 hours)
pub const DEFAULT_BASE_TTL: Duration = Duration::from_secs(24 * 3600);

/// L1 Cache configuration
#[derive(Debug, Clone)]
pub struct L1Config {
    /// Maximum number of entries
    pub capacity: usize,
    /// TTL before access-frequency stretching
    pub base_ttl: Duration,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            capacity: 100,
            base_ttl: DEFAULT_BASE_TTL,
        }
    }
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    slots: HashMap<String, Slot>,
    /// tick -> key; first = least recently used
    order: BTreeMap<u64, String>,
    clock: u64,
    bytes: u64,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        self.bytes -= slot.entry.size_bytes();
        Some(slot.entry)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        self.bytes -= slot.entry.size_bytes();
        Some(slot.entry)
    }
}

/// L1 Cache - memory tier for one family
pub struct L1Cache {
    name: String,
    state: Mutex<LruState>,
    config: L1Config,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl L1Cache {
    /// Create a new L1 cache with default configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, L1Config::default())
    }

    /// Create a new L1 cache with custom configuration
    pub fn with_config(name: impl Into<String>, config: L1Config) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LruState::default()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up an entry, recording the access.
    ///
    /// An entry older than its effective TTL is removed and reported as a
    /// miss. A hit moves the key to the most-recently-used position.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let expired = match state.slots.get(key) {
            Some(slot) => slot.entry.is_expired_at(now),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            if let Some(entry) = state.remove(key) {
                info!(
                    cache = %self.name,
                    key,
                    access_count = entry.access_count(),
                    "L1 entry expired"
                );
            }
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let tick = state.next_tick();
        let slot = state.slots.get_mut(key)?;
        let old_tick = std::mem::replace(&mut slot.tick, tick);
        slot.entry.record_access();
        let entry = slot.entry.clone();
        state.order.remove(&old_tick);
        state.order.insert(tick, key.to_string());

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(cache = %self.name, key, access_count = entry.access_count(), "L1 hit");
        Some(entry)
    }

    /// Read an entry without touching recency, counters, or access count.
    /// Expired entries are invisible but left for `get` to reap.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let state = self.state.lock();
        state
            .slots
            .get(key)
            .filter(|slot| !slot.entry.is_expired())
            .map(|slot| slot.entry.clone())
    }

    /// Insert at the most-recently-used position, then evict from the
    /// least-recently-used end until capacity holds. Returns the number of
    /// entries evicted.
    pub fn put(&self, key: impl Into<String>, payload: Arc<Payload>) -> usize {
        let key = key.into();
        let entry = CacheEntry::new(key.clone(), payload, self.config.base_ttl);
        let size = entry.size_bytes();

        let mut state = self.state.lock();
        state.remove(&key);
        let tick = state.next_tick();
        state.order.insert(tick, key.clone());
        state.slots.insert(key, Slot { entry, tick });
        state.bytes += size;

        let mut evicted = 0;
        while state.slots.len() > self.config.capacity {
            match state.pop_lru() {
                Some(victim) => {
                    info!(
                        cache = %self.name,
                        key = victim.key(),
                        size_bytes = victim.size_bytes(),
                        access_count = victim.access_count(),
                        "Evicted from L1"
                    );
                    evicted += 1;
                }
                None => break,
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().remove(key)
    }

    /// Check if cache holds a key (expired or not)
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().slots.contains_key(key)
    }

    /// Keys from least to most recently used
    pub fn keys_lru_order(&self) -> Vec<String> {
        self.state.lock().order.values().cloned().collect()
    }

    /// Clear the cache
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.order.clear();
        state.bytes = 0;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of entry footprints
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn base_ttl(&self) -> Duration {
        self.config.base_ttl
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Get cache statistics
    pub fn stats(&self) -> L1Stats {
        let (entries, size_bytes) = {
            let state = self.state.lock();
            (state.slots.len(), state.bytes)
        };
        L1Stats {
            entries,
            capacity: self.capacity(),
            size_bytes,
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            expirations: self.expirations(),
        }
    }
}

/// L1 cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct L1Stats {
    pub entries: usize,
    pub capacity: usize,
    pub size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================
