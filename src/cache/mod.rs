//! TTL- and size-bounded in-memory caches.
//!
//! [`TtlCache`] backs both the Result Cache (query fingerprint → result
//! set) and the Artifact Conversion Cache (content id → extracted text).
//! [`SingleFlight`] collapses concurrent producers of the same key into one
//! upstream call.
//!
//! # Visibility
//!
//! An entry is visible iff `now < inserted_at + ttl`. Expired entries read
//! as misses and are dropped on the next write.
//!
//! # Eviction
//!
//! When full, an insert evicts the least-recently-*inserted* live entry.
//! Reads do not refresh position.

pub mod single_flight;

pub use single_flight::SingleFlight;

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    /// Insertion sequence; lets stale queue slots be told apart after a
    /// key is overwritten.
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.inserted_at + self.ttl
    }
}

#[derive(Debug)]
struct Entries<K, V> {
    map: HashMap<K, CacheEntry<V>>,
    order: VecDeque<(K, u64)>,
    next_seq: u64,
}

/// A FIFO, TTL-bounded map safe for concurrent readers and writers.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    name: &'static str,
    ttl: Duration,
    capacity: usize,
    entries: RwLock<Entries<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache. `capacity` is clamped to at least one entry.
    pub fn new(name: &'static str, ttl: Duration, capacity: usize) -> Self {
        Self {
            name,
            ttl,
            capacity: capacity.max(1),
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clone of the live value under `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .map
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert with the cache's default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    /// Insert with an explicit TTL. Last writer wins for a given key.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        entries.map.retain(|_, entry| entry.is_live(now));
        entries.map.remove(&key);

        while entries.map.len() >= self.capacity {
            let Some((oldest, seq)) = entries.order.pop_front() else {
                break;
            };
            let current = entries.map.get(&oldest).map(|entry| entry.seq);
            if current == Some(seq) {
                entries.map.remove(&oldest);
                debug!(cache = self.name, "Evicted oldest entry to admit a new one");
            }
        }

        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.order.push_back((key.clone(), seq));
        entries.map.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                ttl,
                seq,
            },
        );

        // Overwrites and expiries leave dead slots behind; rebuild the queue
        // before it grows without bound.
        if entries.order.len() > self.capacity * 2 {
            let mut live: Vec<(K, u64)> = entries
                .map
                .iter()
                .map(|(k, entry)| (k.clone(), entry.seq))
                .collect();
            live.sort_by_key(|(_, seq)| *seq);
            entries.order = live.into();
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.map.remove(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.map.clear();
        entries.order.clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.map.values().filter(|entry| entry.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
