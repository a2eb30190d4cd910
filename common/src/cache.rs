use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    captured_at: Instant,
}

impl<V> CacheEntry<V> {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub ttl_seconds: f64,
}

/// TTL keyed store. Expired entries are only skipped on read, never swept, so
/// a caller that tolerates older data can still reach them via `get_within`.
#[derive(Debug)]
pub struct FreshnessCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> FreshnessCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        self.get_within_at(key, self.ttl, now)
    }

    pub fn get_within(&self, key: &K, max_age: Duration) -> Option<V> {
        self.get_within_at(key, max_age, Instant::now())
    }

    pub fn get_within_at(&self, key: &K, max_age: Duration, now: Instant) -> Option<V> {
        let entries = self.lock();
        entries
            .get(key)
            .filter(|entry| entry.age(now) <= max_age)
            .map(|entry| entry.value.clone())
    }

    /// Last stored value whatever its age.
    pub fn get_any(&self, key: &K) -> Option<V> {
        self.lock().get(key).map(|entry| entry.value.clone())
    }

    pub fn age(&self, key: &K) -> Option<Duration> {
        let now = Instant::now();
        self.lock().get(key).map(|entry| entry.age(now))
    }

    pub fn set(&self, key: K, value: V) {
        self.set_at(key, value, Instant::now());
    }

    pub fn set_at(&self, key: K, value: V, now: Instant) {
        self.lock().insert(
            key,
            CacheEntry {
                value,
                captured_at: now,
            },
        );
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> CacheStats {
        let entries = self.lock();
        let valid_entries = entries
            .values()
            .filter(|entry| entry.age(now) <= self.ttl)
            .count();
        CacheStats {
            total_entries: entries.len(),
            valid_entries,
            expired_entries: entries.len() - valid_entries,
            ttl_seconds: self.ttl.as_secs_f64(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
