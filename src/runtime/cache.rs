//! Shared object cache with time-based expiry
//!
//! The in-memory cache holds at most a fixed number of entries; a store past
//! the bound drops expired entries first, then the least recently used.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::context::CacheObject;

/// Entry bound used by [`MemoryObjectCache::new`].
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Key/value store consulted by Lookup and filled by the backend machine.
pub trait ObjectCache: Send + Sync {
    /// Fresh object stored under `key`.
    fn get(&self, key: &str) -> Option<CacheObject>;

    /// Store `object` for `ttl`. Non-positive TTLs are not stored.
    fn set(&self, key: &str, object: CacheObject, ttl: Duration);

    /// Drop the entry for `key`, returning whether one existed.
    fn remove(&self, key: &str) -> bool;

    /// Drop every expired entry, returning how many were removed.
    fn purge_expired(&self) -> usize;
}

#[derive(Debug, Clone)]
struct Entry {
    object: CacheObject,
    expires: DateTime<Utc>,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a fresh entry.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Successful stores.
    pub stores: u64,
    /// Entries dropped on expiry.
    pub expired: u64,
    /// Fresh entries dropped to stay within the entry bound.
    pub evicted: u64,
}

/// In-process cache guarded by a reader/writer lock.
pub struct MemoryObjectCache {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

impl MemoryObjectCache {
    /// Cache using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Cache using a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            max_entries: DEFAULT_MAX_ENTRIES,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Bound the number of stored entries. Zero is treated as one.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Configured entry bound.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of stored entries, including not yet evicted expired ones.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Make room for one more entry besides `keep`.
    fn make_room(&self, entries: &mut HashMap<String, Entry>, keep: &str, now: DateTime<Utc>) {
        if entries.len() <= self.max_entries {
            return;
        }
        let before = entries.len();
        entries.retain(|key, entry| key == keep || entry.expires > now);
        self.expired
            .fetch_add((before - entries.len()) as u64, Ordering::Relaxed);

        while entries.len() > self.max_entries {
            let victim = entries
                .iter()
                .filter(|(key, _)| key.as_str() != keep)
                .min_by_key(|(_, entry)| entry.object.last_used)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                break;
            };
            entries.remove(&victim);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %victim, "evicted least recently used object");
        }
    }
}

impl Default for MemoryObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectCache for MemoryObjectCache {
    fn get(&self, key: &str) -> Option<CacheObject> {
        let now = self.clock.now();
        let fresh = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires > now => Some(entry.object.clone()),
                Some(_) => None,
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };

        match fresh {
            Some(mut object) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                object.last_used = now;
                if let Some(entry) = self.entries.write().get_mut(key) {
                    entry.object.last_used = now;
                }
                Some(object)
            }
            None => {
                let mut entries = self.entries.write();
                if entries.get(key).is_some_and(|entry| entry.expires <= now) {
                    entries.remove(key);
                    self.expired.fetch_add(1, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set(&self, key: &str, mut object: CacheObject, ttl: Duration) {
        if ttl <= Duration::zero() {
            return;
        }
        let now = self.clock.now();
        object.last_used = now;
        object.ttl = ttl;
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            Entry {
                object,
                expires: now + ttl,
            },
        );
        self.make_room(&mut entries, key, now);
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires > now);
        let removed = before - entries.len();
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::BackendResponse;

    fn object(status: i64) -> CacheObject {
        let beresp = BackendResponse {
            status,
            ..BackendResponse::default()
        };
        CacheObject::from_backend(&beresp, Utc::now())
    }

    #[test]
    fn entries_expire_with_the_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = MemoryObjectCache::with_clock(clock.clone());
        cache.set("k", object(200), Duration::seconds(60));

        clock.advance(Duration::seconds(59));
        let hit = cache.get("k").unwrap();
        assert_eq!(hit.ttl, Duration::seconds(60));

        clock.advance(Duration::seconds(1));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                stores: 1,
                expired: 1,
                evicted: 0,
            }
        );
    }

    #[test]
    fn zero_ttl_is_not_stored_and_remove_reports_presence() {
        let cache = MemoryObjectCache::new();
        cache.set("zero", object(200), Duration::zero());
        assert!(cache.get("zero").is_none());

        cache.set("k", object(404), Duration::seconds(5));
        assert!(cache.remove("k"));
        assert!(!cache.remove("k"));
    }

    #[test]
    fn purge_expired_sweeps_stale_entries() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = MemoryObjectCache::with_clock(clock.clone());
        cache.set("short", object(200), Duration::seconds(1));
        cache.set("long", object(200), Duration::seconds(100));
        clock.advance(Duration::seconds(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn full_cache_evicts_least_recently_used() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = MemoryObjectCache::with_clock(clock.clone()).with_max_entries(2);
        cache.set("a", object(200), Duration::seconds(60));
        clock.advance(Duration::seconds(1));
        cache.set("b", object(200), Duration::seconds(60));
        clock.advance(Duration::seconds(1));
        assert!(cache.get("a").is_some());
        clock.advance(Duration::seconds(1));

        cache.set("c", object(200), Duration::seconds(60));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evicted, 1);
    }

    #[test]
    fn full_cache_drops_expired_entries_before_fresh_ones() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = MemoryObjectCache::with_clock(clock.clone()).with_max_entries(2);
        cache.set("stale", object(200), Duration::seconds(1));
        clock.advance(Duration::seconds(1));
        cache.set("fresh", object(200), Duration::seconds(60));
        clock.advance(Duration::seconds(1));

        cache.set("new", object(200), Duration::seconds(60));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("fresh").is_some());
        let stats = cache.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.evicted, 0);
    }
}
