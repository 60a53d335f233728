use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Slot<V> {
    value: V,
    expires_at: Instant,
    touched: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Slot<V>>,
    tick: u64,
}

/// Bounded TTL map. Expired slots are dropped on access; when full, the
/// least-recently-touched slot is evicted to make room.
pub struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                tick: 0,
            }),
            ttl,
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        let now = Instant::now();
        let mut hit = None;
        let mut expired = false;
        if let Some(slot) = inner.map.get_mut(key) {
            if slot.expires_at > now {
                slot.touched = tick;
                hit = Some(slot.value.clone());
            } else {
                expired = true;
            }
        }
        if expired {
            inner.map.remove(key);
        }
        match hit {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        let now = Instant::now();
        if !inner.map.contains_key(&key) && inner.map.len() >= self.capacity {
            inner.map.retain(|_, slot| slot.expires_at > now);
            if inner.map.len() >= self.capacity {
                if let Some(oldest) = inner
                    .map
                    .iter()
                    .min_by_key(|(_, slot)| slot.touched)
                    .map(|(k, _)| k.clone())
                {
                    inner.map.remove(&oldest);
                }
            }
        }
        inner.map.insert(
            key,
            Slot {
                value,
                expires_at: now + ttl,
                touched: tick,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .map
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire() {
        let cache = TtlCache::new(Duration::from_millis(20), 8);
        cache.insert("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn full_cache_evicts_least_recently_touched() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.get(&"a");
        cache.insert("c", 3);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn counters_track_hits_and_misses() {
        let cache = TtlCache::new(Duration::from_secs(60), 8);
        cache.insert("k", 1);
        cache.get(&"k");
        cache.get(&"absent");
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = TtlCache::new(Duration::from_secs(60), 8);
        cache.insert("k", 1);
        cache.invalidate(&"k");
        assert_eq!(cache.get(&"k"), None);
    }
}
