//! Segmented LRU cache for hot metadata
//!
//! Entries start in a probation segment and move to a protected segment on
//! re-access, so one-shot lookups (a readdir sweep, a cold path walk)
//! cannot flush the working set of repeatedly used inodes and dentries.
//! Eviction drains probation before it touches protected entries; when the
//! protected segment outgrows its share, its coldest entries fall back to
//! probation rather than leaving the cache.
//!
//! Recency is a monotonic access stamp; each segment keeps a stamp-ordered
//! index, so promotion and eviction are O(log n) in the segment size.
//!
//! Partitions use this as their read-through hot index, keyed by inode id
//! or by `(parent, name)`.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fraction of capacity reserved for the protected segment (4/5)
const PROTECTED_NUM: usize = 4;
const PROTECTED_DEN: usize = 5;

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Hit ratio in `[0.0, 1.0]`
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment {
    Probation,
    Protected,
}

struct Entry<V> {
    value: V,
    segment: Segment,
    /// Access stamp locating this entry in its segment's order index
    stamp: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Stamp-ordered keys seen once since their last eviction
    probation: BTreeMap<u64, K>,
    /// Stamp-ordered keys that earned a re-access
    protected: BTreeMap<u64, K>,
    /// Monotonic access counter
    tick: u64,
    capacity: usize,
    protected_cap: usize,
}

impl<K: Clone + Eq + Hash, V> CacheState<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            probation: BTreeMap::new(),
            protected: BTreeMap::new(),
            tick: 0,
            capacity,
            protected_cap: (capacity * PROTECTED_NUM / PROTECTED_DEN).max(1),
        }
    }

    fn next_stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn order_index(&mut self, segment: Segment) -> &mut BTreeMap<u64, K> {
        match segment {
            Segment::Probation => &mut self.probation,
            Segment::Protected => &mut self.protected,
        }
    }

    /// Move an entry to the protected segment under a fresh stamp
    fn promote(&mut self, key: &K, stamp: u64) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let old_segment = entry.segment;
        let old_stamp = entry.stamp;
        entry.segment = Segment::Protected;
        entry.stamp = stamp;

        self.order_index(old_segment).remove(&old_stamp);
        self.protected.insert(stamp, key.clone());
        self.demote_overflow();
    }

    /// Push the protected segment's coldest entries back to probation
    /// until it is within its share
    fn demote_overflow(&mut self) {
        while self.protected.len() > self.protected_cap {
            let Some((stamp, key)) = self.protected.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.segment = Segment::Probation;
            }
            self.probation.insert(stamp, key);
        }
    }

    /// Drop the coldest probation entry, falling back to protected when
    /// probation is empty; returns whether anything was evicted
    fn evict_one(&mut self) -> bool {
        let victim = self
            .probation
            .pop_first()
            .or_else(|| self.protected.pop_first());
        match victim {
            Some((_, key)) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

/// Segmented LRU cache, generic over key and value
pub struct HotCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    stats: CacheStats,
}

impl<K: Clone + Eq + Hash, V: Clone> HotCache<K, V> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::new(capacity.max(1))),
            stats: CacheStats::default(),
        }
    }

    /// Get a value, promoting the key into the protected segment
    pub fn get(&self, key: &K) -> Option<V> {
        let state = &mut *self.state.lock();

        let Some(entry) = state.entries.get(key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let value = entry.value.clone();

        let stamp = state.next_stamp();
        state.promote(key, stamp);

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Insert or refresh a value
    ///
    /// A refresh counts as a re-access and promotes the key; a new key
    /// enters probation, evicting the coldest probation entry if the
    /// cache is full.
    pub fn put(&self, key: K, value: V) {
        let state = &mut *self.state.lock();
        let stamp = state.next_stamp();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.value = value;
            state.promote(&key, stamp);
            return;
        }

        while state.entries.len() >= state.capacity {
            if !state.evict_one() {
                break;
            }
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        state.probation.insert(stamp, key.clone());
        state.entries.insert(
            key,
            Entry {
                value,
                segment: Segment::Probation,
                stamp,
            },
        );
    }

    /// Remove a key
    pub fn remove(&self, key: &K) -> Option<V> {
        let state = &mut *self.state.lock();
        let entry = state.entries.remove(key)?;
        state.order_index(entry.segment).remove(&entry.stamp);
        Some(entry.value)
    }

    /// Whether the key is resident (without touching recency)
    pub fn contains(&self, key: &K) -> bool {
        let state = self.state.lock();
        state.entries.contains_key(key)
    }

    pub fn clear(&self) {
        let state = &mut *self.state.lock();
        state.entries.clear();
        state.probation.clear();
        state.protected.clear();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
