//! Provides the recency based engines: plain LRU, the two tiered LRU-K and its
//! sharded variant.
//!
//! An [Lru] keeps a single recency list (head = least recently used) plus an index
//! map. [LruK] stacks two independent LRU engines: a cold admission tier which
//! counts accesses per entry and a hot main tier which an entry only enters once its
//! cold access count reaches the promotion threshold. This shields the hot tier
//! against one-off scans. [ShardedLruK] statically partitions the key space over a
//! number of independent LRU-K engines to reduce lock contention.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crate::cache::list::{Arena, List};
use crate::cache::{shard_index, Engine};

struct LruCore<K, V> {
    capacity: usize,
    arena: Arena<K, V>,
    list: List,
    index: HashMap<K, usize>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCore<K, V> {
    fn new(capacity: usize) -> Self {
        LruCore {
            capacity,
            arena: Arena::new(),
            list: List::new(),
            index: HashMap::with_capacity(capacity),
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let idx = *self.index.get(key)?;
        self.list.unlink(&mut self.arena, idx);
        self.list.push_tail(&mut self.arena, idx);
        Some(self.arena.entry(idx).value.clone())
    }

    fn put(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }

        if let Some(&idx) = self.index.get(&key) {
            let entry = self.arena.entry_mut(idx);
            entry.value = value;
            self.list.unlink(&mut self.arena, idx);
            self.list.push_tail(&mut self.arena, idx);
            return;
        }

        if self.index.len() >= self.capacity {
            self.evict();
        }

        let idx = self.arena.alloc(key.clone(), value);
        self.list.push_tail(&mut self.arena, idx);
        let _ = self.index.insert(key, idx);
    }

    fn evict(&mut self) {
        if let Some(idx) = self.list.pop_head(&mut self.arena) {
            let entry = self.arena.release(idx);
            let _ = self.index.remove(&entry.key);
        }
    }

    fn remove(&mut self, key: &K) {
        if let Some(idx) = self.index.remove(key) {
            self.list.unlink(&mut self.arena, idx);
            let _ = self.arena.release(idx);
        }
    }

    fn freq(&self, key: &K) -> u32 {
        match self.index.get(key) {
            Some(&idx) => self.arena.entry(idx).freq,
            None => 0,
        }
    }

    fn set_freq(&mut self, key: &K, freq: u32) {
        if let Some(&idx) = self.index.get(key) {
            self.arena.entry_mut(idx).freq = freq;
        }
    }
}

/// A capacity bound cache evicting the least recently used entry.
///
/// This is the default engine of a cache group. Next to the usual operations it
/// exposes the per-entry access counter ([freq](Lru::freq) / [set_freq](Lru::set_freq))
/// which [LruK] uses to track cold tier hit counts inside the entries themselves.
///
/// # Example
/// ```
/// # use nimbus::cache::lru::Lru;
/// let lru = Lru::new(2);
/// lru.put("a", 1);
/// lru.put("b", 2);
///
/// // Touching "a" makes "b" the eviction candidate...
/// assert_eq!(lru.get(&"a"), Some(1));
/// lru.put("c", 3);
/// assert_eq!(lru.get(&"b"), None);
/// assert_eq!(lru.get(&"a"), Some(1));
/// ```
pub struct Lru<K, V> {
    inner: Mutex<LruCore<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Lru<K, V> {
    /// Creates an LRU engine holding up to **capacity** entries.
    pub fn new(capacity: usize) -> Self {
        Lru {
            inner: Mutex::new(LruCore::new(capacity)),
        }
    }

    /// Returns the access counter stored for the given key (0 if absent).
    pub fn freq(&self, key: &K) -> u32 {
        self.inner.lock().unwrap().freq(key)
    }

    /// Stores the access counter for the given key (ignored if absent).
    pub fn set_freq(&self, key: &K, freq: u32) {
        self.inner.lock().unwrap().set_freq(key, freq);
    }

    /// Returns the value for the given key and marks it as most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap().get(key)
    }

    /// Inserts or updates the value for the given key, evicting the least
    /// recently used entry when at capacity.
    pub fn put(&self, key: K, value: V) {
        self.inner.lock().unwrap().put(key, value);
    }

    /// Removes the entry for the given key if present.
    pub fn remove(&self, key: &K) {
        self.inner.lock().unwrap().remove(key);
    }

    /// Determines if an entry for the given key is present (without touching it).
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().index.contains_key(key)
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    /// Determines if the engine is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Engine<K, V> for Lru<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        Lru::get(self, key)
    }

    fn put(&self, key: K, value: V) {
        Lru::put(self, key, value);
    }

    fn remove(&self, key: &K) {
        Lru::remove(self, key);
    }

    fn contains(&self, key: &K) -> bool {
        Lru::contains(self, key)
    }

    fn len(&self) -> usize {
        Lru::len(self)
    }
}

/// A two tiered LRU: a cold admission tier plus a hot main tier.
///
/// Each access of a cold entry increments its counter; once the counter reaches the
/// promotion threshold **k** the entry moves into the hot tier (evicting the hot
/// tier's LRU entry when full). Writes count towards promotion as well, therefore
/// repeatedly storing the same key eventually promotes it.
pub struct LruK<K, V> {
    hot: Lru<K, V>,
    cold: Lru<K, V>,
    threshold: u32,
}

impl<K: Hash + Eq + Clone, V: Clone> LruK<K, V> {
    /// Creates an LRU-K engine with the given hot capacity, cold capacity and
    /// promotion threshold.
    pub fn new(capacity: usize, cold_capacity: usize, threshold: u32) -> Self {
        LruK {
            hot: Lru::new(capacity),
            cold: Lru::new(cold_capacity),
            threshold,
        }
    }

    /// Returns the value for the given key from either tier.
    ///
    /// A cold tier hit raises the entry's access count and promotes it into the
    /// hot tier once the count has reached the threshold.
    pub fn get(&self, key: &K) -> Option<V> {
        if self.hot.contains(key) {
            return self.hot.get(key);
        }

        if self.cold.contains(key) {
            let freq = self.cold.freq(key);
            let value = self.cold.get(key)?;
            if freq >= self.threshold {
                self.cold.remove(key);
                self.hot.put(key.clone(), value.clone());
            } else {
                self.cold.set_freq(key, freq + 1);
            }
            return Some(value);
        }

        None
    }

    /// Inserts or updates the value for the given key.
    ///
    /// Writes count as cold tier accesses, so repeated writes promote as well.
    pub fn put(&self, key: K, value: V) {
        if self.hot.contains(&key) {
            self.hot.put(key, value);
            return;
        }

        let freq = self.cold.freq(&key);
        if freq >= self.threshold {
            self.cold.remove(&key);
            self.hot.put(key, value);
        } else {
            self.cold.put(key.clone(), value);
            self.cold.set_freq(&key, freq + 1);
        }
    }

    /// Removes the entry for the given key from both tiers.
    pub fn remove(&self, key: &K) {
        self.hot.remove(key);
        self.cold.remove(key);
    }

    /// Determines if either tier holds an entry for the given key.
    pub fn contains(&self, key: &K) -> bool {
        self.hot.contains(key) || self.cold.contains(key)
    }

    /// Returns the number of live entries across both tiers.
    pub fn len(&self) -> usize {
        self.hot.len() + self.cold.len()
    }
}

impl<K, V> Engine<K, V> for LruK<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        LruK::get(self, key)
    }

    fn put(&self, key: K, value: V) {
        LruK::put(self, key, value);
    }

    fn remove(&self, key: &K) {
        LruK::remove(self, key);
    }

    fn contains(&self, key: &K) -> bool {
        LruK::contains(self, key)
    }

    fn len(&self) -> usize {
        LruK::len(self)
    }
}

/// Statically partitions the key space over independent [LruK] engines.
///
/// Each shard receives **capacity / shards** hot entries and its own cold tier, and
/// no cross shard coordination ever takes place. Note that a poorly distributed
/// hash therefore leads to uneven shard utilization.
pub struct ShardedLruK<K, V> {
    shards: Vec<LruK<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> ShardedLruK<K, V> {
    /// Creates a sharded LRU-K engine.
    ///
    /// The total capacity is distributed evenly, the cold capacity and threshold
    /// apply per shard.
    pub fn new(capacity: usize, shards: usize, cold_capacity: usize, threshold: u32) -> Self {
        let shards = shards.max(1);
        let shard_capacity = (capacity / shards).max(1);

        ShardedLruK {
            shards: (0..shards)
                .map(|_| LruK::new(shard_capacity, cold_capacity, threshold))
                .collect(),
        }
    }

    fn shard(&self, key: &K) -> &LruK<K, V> {
        &self.shards[shard_index(key, self.shards.len())]
    }
}

impl<K, V> Engine<K, V> for ShardedLruK<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        self.shard(key).get(key)
    }

    fn put(&self, key: K, value: V) {
        self.shard(&key).put(key, value);
    }

    fn remove(&self, key: &K) {
        self.shard(key).remove(key);
    }

    fn contains(&self, key: &K) -> bool {
        self.shard(key).contains(key)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_the_least_recently_used_entry() {
        let lru = Lru::new(3);
        lru.put(1, 100);
        lru.put(2, 200);
        lru.put(3, 300);

        // Touching 1 rescues it, so inserting 4 drops 2...
        assert_eq!(lru.get(&1), Some(100));
        lru.put(4, 400);

        assert_eq!(lru.get(&2), None);
        assert_eq!(lru.get(&1), Some(100));
        assert_eq!(lru.get(&3), Some(300));
        assert_eq!(lru.get(&4), Some(400));
        assert_eq!(lru.len(), 3);
    }

    #[test]
    fn lru_updates_in_place() {
        let lru = Lru::new(2);
        lru.put("a", 1);
        lru.put("a", 2);

        assert_eq!(lru.get(&"a"), Some(2));
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn lru_remove_frees_capacity() {
        let lru = Lru::new(2);
        lru.put("a", 1);
        lru.put("b", 2);
        lru.remove(&"a");
        assert_eq!(lru.len(), 1);

        // There is room for another entry without evicting "b"...
        lru.put("c", 3);
        assert_eq!(lru.get(&"b"), Some(2));
        assert_eq!(lru.get(&"c"), Some(3));
    }

    #[test]
    fn lru_tracks_entry_frequencies() {
        let lru = Lru::new(4);
        lru.put("a", 1);
        assert_eq!(lru.freq(&"a"), 1);

        lru.set_freq(&"a", 7);
        assert_eq!(lru.freq(&"a"), 7);

        // Frequencies of absent keys read as zero and writes to them are ignored...
        assert_eq!(lru.freq(&"b"), 0);
        lru.set_freq(&"b", 3);
        assert_eq!(lru.freq(&"b"), 0);
    }

    #[test]
    fn lruk_promotes_after_repeated_writes() {
        let cache = LruK::new(2, 5, 2);

        // The first put lands cold with a count of 1, the second raises the count
        // to 2 and the third one observes the threshold and promotes...
        cache.put(4, "x");
        assert!(cache.cold.contains(&4));
        cache.put(4, "x");
        assert_eq!(cache.cold.freq(&4), 2);
        cache.put(4, "x");

        assert!(cache.hot.contains(&4));
        assert!(!cache.cold.contains(&4));
        assert_eq!(cache.get(&4), Some("x"));
    }

    #[test]
    fn lruk_promotes_on_the_read_path() {
        let cache = LruK::new(2, 5, 2);
        cache.put("k", 42);

        // The write admitted the entry with a count of 1; the first read raises
        // it to the threshold and the second read observes it and promotes...
        assert_eq!(cache.get(&"k"), Some(42));
        assert!(cache.cold.contains(&"k"));
        assert_eq!(cache.get(&"k"), Some(42));
        assert!(cache.hot.contains(&"k"));
        assert!(!cache.cold.contains(&"k"));

        assert_eq!(cache.get(&"missing"), None);
    }

    #[test]
    fn lruk_cold_tier_evicts_independently() {
        let cache = LruK::new(4, 2, 3);
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(3, 3);

        // The cold tier only holds two entries, so 1 has been dropped before it
        // ever reached the hot tier...
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(2));
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn sharded_lruk_keeps_shards_independent() {
        let cache = ShardedLruK::new(16, 4, 4, 1);
        for i in 0..32 {
            cache.put(i, i * 10);
        }

        // No shard exceeds its slice of the capacity plus its cold tier...
        assert!(cache.len() <= 32);
        for i in 0..32 {
            if Engine::contains(&cache, &i) {
                assert_eq!(Engine::get(&cache, &i), Some(i * 10));
            }
        }
    }
}
