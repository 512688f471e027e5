//! Provides the frequency based engines: LFU, the averaging AvgLFU and its sharded
//! variant.
//!
//! An [Lfu] keeps one recency list per frequency value (the "buckets") plus the
//! smallest frequency with a non empty bucket (**minFreq**). Eviction pops the head
//! of the minFreq bucket, so entries of equal frequency fall back to LRU order.
//!
//! [AvgLfu] layers a global averaging controller on top: the sum of all frequencies
//! is tracked and once the average exceeds a configured ceiling, every frequency is
//! decayed by that ceiling (never below 1). Without the decay, entries which were
//! hot long ago would resist eviction indefinitely.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crate::cache::list::{Arena, List};
use crate::cache::{shard_index, Engine};

/// The outcome of a write as reported by the core, used by the averaging layer to
/// keep its frequency sum accurate.
struct WriteOutcome {
    evicted_freq: Option<u32>,
}

struct LfuCore<K, V> {
    capacity: usize,
    min_freq: u32,
    arena: Arena<K, V>,
    index: HashMap<K, usize>,
    buckets: HashMap<u32, List>,
}

impl<K: Hash + Eq + Clone, V: Clone> LfuCore<K, V> {
    fn new(capacity: usize) -> Self {
        let mut buckets = HashMap::new();
        let _ = buckets.insert(1, List::new());

        LfuCore {
            capacity,
            min_freq: 1,
            arena: Arena::new(),
            index: HashMap::with_capacity(capacity),
            buckets,
        }
    }

    /// Unlinks the entry from its current bucket, increments its frequency and
    /// appends it to the tail of the next bucket.
    fn bump(&mut self, idx: usize) -> u32 {
        let freq = self.arena.entry(idx).freq;
        self.buckets
            .get_mut(&freq)
            .expect("entry was not in its frequency bucket")
            .unlink(&mut self.arena, idx);

        let next = freq + 1;
        self.arena.entry_mut(idx).freq = next;
        self.buckets
            .entry(next)
            .or_insert_with(List::new)
            .push_tail(&mut self.arena, idx);

        freq
    }

    /// Reads and bumps the entry for the given key.
    ///
    /// If the drained bucket was the minFreq bucket, minFreq advances by one step.
    fn get(&mut self, key: &K) -> Option<V> {
        let idx = *self.index.get(key)?;
        let old_freq = self.bump(idx);

        if old_freq == self.min_freq && self.buckets[&self.min_freq].is_empty() {
            self.min_freq += 1;
        }

        Some(self.arena.entry(idx).value.clone())
    }

    /// Inserts or updates the entry for the given key.
    ///
    /// An update bumps the frequency and performs a full minFreq recomputation, as a
    /// write may move the only minFreq entry across several buckets over time. An
    /// insert evicts the minimum frequency entry when at capacity and starts the new
    /// entry in bucket 1.
    fn put(&mut self, key: K, value: V) -> WriteOutcome {
        if self.capacity == 0 {
            return WriteOutcome { evicted_freq: None };
        }

        if let Some(&idx) = self.index.get(&key) {
            let _ = self.bump(idx);
            self.arena.entry_mut(idx).value = value;
            self.recompute_min_freq();
            return WriteOutcome { evicted_freq: None };
        }

        let evicted_freq = if self.index.len() >= self.capacity {
            self.evict()
        } else {
            None
        };

        let idx = self.arena.alloc(key.clone(), value);
        self.buckets
            .entry(1)
            .or_insert_with(List::new)
            .push_tail(&mut self.arena, idx);
        let _ = self.index.insert(key, idx);
        self.min_freq = 1;

        WriteOutcome { evicted_freq }
    }

    /// Evicts the head of the minFreq bucket and returns its frequency.
    fn evict(&mut self) -> Option<u32> {
        let idx = self
            .buckets
            .get_mut(&self.min_freq)?
            .pop_head(&mut self.arena)?;
        let entry = self.arena.release(idx);
        let _ = self.index.remove(&entry.key);
        Some(entry.freq)
    }

    /// Removes the entry for the given key, returning its frequency.
    fn remove(&mut self, key: &K) -> Option<u32> {
        let idx = self.index.remove(key)?;
        let freq = self.arena.entry(idx).freq;
        self.buckets
            .get_mut(&freq)
            .expect("entry was not in its frequency bucket")
            .unlink(&mut self.arena, idx);
        let _ = self.arena.release(idx);

        if freq == self.min_freq {
            self.recompute_min_freq();
        }

        Some(freq)
    }

    /// Scans all buckets for the smallest non empty one.
    ///
    /// When every bucket is empty, minFreq resets to 1 (the frequency of the next
    /// inserted entry).
    fn recompute_min_freq(&mut self) {
        self.min_freq = self
            .buckets
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(freq, _)| *freq)
            .min()
            .unwrap_or(1);
    }

    /// Reduces every frequency by **amount** (never below 1), re-tiers all entries
    /// and returns the new frequency sum.
    fn decay(&mut self, amount: u32) -> u64 {
        let mut total = 0u64;
        let indices: Vec<usize> = self.index.values().copied().collect();

        for idx in indices {
            let freq = self.arena.entry(idx).freq;
            self.buckets
                .get_mut(&freq)
                .expect("entry was not in its frequency bucket")
                .unlink(&mut self.arena, idx);

            let decayed = freq.saturating_sub(amount).max(1);
            self.arena.entry_mut(idx).freq = decayed;
            self.buckets
                .entry(decayed)
                .or_insert_with(List::new)
                .push_tail(&mut self.arena, idx);
            total += decayed as u64;
        }

        self.recompute_min_freq();
        total
    }

    fn freq(&self, key: &K) -> Option<u32> {
        self.index.get(key).map(|&idx| self.arena.entry(idx).freq)
    }
}

/// A capacity bound cache evicting the least frequently used entry, with LRU order
/// as the tie breaker within a frequency.
///
/// # Example
/// ```
/// # use nimbus::cache::lfu::Lfu;
/// let lfu = Lfu::new(2);
/// lfu.put("a", 1);
/// lfu.put("b", 2);
///
/// // Reading "a" raises its frequency, so "b" is the eviction victim...
/// assert_eq!(lfu.get(&"a"), Some(1));
/// lfu.put("c", 3);
/// assert_eq!(lfu.get(&"b"), None);
/// assert_eq!(lfu.get(&"a"), Some(1));
/// ```
pub struct Lfu<K, V> {
    inner: Mutex<LfuCore<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Lfu<K, V> {
    /// Creates an LFU engine holding up to **capacity** entries.
    pub fn new(capacity: usize) -> Self {
        Lfu {
            inner: Mutex::new(LfuCore::new(capacity)),
        }
    }

    /// Returns the value for the given key and raises its frequency.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap().get(key)
    }

    /// Inserts or updates the value for the given key, evicting the least
    /// frequently used entry when at capacity.
    pub fn put(&self, key: K, value: V) {
        let _ = self.inner.lock().unwrap().put(key, value);
    }

    /// Removes the entry for the given key if present.
    pub fn remove(&self, key: &K) {
        let _ = self.inner.lock().unwrap().remove(key);
    }

    /// Determines if an entry for the given key is present (without touching it).
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().index.contains_key(key)
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    /// Returns the current frequency of the given key.
    pub fn freq(&self, key: &K) -> Option<u32> {
        self.inner.lock().unwrap().freq(key)
    }
}

impl<K, V> Engine<K, V> for Lfu<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        Lfu::get(self, key)
    }

    fn put(&self, key: K, value: V) {
        Lfu::put(self, key, value);
    }

    fn remove(&self, key: &K) {
        Lfu::remove(self, key);
    }

    fn contains(&self, key: &K) -> bool {
        Lfu::contains(self, key)
    }

    fn len(&self) -> usize {
        Lfu::len(self)
    }
}

struct AvgLfuCore<K, V> {
    lfu: LfuCore<K, V>,
    total_freq: u64,
    max_average: u32,
}

impl<K: Hash + Eq + Clone, V: Clone> AvgLfuCore<K, V> {
    /// Runs the decay once the average frequency exceeds the configured ceiling.
    ///
    /// The check runs on the read path only; writes merely keep the sum accurate.
    fn check_average(&mut self) {
        let size = self.lfu.index.len() as u64;
        if size > 0 && self.total_freq / size > self.max_average as u64 {
            self.total_freq = self.lfu.decay(self.max_average);
        }
    }
}

/// An [Lfu] with a global averaging controller.
///
/// The controller keeps the sum of all entry frequencies. Each read that pushes the
/// average frequency above the configured maximum triggers a decay which subtracts
/// the maximum from every frequency (floored at 1) and re-tiers all entries.
pub struct AvgLfu<K, V> {
    inner: Mutex<AvgLfuCore<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> AvgLfu<K, V> {
    /// Creates an averaging LFU engine with the given capacity and maximum average
    /// frequency.
    pub fn new(capacity: usize, max_average: u32) -> Self {
        AvgLfu {
            inner: Mutex::new(AvgLfuCore {
                lfu: LfuCore::new(capacity),
                total_freq: 0,
                max_average: max_average.max(1),
            }),
        }
    }

    /// Returns the value for the given key and raises its frequency.
    ///
    /// If the read pushes the average frequency above the configured maximum, all
    /// frequencies are decayed before this call returns.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.lfu.get(key)?;
        inner.total_freq += 1;
        inner.check_average();
        Some(value)
    }

    /// Inserts or updates the value for the given key.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        let updated = inner.lfu.index.contains_key(&key);
        let outcome = inner.lfu.put(key, value);

        // Both an update (frequency bump) and an insert (new entry at frequency 1)
        // raise the sum by one; an eviction removes the victim's share.
        if updated || inner.lfu.capacity > 0 {
            inner.total_freq += 1;
        }
        if let Some(freq) = outcome.evicted_freq {
            inner.total_freq -= freq as u64;
        }
    }

    /// Removes the entry for the given key if present.
    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(freq) = inner.lfu.remove(key) {
            inner.total_freq -= freq as u64;
        }
    }

    /// Determines if an entry for the given key is present (without touching it).
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().lfu.index.contains_key(key)
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().lfu.index.len()
    }

    /// Returns the current frequency of the given key.
    pub fn freq(&self, key: &K) -> Option<u32> {
        self.inner.lock().unwrap().lfu.freq(key)
    }

    /// Returns the sum of all entry frequencies.
    pub fn total_freq(&self) -> u64 {
        self.inner.lock().unwrap().total_freq
    }
}

impl<K, V> Engine<K, V> for AvgLfu<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        AvgLfu::get(self, key)
    }

    fn put(&self, key: K, value: V) {
        AvgLfu::put(self, key, value);
    }

    fn remove(&self, key: &K) {
        AvgLfu::remove(self, key);
    }

    fn contains(&self, key: &K) -> bool {
        AvgLfu::contains(self, key)
    }

    fn len(&self) -> usize {
        AvgLfu::len(self)
    }
}

/// Statically partitions the key space over independent [AvgLfu] engines.
pub struct ShardedAvgLfu<K, V> {
    shards: Vec<AvgLfu<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> ShardedAvgLfu<K, V> {
    /// Creates a sharded AvgLFU engine; the total capacity is distributed evenly
    /// and the maximum average applies per shard.
    pub fn new(capacity: usize, shards: usize, max_average: u32) -> Self {
        let shards = shards.max(1);
        let shard_capacity = (capacity / shards).max(1);

        ShardedAvgLfu {
            shards: (0..shards)
                .map(|_| AvgLfu::new(shard_capacity, max_average))
                .collect(),
        }
    }

    fn shard(&self, key: &K) -> &AvgLfu<K, V> {
        &self.shards[shard_index(key, self.shards.len())]
    }
}

impl<K, V> Engine<K, V> for ShardedAvgLfu<K, V>
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
    fn lfu_breaks_frequency_ties_by_recency() {
        let lfu = Lfu::new(2);
        lfu.put("a", 1);
        lfu.put("b", 2);

        // "a" reaches frequency 2, so "b" (the older of the frequency-1 entries)
        // is the eviction victim...
        assert_eq!(lfu.get(&"a"), Some(1));
        lfu.put("c", 3);

        assert_eq!(lfu.get(&"b"), None);
        assert_eq!(lfu.get(&"a"), Some(1));
        assert_eq!(lfu.get(&"c"), Some(3));
    }

    #[test]
    fn repeated_reads_raise_the_frequency_accordingly() {
        let lfu = Lfu::new(4);
        lfu.put("k", 1);
        assert_eq!(lfu.freq(&"k"), Some(1));

        for _ in 0..5 {
            let _ = lfu.get(&"k");
        }
        assert_eq!(lfu.freq(&"k"), Some(6));
    }

    #[test]
    fn updates_keep_the_size_and_bump_the_frequency() {
        let lfu = Lfu::new(2);
        lfu.put("a", 1);
        lfu.put("a", 2);

        assert_eq!(lfu.len(), 1);
        assert_eq!(lfu.freq(&"a"), Some(2));
        assert_eq!(lfu.get(&"a"), Some(2));
    }

    #[test]
    fn write_updates_recompute_the_minimum_frequency() {
        let lfu = Lfu::new(3);
        lfu.put("a", 1);

        // Writing "a" twice more moves it to bucket 3 while buckets 1 and 2 drain;
        // the full recomputation must follow it there...
        lfu.put("a", 2);
        lfu.put("a", 3);
        assert_eq!(lfu.inner.lock().unwrap().min_freq, 3);

        // A fresh insert resets minFreq to 1, so the newcomer is the next victim...
        lfu.put("b", 1);
        assert_eq!(lfu.inner.lock().unwrap().min_freq, 1);
    }

    #[test]
    fn removing_the_last_minimum_entry_rescans() {
        let lfu = Lfu::new(3);
        lfu.put("a", 1);
        lfu.put("b", 2);
        let _ = lfu.get(&"a");

        // "b" is the only frequency-1 entry; removing it must advance minFreq...
        lfu.remove(&"b");
        assert_eq!(lfu.inner.lock().unwrap().min_freq, 2);
        assert_eq!(lfu.len(), 1);
    }

    #[test]
    fn avg_lfu_decays_once_the_average_exceeds_the_ceiling() {
        let cache = AvgLfu::new(4, 2);
        for key in 1..=4 {
            cache.put(key, key * 10);
        }
        assert_eq!(cache.total_freq(), 4);

        // Nine reads cycling through the four keys push the average above 2 which
        // triggers the decay on the eighth read...
        for i in 0..9 {
            let key = (i % 4) + 1;
            assert_eq!(cache.get(&key), Some(key * 10));
        }

        // All frequencies stay at least 1 and the sum matches their total...
        let mut sum = 0u64;
        for key in 1..=4 {
            let freq = cache.freq(&key).unwrap();
            assert!(freq >= 1);
            sum += freq as u64;
        }
        assert_eq!(cache.total_freq(), sum);
        assert_eq!(cache.total_freq(), 5);
    }

    #[test]
    fn avg_lfu_subtracts_evicted_frequencies() {
        let cache = AvgLfu::new(2, 10);
        cache.put("a", 1);
        cache.put("b", 2);
        let _ = cache.get(&"a");
        let _ = cache.get(&"a");
        assert_eq!(cache.total_freq(), 4);

        // Inserting "c" evicts "b" (frequency 1): sum drops by 1, rises by 1...
        cache.put("c", 3);
        assert_eq!(cache.total_freq(), 4);
        assert!(!cache.contains(&"b"));

        cache.remove(&"a");
        assert_eq!(cache.total_freq(), 1);
    }

    #[test]
    fn buckets_and_index_stay_in_lockstep() {
        let lfu = Lfu::new(8);
        for i in 0..12 {
            lfu.put(i, i);
        }
        for i in 6..10 {
            let _ = lfu.get(&i);
            let _ = lfu.get(&i);
        }
        lfu.put(7, 70);
        lfu.remove(&8);

        let core = lfu.inner.lock().unwrap();

        // Every live entry sits in exactly one bucket...
        let bucketed: usize = core.buckets.values().map(|list| list.len()).sum();
        assert_eq!(bucketed, core.index.len());

        // ...and minFreq points at the smallest non-empty bucket.
        let expected = core
            .buckets
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(freq, _)| *freq)
            .min()
            .unwrap();
        assert_eq!(core.min_freq, expected);
    }

    #[test]
    fn sharded_avg_lfu_routes_consistently() {
        let cache = ShardedAvgLfu::new(16, 4, 5);
        for i in 0..16 {
            cache.put(i, i);
        }
        for i in 0..16 {
            if Engine::contains(&cache, &i) {
                assert_eq!(Engine::get(&cache, &i), Some(i));
            }
        }
        assert!(Engine::len(&cache) <= 16);
    }
}
