//! Provides the adaptive replacement engine (ARC).
//!
//! An [ArcCache] combines a recency oriented and a frequency oriented sub-engine.
//! Each sub-engine owns a main structure, a bounded FIFO ghost list of recently
//! evicted keys and a dynamic capacity; the two capacities always sum up to the
//! total capacity and each stays at least 1.
//!
//! The ghost lists are the adaptive part: a hit on the recency ghosts is evidence
//! that the recency side is undersized, so one unit of capacity is transferred from
//! the frequency side over (and vice versa). Ghosts carry only the key and a
//! frequency hint, never a value.
//!
//! An entry starts on the recency side; once its frequency reaches the promotion
//! threshold it is copied into the frequency side. The two sub-engine mutexes are
//! always acquired in a fixed order (recency before frequency) so that migrations
//! and capacity transfers cannot deadlock.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use linked_hash_map::LinkedHashMap;

use crate::cache::list::{Arena, List};
use crate::cache::Engine;

/// The recency oriented sub-engine: an LRU main list plus a ghost FIFO.
struct Recency<K, V> {
    capacity: usize,
    threshold: u32,
    arena: Arena<K, V>,
    list: List,
    index: HashMap<K, usize>,
    ghosts: LinkedHashMap<K, u32>,
}

impl<K: Hash + Eq + Clone, V: Clone> Recency<K, V> {
    fn new(capacity: usize, threshold: u32) -> Self {
        Recency {
            capacity,
            threshold,
            arena: Arena::new(),
            list: List::new(),
            index: HashMap::new(),
            ghosts: LinkedHashMap::new(),
        }
    }

    /// Inserts or updates; reports whether the entry's frequency reached the
    /// promotion threshold.
    fn put(&mut self, key: K, value: V) -> bool {
        if let Some(&idx) = self.index.get(&key) {
            self.list.unlink(&mut self.arena, idx);
            self.list.push_tail(&mut self.arena, idx);
            let entry = self.arena.entry_mut(idx);
            entry.value = value;
            entry.freq += 1;
            return entry.freq >= self.threshold;
        }

        while self.list.len() >= self.capacity {
            self.evict();
        }

        let idx = self.arena.alloc(key.clone(), value);
        self.list.push_tail(&mut self.arena, idx);
        let _ = self.index.insert(key, idx);
        1 >= self.threshold
    }

    /// Reads and bumps; reports the value and whether the frequency reached the
    /// promotion threshold.
    fn get(&mut self, key: &K) -> Option<(V, bool)> {
        let idx = *self.index.get(key)?;
        self.list.unlink(&mut self.arena, idx);
        self.list.push_tail(&mut self.arena, idx);
        let entry = self.arena.entry_mut(idx);
        entry.freq += 1;
        Some((entry.value.clone(), entry.freq >= self.threshold))
    }

    /// Moves the LRU entry into the ghost list, dropping the oldest ghost on
    /// overflow.
    fn evict(&mut self) {
        if let Some(idx) = self.list.pop_head(&mut self.arena) {
            let entry = self.arena.release(idx);
            let _ = self.index.remove(&entry.key);
            let _ = self.ghosts.insert(entry.key, entry.freq);
            self.trim_ghosts();
        }
    }

    fn trim_ghosts(&mut self) {
        while self.ghosts.len() > self.capacity {
            let _ = self.ghosts.pop_front();
        }
    }

    /// Consumes a ghost for the given key if present.
    fn check_ghost(&mut self, key: &K) -> bool {
        self.ghosts.remove(key).is_some()
    }

    fn increase_capacity(&mut self) {
        self.capacity += 1;
    }

    /// Sheds one unit of capacity, evicting on overflow. Refuses to go below 1.
    fn decrease_capacity(&mut self) -> bool {
        if self.capacity <= 1 {
            return false;
        }

        self.capacity -= 1;
        while self.list.len() > self.capacity {
            self.evict();
        }
        self.trim_ghosts();
        true
    }

    fn remove(&mut self, key: &K) {
        if let Some(idx) = self.index.remove(key) {
            self.list.unlink(&mut self.arena, idx);
            let _ = self.arena.release(idx);
        }
        let _ = self.ghosts.remove(key);
    }
}

/// The frequency oriented sub-engine: LFU buckets plus a ghost FIFO.
struct Frequency<K, V> {
    capacity: usize,
    min_freq: u32,
    arena: Arena<K, V>,
    index: HashMap<K, usize>,
    buckets: HashMap<u32, List>,
    ghosts: LinkedHashMap<K, u32>,
}

impl<K: Hash + Eq + Clone, V: Clone> Frequency<K, V> {
    fn new(capacity: usize) -> Self {
        let mut buckets = HashMap::new();
        let _ = buckets.insert(1, List::new());

        Frequency {
            capacity,
            min_freq: 1,
            arena: Arena::new(),
            index: HashMap::new(),
            buckets,
            ghosts: LinkedHashMap::new(),
        }
    }

    fn bump(&mut self, idx: usize) {
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

        if freq == self.min_freq && self.buckets[&freq].is_empty() {
            self.min_freq = next;
        }
    }

    fn put(&mut self, key: K, value: V) {
        if let Some(&idx) = self.index.get(&key) {
            self.bump(idx);
            self.arena.entry_mut(idx).value = value;
            return;
        }

        // A still unconsumed ghost is superseded by the new live entry.
        let _ = self.ghosts.remove(&key);
        self.insert_new(key, value);
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let idx = *self.index.get(key)?;
        self.bump(idx);
        Some(self.arena.entry(idx).value.clone())
    }

    fn insert_new(&mut self, key: K, value: V) {
        while self.index.len() >= self.capacity {
            self.evict();
        }

        let idx = self.arena.alloc(key.clone(), value);
        self.buckets
            .entry(1)
            .or_insert_with(List::new)
            .push_tail(&mut self.arena, idx);
        let _ = self.index.insert(key, idx);
        self.min_freq = 1;
    }

    /// Moves the least frequent entry (LRU within its bucket) into the ghost list.
    fn evict(&mut self) {
        let idx = match self
            .buckets
            .get_mut(&self.min_freq)
            .and_then(|bucket| bucket.pop_head(&mut self.arena))
        {
            Some(idx) => idx,
            None => return,
        };

        let entry = self.arena.release(idx);
        let _ = self.index.remove(&entry.key);
        let _ = self.ghosts.insert(entry.key, entry.freq);
        self.trim_ghosts();
        self.recompute_min_freq();
    }

    fn trim_ghosts(&mut self) {
        while self.ghosts.len() > self.capacity {
            let _ = self.ghosts.pop_front();
        }
    }

    fn recompute_min_freq(&mut self) {
        self.min_freq = self
            .buckets
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(freq, _)| *freq)
            .min()
            .unwrap_or(1);
    }

    fn check_ghost(&mut self, key: &K) -> bool {
        self.ghosts.remove(key).is_some()
    }

    fn increase_capacity(&mut self) {
        self.capacity += 1;
    }

    fn decrease_capacity(&mut self) -> bool {
        if self.capacity <= 1 {
            return false;
        }

        self.capacity -= 1;
        while self.index.len() > self.capacity {
            self.evict();
        }
        self.trim_ghosts();
        true
    }

    fn remove(&mut self, key: &K) {
        if let Some(idx) = self.index.remove(key) {
            let freq = self.arena.entry(idx).freq;
            self.buckets
                .get_mut(&freq)
                .expect("entry was not in its frequency bucket")
                .unlink(&mut self.arena, idx);
            let _ = self.arena.release(idx);
            if freq == self.min_freq {
                self.recompute_min_freq();
            }
        }
        let _ = self.ghosts.remove(key);
    }
}

/// The adaptive replacement cache.
///
/// # Example
/// ```
/// # use nimbus::cache::arc::ArcCache;
/// let cache = ArcCache::new(4, 2);
/// cache.put("a", 1);
/// assert_eq!(cache.get(&"a"), Some(1));
///
/// // The second hit reaches the promotion threshold, copying "a" into the
/// // frequency side where it survives recency pressure...
/// assert_eq!(cache.get(&"a"), Some(1));
/// cache.put("b", 2);
/// cache.put("c", 3);
/// cache.put("d", 4);
/// assert_eq!(cache.get(&"a"), Some(1));
/// ```
pub struct ArcCache<K, V> {
    recency: Mutex<Recency<K, V>>,
    frequency: Mutex<Frequency<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> ArcCache<K, V> {
    /// Creates an ARC engine with the given total capacity and promotion threshold.
    ///
    /// The capacity is split evenly between the two sub-engines; both sides always
    /// keep at least one slot.
    pub fn new(capacity: usize, threshold: u32) -> Self {
        let recency_capacity = (capacity / 2).max(1);
        let frequency_capacity = capacity.saturating_sub(recency_capacity).max(1);

        ArcCache {
            recency: Mutex::new(Recency::new(recency_capacity, threshold)),
            frequency: Mutex::new(Frequency::new(frequency_capacity)),
        }
    }

    /// Consumes a ghost hit on either side and transfers one unit of capacity
    /// towards the side which lost the entry too early.
    fn check_ghost(recency: &mut Recency<K, V>, frequency: &mut Frequency<K, V>, key: &K) -> bool {
        if recency.check_ghost(key) {
            if frequency.decrease_capacity() {
                recency.increase_capacity();
            }
            true
        } else if frequency.check_ghost(key) {
            if recency.decrease_capacity() {
                frequency.increase_capacity();
            }
            true
        } else {
            false
        }
    }

    /// Returns the value for the given key from either side.
    ///
    /// A ghost hit merely rebalances the capacities; a live hit which reaches the
    /// promotion threshold copies the entry into the frequency side.
    pub fn get(&self, key: &K) -> Option<V> {
        // Lock order: always recency before frequency.
        let mut recency = self.recency.lock().unwrap();
        let mut frequency = self.frequency.lock().unwrap();

        let _ = ArcCache::check_ghost(&mut recency, &mut frequency, key);

        if let Some((value, promoted)) = recency.get(key) {
            if promoted {
                frequency.put(key.clone(), value.clone());
            }
            return Some(value);
        }

        frequency.get(key)
    }

    /// Inserts or updates the value for the given key.
    ///
    /// A ghost hit routes the write directly into the frequency side; otherwise
    /// the recency side takes it and reports whether to promote.
    pub fn put(&self, key: K, value: V) {
        let mut recency = self.recency.lock().unwrap();
        let mut frequency = self.frequency.lock().unwrap();

        if ArcCache::check_ghost(&mut recency, &mut frequency, &key) {
            // The ghost proves the key has history: it re-enters on the
            // frequency side directly.
            frequency.put(key, value);
        } else if recency.put(key.clone(), value.clone()) {
            frequency.put(key, value);
        }
    }

    /// Removes the entry (and any ghost) for the given key from both sides.
    pub fn remove(&self, key: &K) {
        let mut recency = self.recency.lock().unwrap();
        let mut frequency = self.frequency.lock().unwrap();
        recency.remove(key);
        frequency.remove(key);
    }

    /// Determines if a live entry for the given key exists on either side.
    pub fn contains(&self, key: &K) -> bool {
        {
            let recency = self.recency.lock().unwrap();
            if recency.index.contains_key(key) {
                return true;
            }
        }
        self.frequency.lock().unwrap().index.contains_key(key)
    }

    /// Returns the number of live entries across both sides.
    pub fn len(&self) -> usize {
        let recency = self.recency.lock().unwrap();
        let frequency = self.frequency.lock().unwrap();
        recency.index.len() + frequency.index.len()
    }
}

impl<K, V> Engine<K, V> for ArcCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        ArcCache::get(self, key)
    }

    fn put(&self, key: K, value: V) {
        ArcCache::put(self, key, value);
    }

    fn remove(&self, key: &K) {
        ArcCache::remove(self, key);
    }

    fn contains(&self, key: &K) -> bool {
        ArcCache::contains(self, key)
    }

    fn len(&self) -> usize {
        ArcCache::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacities<K: std::hash::Hash + Eq + Clone, V: Clone>(
        cache: &ArcCache<K, V>,
    ) -> (usize, usize) {
        let recency = cache.recency.lock().unwrap().capacity;
        let frequency = cache.frequency.lock().unwrap().capacity;
        (recency, frequency)
    }

    #[test]
    fn capacity_is_split_between_the_sides() {
        let cache: ArcCache<i32, i32> = ArcCache::new(4, 2);
        assert_eq!(capacities(&cache), (2, 2));

        // Even a tiny cache keeps a slot on each side...
        let tiny: ArcCache<i32, i32> = ArcCache::new(1, 2);
        let (recency, frequency) = capacities(&tiny);
        assert!(recency >= 1 && frequency >= 1);
    }

    #[test]
    fn ghost_hit_transfers_capacity_and_revives_on_the_frequency_side() {
        let cache = ArcCache::new(4, 2);

        // Fill the recency side (capacity 2) and push one more: "k1" becomes a
        // recency ghost...
        cache.put("k1", 1);
        cache.put("k2", 2);
        cache.put("k3", 3);
        assert!(cache.recency.lock().unwrap().ghosts.contains_key(&"k1"));
        assert_eq!(capacities(&cache), (2, 2));

        // Writing "k1" again hits the ghost: the frequency side cedes one unit of
        // capacity and the key re-enters as live on the frequency side...
        cache.put("k1", 10);
        assert_eq!(capacities(&cache), (3, 1));
        assert!(cache
            .frequency
            .lock()
            .unwrap()
            .index
            .contains_key(&"k1"));
        assert_eq!(cache.get(&"k1"), Some(10));

        // The invariant holds: both capacities sum to the total...
        let (recency, frequency) = capacities(&cache);
        assert_eq!(recency + frequency, 4);
    }

    #[test]
    fn capacity_transfer_refuses_to_drain_a_side() {
        let cache = ArcCache::new(2, 2);
        assert_eq!(capacities(&cache), (1, 1));

        cache.put("a", 1);
        cache.put("b", 2);
        assert!(cache.recency.lock().unwrap().ghosts.contains_key(&"a"));

        // The frequency side is already at its minimum of 1, so the ghost hit
        // rebalances nothing...
        cache.put("a", 1);
        assert_eq!(capacities(&cache), (1, 1));
    }

    #[test]
    fn repeated_hits_promote_into_the_frequency_side() {
        let cache = ArcCache::new(4, 2);
        cache.put("hot", 1);
        assert_eq!(cache.get(&"hot"), Some(1));

        // The second access reaches the threshold: the entry is copied over...
        assert!(cache
            .frequency
            .lock()
            .unwrap()
            .index
            .contains_key(&"hot"));

        // Recency pressure cannot push it out anymore...
        cache.put("s1", 0);
        cache.put("s2", 0);
        cache.put("s3", 0);
        assert_eq!(cache.get(&"hot"), Some(1));
    }

    #[test]
    fn ghosts_are_bounded_by_the_side_capacity() {
        let cache = ArcCache::new(4, 2);
        for i in 0..10 {
            cache.put(i, i);
        }

        let recency = cache.recency.lock().unwrap();
        assert!(recency.ghosts.len() <= recency.capacity);
    }

    #[test]
    fn remove_clears_live_entries_and_ghosts() {
        let cache = ArcCache::new(4, 2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        // "a" is a recency ghost by now; removing it clears the ghost so no
        // capacity transfer happens on re-insert...
        cache.remove(&"a");
        cache.put("a", 1);
        assert_eq!(capacities(&cache), (2, 2));

        cache.remove(&"b");
        assert_eq!(cache.get(&"b"), None);
    }
}
