//! Provides the family of single node eviction engines.
//!
//! Every engine implements the [Engine] trait and is safe to share across any number
//! of worker tasks: the basic engines guard their entire structure with a single
//! mutex, the sharded variants keep one mutex per shard and ARC locks its two
//! sub-engines in a fixed order.
//!
//! The following engines are available, each in its own module:
//! * [Lru](lru::Lru) - plain recency based eviction.
//! * [LruK](lru::LruK) - two tiered LRU with a cold admission tier and a promotion
//!   threshold.
//! * [ShardedLruK](lru::ShardedLruK) - key space partitioned LRU-K.
//! * [Lfu](lfu::Lfu) - frequency bucketed eviction with minimum frequency tracking.
//! * [AvgLfu](lfu::AvgLfu) - LFU with a global averaging controller which decays all
//!   frequencies once the average exceeds a configured ceiling.
//! * [ShardedAvgLfu](lfu::ShardedAvgLfu) - key space partitioned AvgLFU.
//! * [ArcCache](arc::ArcCache) - adaptive replacement with ghost lists and dynamic
//!   capacity transfer between a recency and a frequency sub-engine.
//!
//! Which engine a cache group uses is determined by the system config (see
//! [EngineSettings]); LRU is the default.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use yaml_rust::Yaml;

pub mod arc;
pub mod lfu;
mod list;
pub mod lru;

/// The type tagged value envelope stored by cache groups and carried over the wire.
///
/// Only UTF-8 strings and 32-bit signed integers are supported; the RESP protocol
/// carries the tag for free (bulk string vs. integer reply).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// A UTF-8 string payload.
    Str(String),
    /// A 32-bit signed integer payload.
    Int(i32),
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

/// The common contract of all eviction engines.
///
/// Misses are not errors but simply reported as **None**. All implementations are
/// internally synchronized, therefore all methods take **&self**.
pub trait Engine<K, V>: Send + Sync {
    /// Returns the value stored for the given key and marks the entry as used.
    fn get(&self, key: &K) -> Option<V>;

    /// Inserts or updates the value for the given key, evicting if at capacity.
    fn put(&self, key: K, value: V);

    /// Removes the entry for the given key if present.
    fn remove(&self, key: &K);

    /// Determines if an entry for the given key is present (without touching it).
    fn contains(&self, key: &K) -> bool;

    /// Returns the number of live entries.
    fn len(&self) -> usize;

    /// Determines if the engine is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tracks read/write counters of a cache group.
///
/// Internally mutable via atomics so that the hot path never takes a lock for
/// metrics.
#[derive(Default)]
pub struct CacheStats {
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
}

impl CacheStats {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        CacheStats::default()
    }

    /// Records a read and whether it hit a live entry.
    pub fn record_read(&self, hit: bool) {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);
        if hit {
            let _ = self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a write (put or delete).
    pub fn record_write(&self) {
        let _ = self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of reads.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of reads which hit a live entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the total number of writes.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads() {
            0 => 0.,
            reads => self.hits() as f32 / reads as f32 * 100.,
        }
    }
}

/// Routes a key to one of **shards** partitions.
///
/// This is static partitioning: a poor hash yields uneven shard utilization and no
/// rebalancing takes place.
pub(crate) fn shard_index<K: Hash>(key: &K, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// The engine selection and tuning knobs of a single cache group as read from the
/// system config.
///
/// ```yaml
/// groups:
///     users:
///         engine: arc          # lru | lru-k | sharded-lru-k | lfu |
///                              # avg-lfu | sharded-avg-lfu | arc
///         capacity: 4096
///         cold_capacity: 512   # LRU-K family
///         promotion_threshold: 2
///         shards: 8            # sharded variants, defaults to the CPU count
///         max_average: 10      # AvgLFU family
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// The engine kind (one of the names listed above).
    pub engine: String,
    /// The total number of entries the engine may hold.
    pub capacity: usize,
    /// The capacity of the cold admission tier (LRU-K family, per shard).
    pub cold_capacity: usize,
    /// The access count at which an entry is promoted (LRU-K family, ARC).
    pub promotion_threshold: u32,
    /// The number of partitions of the sharded engines.
    pub shards: usize,
    /// The average frequency ceiling which triggers a decay (AvgLFU family).
    pub max_average: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            engine: "lru".to_owned(),
            capacity: 1024,
            cold_capacity: 256,
            promotion_threshold: 2,
            shards: num_cpus::get().max(1),
            max_average: 10,
        }
    }
}

impl EngineSettings {
    /// Reads the settings from the given config element, falling back to defaults
    /// for everything that is absent or invalid.
    pub fn parse(config: &Yaml) -> Self {
        let defaults = EngineSettings::default();

        EngineSettings {
            engine: config["engine"]
                .as_str()
                .unwrap_or(&defaults.engine)
                .to_owned(),
            capacity: read_usize(&config["capacity"], defaults.capacity),
            cold_capacity: read_usize(&config["cold_capacity"], defaults.cold_capacity),
            promotion_threshold: read_usize(
                &config["promotion_threshold"],
                defaults.promotion_threshold as usize,
            ) as u32,
            shards: read_usize(&config["shards"], defaults.shards).max(1),
            max_average: read_usize(&config["max_average"], defaults.max_average as usize) as u32,
        }
    }

    /// Builds the configured engine.
    ///
    /// Unknown engine names fall back to LRU (with a complaint in the log) so that a
    /// typo in the config yields a running cache rather than a dead group.
    pub fn build(&self) -> Box<dyn Engine<String, Value>> {
        match self.engine.as_str() {
            "lru" => Box::new(lru::Lru::new(self.capacity)),
            "lru-k" => Box::new(lru::LruK::new(
                self.capacity,
                self.cold_capacity,
                self.promotion_threshold,
            )),
            "sharded-lru-k" => Box::new(lru::ShardedLruK::new(
                self.capacity,
                self.shards,
                self.cold_capacity,
                self.promotion_threshold,
            )),
            "lfu" => Box::new(lfu::Lfu::new(self.capacity)),
            "avg-lfu" => Box::new(lfu::AvgLfu::new(self.capacity, self.max_average)),
            "sharded-avg-lfu" => Box::new(lfu::ShardedAvgLfu::new(
                self.capacity,
                self.shards,
                self.max_average,
            )),
            "arc" => Box::new(arc::ArcCache::new(self.capacity, self.promotion_threshold)),
            other => {
                log::error!(
                    "Unknown cache engine '{}' - falling back to lru.",
                    other
                );
                Box::new(lru::Lru::new(self.capacity))
            }
        }
    }
}

fn read_usize(value: &Yaml, fallback: usize) -> usize {
    value
        .as_i64()
        .filter(|value| *value > 0)
        .map(|value| value as usize)
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yaml_rust::YamlLoader;

    #[test]
    fn settings_are_parsed_with_fallbacks() {
        let docs = YamlLoader::load_from_str(
            "engine: arc\ncapacity: 64\npromotion_threshold: 3\n",
        )
        .unwrap();

        let settings = EngineSettings::parse(&docs[0]);
        assert_eq!(settings.engine, "arc");
        assert_eq!(settings.capacity, 64);
        assert_eq!(settings.promotion_threshold, 3);

        // Everything not given sticks to the defaults...
        assert_eq!(settings.cold_capacity, EngineSettings::default().cold_capacity);
        assert_eq!(settings.max_average, EngineSettings::default().max_average);
    }

    #[test]
    fn every_engine_name_builds() {
        for name in [
            "lru",
            "lru-k",
            "sharded-lru-k",
            "lfu",
            "avg-lfu",
            "sharded-avg-lfu",
            "arc",
        ] {
            let settings = EngineSettings {
                engine: name.to_owned(),
                capacity: 16,
                ..EngineSettings::default()
            };
            let engine = settings.build();
            engine.put("foo".to_owned(), Value::from("bar"));
            assert_eq!(engine.get(&"foo".to_owned()), Some(Value::from("bar")));
        }
    }

    #[test]
    fn stats_compute_hit_rate() {
        let stats = CacheStats::new();
        stats.record_read(true);
        stats.record_read(true);
        stats.record_read(true);
        stats.record_read(false);
        stats.record_write();

        assert_eq!(stats.reads(), 4);
        assert_eq!(stats.hits(), 3);
        assert_eq!(stats.writes(), 1);
        assert_eq!(stats.hit_rate().round() as i32, 75);
    }
}
