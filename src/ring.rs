//! Provides the consistent-hash ring which distributes keys across cache nodes.
//!
//! Each node occupies a number of virtual positions ("replicas") on the ring,
//! which smooths the key distribution; a key belongs to the node owning the first
//! position at or after the key's hash (wrapping around at the end).
//!
//! The ring additionally keeps a traffic counter per node. Every once in a while
//! (see [REBALANCE_CHECK_INTERVAL]) the counters are inspected: a node taking a
//! disproportionate share of the traffic sheds virtual replicas (and with them key
//! space), a starved node gains some, both within the configured bounds. The
//! rebalance runs under the writer lock, so a reader never observes a ring
//! mid-edit.
//!
//! # Example
//!
//! ```
//! # use nimbus::ring::{HashRing, RingSettings};
//! let ring = HashRing::new(RingSettings::default());
//! assert_eq!(ring.add("10.0.0.1:8001"), true);
//! assert_eq!(ring.add("10.0.0.2:8001"), true);
//!
//! // Every key is owned by exactly one of the nodes...
//! let owner = ring.get("some-key").unwrap();
//! assert!(owner == "10.0.0.1:8001" || owner == "10.0.0.2:8001");
//!
//! // ...and the assignment is stable.
//! assert_eq!(ring.get("some-key").unwrap(), owner);
//! ```
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// The number of ring reads between two rebalance checks.
pub const REBALANCE_CHECK_INTERVAL: u64 = 1024;

/// The tuning knobs of a [HashRing].
#[derive(Clone, Debug)]
pub struct RingSettings {
    /// The number of virtual replicas a newly added node receives.
    pub replicas: usize,
    /// The lower bound the rebalancer may shrink a node to.
    pub min_replicas: usize,
    /// The upper bound the rebalancer may grow a node to.
    pub max_replicas: usize,
    /// The traffic share above which a node is considered overloaded. A node
    /// below this fraction of its fair share is considered starved.
    pub rebalance_threshold: f64,
}

impl Default for RingSettings {
    fn default() -> Self {
        RingSettings {
            replicas: 50,
            min_replicas: 10,
            max_replicas: 200,
            rebalance_threshold: 0.25,
        }
    }
}

/// The part of the ring guarded by the reader/writer lock.
struct RingState {
    /// The sorted hash positions.
    positions: Vec<u64>,
    /// Maps each position to the owning node.
    owners: HashMap<u64, String>,
    /// The number of positions each node currently occupies.
    replicas: HashMap<String, usize>,
    /// Per-node traffic counters (atomics, so readers can bump them).
    traffic: HashMap<String, AtomicU64>,
}

/// A consistent-hash ring with virtual replicas and traffic aware rebalancing.
///
/// Reads ([get](HashRing::get)) only take the reader lock; node changes and the
/// rebalance are writers.
pub struct HashRing {
    settings: RingSettings,
    state: RwLock<RingState>,
    total_traffic: AtomicU64,
}

impl HashRing {
    /// Creates an empty ring with the given settings.
    pub fn new(settings: RingSettings) -> Self {
        HashRing {
            settings,
            state: RwLock::new(RingState {
                positions: Vec::new(),
                owners: HashMap::new(),
                replicas: HashMap::new(),
                traffic: HashMap::new(),
            }),
            total_traffic: AtomicU64::new(0),
        }
    }

    fn hash(data: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write(data.as_bytes());
        hasher.finish()
    }

    /// The hash position of the i-th virtual replica of a node.
    fn position(node: &str, replica: usize) -> u64 {
        HashRing::hash(&format!("{}-{}", node, replica))
    }

    /// Adds a node with the default number of virtual replicas.
    ///
    /// If any of the node's positions collides with an existing one, the whole add
    /// is rejected and the ring is left untouched.
    pub fn add(&self, node: &str) -> bool {
        let mut state = self.state.write().unwrap();

        if state.replicas.contains_key(node) {
            return false;
        }

        let positions: Vec<u64> = (0..self.settings.replicas)
            .map(|replica| HashRing::position(node, replica))
            .collect();
        if positions
            .iter()
            .any(|position| state.owners.contains_key(position))
        {
            return false;
        }

        for position in positions {
            let _ = state.owners.insert(position, node.to_owned());
            state.positions.push(position);
        }
        state.positions.sort_unstable();
        let _ = state.replicas.insert(node.to_owned(), self.settings.replicas);
        let _ = state.traffic.insert(node.to_owned(), AtomicU64::new(0));

        true
    }

    /// Removes a node and all of its positions.
    pub fn remove(&self, node: &str) -> bool {
        let mut state = self.state.write().unwrap();

        let replicas = match state.replicas.remove(node) {
            Some(replicas) => replicas,
            None => return false,
        };

        for replica in 0..replicas {
            let position = HashRing::position(node, replica);
            let _ = state.owners.remove(&position);
        }
        let owners = std::mem::take(&mut state.owners);
        state.positions.retain(|position| owners.contains_key(position));
        state.owners = owners;
        let _ = state.traffic.remove(node);

        true
    }

    /// Returns the node owning the given key, or **None** if the ring is empty.
    ///
    /// Every successful lookup is counted towards the owning node's traffic; the
    /// counters periodically feed the rebalancer.
    pub fn get(&self, key: &str) -> Option<String> {
        let owner = {
            let state = self.state.read().unwrap();
            if state.positions.is_empty() {
                return None;
            }

            let hash = HashRing::hash(key);
            let index = match state.positions.binary_search(&hash) {
                Ok(index) => index,
                Err(index) => index,
            };
            // Wrap around to the first position at the end of the ring...
            let position = state.positions[index % state.positions.len()];
            let owner = state.owners[&position].clone();

            if let Some(counter) = state.traffic.get(&owner) {
                let _ = counter.fetch_add(1, Ordering::Relaxed);
            }

            owner
        };

        // Opportunistic rebalance check, performed by whichever reader crosses the
        // interval boundary (after the reader lock has been released).
        if self.total_traffic.fetch_add(1, Ordering::Relaxed) % REBALANCE_CHECK_INTERVAL
            == REBALANCE_CHECK_INTERVAL - 1
        {
            self.rebalance();
        }

        Some(owner)
    }

    /// Returns the number of virtual replicas the given node currently occupies.
    pub fn replicas(&self, node: &str) -> Option<usize> {
        self.state.read().unwrap().replicas.get(node).copied()
    }

    /// Returns the number of nodes on the ring.
    pub fn node_count(&self) -> usize {
        self.state.read().unwrap().replicas.len()
    }

    /// Re-expresses the replica counts according to the observed traffic.
    ///
    /// A node whose traffic share exceeds the threshold (while taking more than
    /// its fair share) halves its replicas towards the minimum; a node below
    /// threshold × fair-share grows by half towards the maximum. All counters are
    /// reset afterwards, so each rebalance judges a fresh observation window.
    ///
    /// This is invoked opportunistically by [get](HashRing::get) but can also be
    /// called manually.
    pub fn rebalance(&self) {
        let mut state = self.state.write().unwrap();

        let nodes: Vec<String> = state.replicas.keys().cloned().collect();
        if nodes.len() < 2 {
            return;
        }

        let total: u64 = state
            .traffic
            .values()
            .map(|counter| counter.load(Ordering::Relaxed))
            .sum();
        if total == 0 {
            return;
        }

        let fair = 1.0 / nodes.len() as f64;
        for node in nodes {
            let observed = state
                .traffic
                .get(&node)
                .map(|counter| counter.load(Ordering::Relaxed))
                .unwrap_or(0);
            let share = observed as f64 / total as f64;
            let current = state.replicas[&node];

            let target = if share > self.settings.rebalance_threshold && share > fair {
                (current / 2).max(self.settings.min_replicas)
            } else if share < fair * self.settings.rebalance_threshold {
                (current + current / 2).min(self.settings.max_replicas)
            } else {
                current
            };

            if target != current {
                log::debug!(
                    "Rebalancing {} from {} to {} replicas (traffic share {:.2})...",
                    node,
                    current,
                    target,
                    share
                );
                HashRing::apply_replicas(&mut state, &node, target);
            }
        }

        // Start a fresh observation window...
        for counter in state.traffic.values() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Adjusts the number of positions of a node to the given target.
    ///
    /// Additions stop early on a hash collision so that the recorded replica count
    /// always matches the positions actually present.
    fn apply_replicas(state: &mut RingState, node: &str, target: usize) {
        let current = state.replicas[node];

        if target < current {
            for replica in target..current {
                let position = HashRing::position(node, replica);
                let _ = state.owners.remove(&position);
            }
            let owners = std::mem::take(&mut state.owners);
            state.positions.retain(|position| owners.contains_key(position));
            state.owners = owners;
            let _ = state.replicas.insert(node.to_owned(), target);
        } else {
            let mut achieved = current;
            for replica in current..target {
                let position = HashRing::position(node, replica);
                if state.owners.contains_key(&position) {
                    break;
                }
                let _ = state.owners.insert(position, node.to_owned());
                state.positions.push(position);
                achieved = replica + 1;
            }
            state.positions.sort_unstable();
            let _ = state.replicas.insert(node.to_owned(), achieved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_ring_consistent(ring: &HashRing) {
        let state = ring.state.read().unwrap();

        // The sorted position list and the owner index stay in lockstep...
        assert_eq!(state.positions.len(), state.owners.len());
        let mut sorted = state.positions.clone();
        sorted.sort_unstable();
        assert_eq!(state.positions, sorted);

        // ...and every node occupies exactly its recorded number of positions.
        for (node, replicas) in &state.replicas {
            let occupied = state
                .owners
                .values()
                .filter(|owner| *owner == node)
                .count();
            assert_eq!(occupied, *replicas);
        }
    }

    #[test]
    fn added_nodes_own_their_replica_positions() {
        let ring = HashRing::new(RingSettings::default());
        assert_eq!(ring.add("a"), true);
        assert_eq!(ring.add("b"), true);

        // Adding the same node again is rejected without touching the ring...
        assert_eq!(ring.add("a"), false);

        assert_eq!(ring.node_count(), 2);
        assert_eq!(ring.replicas("a"), Some(50));
        assert_ring_consistent(&ring);
    }

    #[test]
    fn lookups_are_stable_and_survive_unrelated_removals() {
        let ring = HashRing::new(RingSettings::default());
        assert!(ring.add("a"));
        assert!(ring.add("b"));
        assert!(ring.add("c"));

        // Record the assignment of some keys owned by "a"...
        let keys: Vec<String> = (0..200).map(|i| format!("key-{}", i)).collect();
        let owned_by_a: Vec<&String> = keys
            .iter()
            .filter(|key| ring.get(key).unwrap() == "a")
            .collect();
        assert!(!owned_by_a.is_empty());

        // Removing an unrelated node must not move them...
        assert!(ring.remove("b"));
        assert_eq!(ring.node_count(), 2);
        for key in owned_by_a {
            assert_eq!(ring.get(key).unwrap(), "a");
        }
        assert_ring_consistent(&ring);

        // Removing an unknown node is reported...
        assert_eq!(ring.remove("b"), false);
    }

    #[test]
    fn an_empty_ring_reports_no_owner() {
        let ring = HashRing::new(RingSettings::default());
        assert_eq!(ring.get("key"), None);

        assert!(ring.add("a"));
        assert!(ring.remove("a"));
        assert_eq!(ring.get("key"), None);
    }

    #[test]
    fn a_hot_node_sheds_replicas_on_rebalance() {
        let ring = HashRing::new(RingSettings {
            replicas: 16,
            min_replicas: 4,
            max_replicas: 64,
            rebalance_threshold: 0.6,
        });
        assert!(ring.add("a"));
        assert!(ring.add("b"));

        // Find a key owned by "a" and hammer it so that "a" takes nearly all of
        // the traffic...
        let hot_key = (0..100)
            .map(|i| format!("key-{}", i))
            .find(|key| ring.get(key).unwrap() == "a")
            .unwrap();
        for _ in 0..500 {
            let _ = ring.get(&hot_key);
        }

        ring.rebalance();

        // "a" shed replicas, "b" (starved) grew, and the ring stayed sound...
        assert!(ring.replicas("a").unwrap() < 16);
        assert!(ring.replicas("a").unwrap() >= 4);
        assert!(ring.replicas("b").unwrap() > 16);
        assert_ring_consistent(&ring);

        // The observation window was reset, so an immediate second rebalance is a
        // no-op...
        let before = ring.replicas("a").unwrap();
        ring.rebalance();
        assert_eq!(ring.replicas("a").unwrap(), before);
    }

    #[test]
    fn single_node_rings_are_never_rebalanced() {
        let ring = HashRing::new(RingSettings::default());
        assert!(ring.add("a"));
        for _ in 0..100 {
            let _ = ring.get("key");
        }

        ring.rebalance();
        assert_eq!(ring.replicas("a"), Some(50));
    }
}
