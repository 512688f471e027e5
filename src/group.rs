//! Provides the cache group orchestrator and its RPC command handlers.
//!
//! A [CacheGroup] ties together a local eviction engine, the peer directory, the
//! request coalescer and a miss handler. Reads try the local engine first; a miss
//! is routed through the coalescer, which asks the key's owning peer (if that is
//! somebody else) and falls back to the miss handler. Writes and deletes apply
//! locally and are broadcast best-effort, one hop, to the owning peer.
//!
//! Groups are process-wide singletons indexed by name in the [GroupRegistry].
//! There is no ambient global state: the binary creates the registry and
//! [install](install) closes the command handlers over it.
//!
//! # Commands
//!
//! [install](install) registers the RPC surface:
//! * **CACHE.GET**: `CACHE.GET group key` yields the value (bulk string or
//!   integer, depending on its type) or nil if no value is present.
//! * **CACHE.SET**: `CACHE.SET group key kind value` with kind being `str` or
//!   `int` stores the value and broadcasts it to the key's owner.
//! * **CACHE.DEL**: `CACHE.DEL group key` removes the value, broadcasting
//!   likewise.
//! * **CACHE.STATS**: `CACHE.STATS` lists all groups; `CACHE.STATS group` yields
//!   detailed metrics of one group.
//!
//! A node receiving a broadcast applies it with broadcast enabled as well: its
//! own broadcast targets the key's *owner* which, under consistent hashing, is
//! typically the receiving node itself - and a self-targeted broadcast resolves
//! to "no peer", which stops the write from ping-ponging through the cluster.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use crate::cache::lru::Lru;
use crate::cache::{CacheStats, Engine, Value};
use crate::commands::CommandTable;
use crate::flight::Flight;
use crate::picker::PeerPicker;
use crate::request::Request;
use crate::response::Response;
use crate::spawn;

/// The default capacity of the engine used when a group does not configure one.
const DEFAULT_CAPACITY: usize = 1024;

/// Computes the value for a key which neither the local engine nor any peer
/// holds - typically by asking the backing database.
///
/// Returning **None** means the key simply does not exist.
pub type MissHandler = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;

/// A named cache group: local engine, peer directory, coalescer, miss handler.
pub struct CacheGroup {
    name: String,
    engine: Box<dyn Engine<String, Value>>,
    picker: Arc<PeerPicker>,
    flight: Flight<Option<Value>>,
    miss_handler: MissHandler,
    stats: CacheStats,
}

impl CacheGroup {
    /// Creates a group with the given engine.
    pub fn new(
        name: &str,
        engine: Box<dyn Engine<String, Value>>,
        picker: Arc<PeerPicker>,
        miss_handler: MissHandler,
    ) -> Arc<Self> {
        Arc::new(CacheGroup {
            name: name.to_owned(),
            engine,
            picker,
            flight: Flight::new(),
            miss_handler,
            stats: CacheStats::new(),
        })
    }

    /// Creates a group with the default engine (a plain LRU).
    pub fn with_default_engine(
        name: &str,
        picker: Arc<PeerPicker>,
        miss_handler: MissHandler,
    ) -> Arc<Self> {
        CacheGroup::new(
            name,
            Box::new(Lru::new(DEFAULT_CAPACITY)),
            picker,
            miss_handler,
        )
    }

    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the read/write counters of this group.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Returns the number of entries in the local engine.
    pub fn len(&self) -> usize {
        self.engine.len()
    }

    /// Determines if the local engine is empty.
    pub fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }

    /// Reads the value for the given key.
    ///
    /// A local hit is served immediately. A miss runs through the coalescer, so
    /// that concurrent readers of the same key share a single load: the load asks
    /// the owning peer (when the key is owned by somebody else) and falls back to
    /// the miss handler. A successfully loaded value populates the local engine.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.engine.get(&key.to_owned()) {
            self.stats.record_read(true);
            return Some(value);
        }
        self.stats.record_read(false);

        let outcome = self
            .flight
            .run(key, || async { Ok(self.load(key).await) })
            .await;

        match outcome {
            Ok(Some(value)) => {
                self.engine.put(key.to_owned(), value.clone());
                Some(value)
            }
            Ok(None) => None,
            Err(error) => {
                log::error!(
                    "Failed to load key {} for group {}: {}",
                    key,
                    self.name,
                    error
                );
                None
            }
        }
    }

    /// Performs the actual load of a missed key.
    async fn load(&self, key: &str) -> Option<Value> {
        if let Some(peer) = self.picker.pick_peer(key) {
            if let Some(value) = peer.get::<Value>(&self.name, key).await {
                return Some(value);
            }
            log::warn!(
                "Failed to load key {} from peer {} - asking the miss handler",
                key,
                peer.address()
            );
        }

        (self.miss_handler)(key)
    }

    /// Stores the given value.
    ///
    /// The write always applies to the local engine; with **broadcast** it is
    /// additionally propagated (best-effort, one hop, no acknowledgement) to the
    /// key's owning peer.
    pub fn set(self: &Arc<Self>, key: &str, value: Value, broadcast: bool) {
        self.engine.put(key.to_owned(), value.clone());
        self.stats.record_write();

        if broadcast {
            let group = self.clone();
            let key = key.to_owned();
            spawn!(async move {
                if let Some(peer) = group.picker.pick_peer(&key) {
                    if !peer.set(&group.name, &key, &value).await {
                        log::error!(
                            "Failed to broadcast the write of {} to {}",
                            key,
                            peer.address()
                        );
                    }
                }
            });
        }
    }

    /// Removes the given key, with the same broadcast semantics as
    /// [set](CacheGroup::set).
    pub fn del(self: &Arc<Self>, key: &str, broadcast: bool) {
        self.engine.remove(&key.to_owned());
        self.stats.record_write();

        if broadcast {
            let group = self.clone();
            let key = key.to_owned();
            spawn!(async move {
                if let Some(peer) = group.picker.pick_peer(&key) {
                    if !peer.delete(&group.name, &key).await {
                        log::error!(
                            "Failed to broadcast the delete of {} to {}",
                            key,
                            peer.address()
                        );
                    }
                }
            });
        }
    }
}

/// The process-wide table of named cache groups.
///
/// Created by the binary and handed by reference to everything which resolves
/// groups - most notably the command handlers installed via [install](install).
#[derive(Default)]
pub struct GroupRegistry {
    groups: Mutex<HashMap<String, Arc<CacheGroup>>>,
}

impl GroupRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(GroupRegistry::default())
    }

    /// Registers the given group, keeping an already registered group of the
    /// same name (groups are singletons, first registration wins).
    pub fn register(&self, group: Arc<CacheGroup>) -> Arc<CacheGroup> {
        let mut groups = self.groups.lock().unwrap();
        groups
            .entry(group.name().to_owned())
            .or_insert(group)
            .clone()
    }

    /// Resolves the group with the given name.
    pub fn find(&self, name: &str) -> Option<Arc<CacheGroup>> {
        self.groups.lock().unwrap().get(name).cloned()
    }

    /// Lists all registered groups.
    pub fn all(&self) -> Vec<Arc<CacheGroup>> {
        self.groups.lock().unwrap().values().cloned().collect()
    }
}

/// Installs the cache RPC commands into the given table, closing each handler
/// over the given group registry.
pub fn install(table: &CommandTable, groups: Arc<GroupRegistry>) {
    let get_groups = groups.clone();
    table.register(
        "CACHE.GET",
        Arc::new(move |request| {
            let groups = get_groups.clone();
            Box::pin(async move { get_command(groups, request).await })
        }),
    );

    let set_groups = groups.clone();
    table.register(
        "CACHE.SET",
        Arc::new(move |request| {
            let groups = set_groups.clone();
            Box::pin(async move { set_command(groups, request).await })
        }),
    );

    let del_groups = groups.clone();
    table.register(
        "CACHE.DEL",
        Arc::new(move |request| {
            let groups = del_groups.clone();
            Box::pin(async move { del_command(groups, request).await })
        }),
    );

    table.register(
        "CACHE.STATS",
        Arc::new(move |request| {
            let groups = groups.clone();
            Box::pin(async move { stats_command(groups, request) })
        }),
    );
}

/// Resolves the group addressed by the request or yields a "not found" error.
fn lookup_group(groups: &GroupRegistry, name: &str) -> anyhow::Result<Arc<CacheGroup>> {
    groups
        .find(name)
        .ok_or_else(|| anyhow!("Unknown cache group: {}", name))
}

/// Implements the CACHE.GET command.
async fn get_command(groups: Arc<GroupRegistry>, request: Request) -> anyhow::Result<Response> {
    let group = lookup_group(&groups, request.str_parameter(0)?)?;
    let key = request.str_parameter(1)?;

    let mut response = Response::new();
    match group.get(key).await {
        Some(Value::Str(string)) => response.bulk(string)?,
        Some(Value::Int(number)) => response.number(i64::from(number))?,
        None => response.nil()?,
    }

    Ok(response)
}

/// Implements the CACHE.SET command.
///
/// The handler enables the broadcast: when the write came from a peer, the
/// second hop resolves to "no peer" on the owning node, so it terminates there.
async fn set_command(groups: Arc<GroupRegistry>, request: Request) -> anyhow::Result<Response> {
    let group = lookup_group(&groups, request.str_parameter(0)?)?;
    let key = request.str_parameter(1)?;

    let value = match request.str_parameter(2)? {
        "str" => Value::Str(request.str_parameter(3)?.to_owned()),
        "int" => Value::Int(request.int_parameter(3)?),
        kind => {
            return Err(anyhow!(
                "Unknown value kind '{}' (expected 'str' or 'int')",
                kind
            ))
        }
    };

    group.set(key, value, true);

    let mut response = Response::new();
    response.ok()?;
    Ok(response)
}

/// Implements the CACHE.DEL command.
async fn del_command(groups: Arc<GroupRegistry>, request: Request) -> anyhow::Result<Response> {
    let group = lookup_group(&groups, request.str_parameter(0)?)?;
    let key = request.str_parameter(1)?;

    group.del(key, true);

    let mut response = Response::new();
    response.ok()?;
    Ok(response)
}

/// Implements the CACHE.STATS command (overview or per-group details).
fn stats_command(groups: Arc<GroupRegistry>, request: Request) -> anyhow::Result<Response> {
    let text = if request.parameter_count() == 0 {
        render_all_stats(&groups)
    } else {
        let group = lookup_group(&groups, request.str_parameter(0)?)?;
        render_group_stats(&group)
    };

    let mut response = Response::new();
    response.bulk(text)?;
    Ok(response)
}

/// Renders the `CACHE.STATS` overview.
fn render_all_stats(groups: &GroupRegistry) -> String {
    let mut text = String::new();

    text += "Use 'CACHE.STATS <group>' for detailed metrics.\n\n";
    text += format!(
        "{:<30} {:>12} {:>12} {:>12}\n",
        "Name", "Num Entries", "Reads", "Writes"
    )
    .as_str();
    text += crate::response::SEPARATOR;

    for group in groups.all() {
        text += format!(
            "{:<30} {:>12} {:>12} {:>12}\n",
            group.name(),
            group.len(),
            group.stats().reads(),
            group.stats().writes()
        )
        .as_str();
    }
    text += crate::response::SEPARATOR;

    text
}

/// Renders the `CACHE.STATS group` detail view.
fn render_group_stats(group: &CacheGroup) -> String {
    let mut text = String::new();

    text += format!("{:<30} {:>20}\n", "Num Entries", group.len()).as_str();
    text += format!("{:<30} {:>20}\n", "Reads", group.stats().reads()).as_str();
    text += format!("{:<30} {:>20}\n", "Hits", group.stats().hits()).as_str();
    text += format!("{:<30} {:>20}\n", "Writes", group.stats().writes()).as_str();
    text += format!("{:<30} {:>18.2} %\n", "Hit Rate", group.stats().hit_rate()).as_str();

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lfu::Lfu;
    use crate::peer::PeerClient;
    use crate::server::Server;
    use crate::shutdown::Shutdown;
    use crate::testing::test_async;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A miss handler backed by a tiny static table, as used by the reference
    /// node configuration.
    fn static_table_handler(invocations: Arc<AtomicUsize>) -> MissHandler {
        Arc::new(move |key: &str| {
            let _ = invocations.fetch_add(1, Ordering::SeqCst);
            match key {
                "Tom" | "Jack" | "Alice" | "Bob" | "Charlie" | "Diana" => {
                    Some(Value::Str(key.to_owned()))
                }
                _ => None,
            }
        })
    }

    #[test]
    fn misses_fall_through_to_the_handler_and_populate_the_engine() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let picker = PeerPicker::new("nimbus", "self");
            let group = CacheGroup::with_default_engine(
                "users",
                picker,
                static_table_handler(invocations.clone()),
            );

            // The first read asks the handler...
            assert_eq!(group.get("Tom").await, Some(Value::Str("Tom".to_owned())));
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            // ...the second one is a local hit.
            assert_eq!(group.get("Tom").await, Some(Value::Str("Tom".to_owned())));
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(group.stats().hits(), 1);

            // Unknown keys stay absent (and are asked again next time)...
            assert_eq!(group.get("Nobody").await, None);
            assert_eq!(group.get("Nobody").await, None);
            assert_eq!(invocations.load(Ordering::SeqCst), 3);
        });
    }

    /// Two concurrent reads of a key owned by a remote peer result in exactly
    /// one outbound RPC; both callers receive the same value.
    #[test]
    fn concurrent_misses_share_a_single_peer_load() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            // The remote node: owns every key and counts its backing loads...
            let shutdown = Shutdown::new();
            let remote_loads = Arc::new(AtomicUsize::new(0));
            let remote_groups = GroupRegistry::new();
            let _ = remote_groups.register(CacheGroup::with_default_engine(
                "users",
                PeerPicker::new("nimbus", "127.0.0.1:1845"),
                {
                    let remote_loads = remote_loads.clone();
                    Arc::new(move |key: &str| {
                        let _ = remote_loads.fetch_add(1, Ordering::SeqCst);
                        Some(Value::Str(key.to_uppercase()))
                    })
                },
            ));
            let table = CommandTable::new();
            install(&table, remote_groups);
            let server = Server::bind("127.0.0.1:1845", table, shutdown.clone())
                .await
                .unwrap();
            spawn!(server.serve());

            // The local node: only the remote is on its ring, so every key is
            // owned by the peer. The local miss handler must stay untouched...
            let local_loads = Arc::new(AtomicUsize::new(0));
            let picker = PeerPicker::new("nimbus", "self");
            picker.set_peer("127.0.0.1:1845");
            let group = CacheGroup::with_default_engine("users", picker, {
                let local_loads = local_loads.clone();
                Arc::new(move |_key: &str| {
                    let _ = local_loads.fetch_add(1, Ordering::SeqCst);
                    None
                })
            });

            let mut handles = Vec::new();
            for _ in 0..2 {
                let group = group.clone();
                handles.push(tokio::spawn(async move { group.get("tom").await }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap(), Some(Value::Str("TOM".to_owned())));
            }

            // Exactly one RPC reached the peer; the local handler was never
            // consulted...
            assert_eq!(remote_loads.load(Ordering::SeqCst), 1);
            assert_eq!(local_loads.load(Ordering::SeqCst), 0);

            shutdown.trigger();
        });
    }

    #[test]
    fn writes_and_deletes_apply_locally() {
        test_async(async {
            let picker = PeerPicker::new("nimbus", "self");
            let group = CacheGroup::new(
                "counters",
                Box::new(Lfu::new(16)),
                picker,
                Arc::new(|_key: &str| None),
            );

            group.set("hits", Value::Int(7), false);
            assert_eq!(group.get("hits").await, Some(Value::Int(7)));
            assert_eq!(group.len(), 1);

            group.del("hits", false);
            assert_eq!(group.get("hits").await, None);
            assert!(group.is_empty());
        });
    }

    #[test]
    fn groups_are_singletons_per_name() {
        test_async(async {
            let registry = GroupRegistry::new();
            let picker = PeerPicker::new("nimbus", "self");

            let first = registry.register(CacheGroup::with_default_engine(
                "users",
                picker.clone(),
                Arc::new(|_key: &str| None),
            ));
            let second = registry.register(CacheGroup::with_default_engine(
                "users",
                picker,
                Arc::new(|_key: &str| None),
            ));

            // The second registration resolved to the first group...
            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(registry.all().len(), 1);
            assert!(registry.find("users").is_some());
            assert!(registry.find("unknown").is_none());
        });
    }

    /// Exercises the full RPC surface over a real socket: a node with one group,
    /// driven by the peer client.
    #[test]
    fn rpc_surface_round_trips() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let shutdown = Shutdown::new();
            let groups = GroupRegistry::new();
            let picker = PeerPicker::new("nimbus", "127.0.0.1:1844");
            let _ = groups.register(CacheGroup::with_default_engine(
                "users",
                picker,
                Arc::new(|key: &str| match key {
                    "Tom" => Some(Value::Str("Tom".to_owned())),
                    _ => None,
                }),
            ));

            let table = CommandTable::new();
            install(&table, groups);
            let server = Server::bind("127.0.0.1:1844", table, shutdown.clone())
                .await
                .unwrap();
            spawn!(server.serve());

            let client = PeerClient::new("127.0.0.1:1844");

            // A string value round-trips...
            assert_eq!(client.set("users", "foo", &"bar".to_owned()).await, true);
            assert_eq!(
                client.get::<String>("users", "foo").await,
                Some("bar".to_owned())
            );

            // ...an integer value keeps its type tag...
            assert_eq!(client.set("users", "count", &42).await, true);
            assert_eq!(client.get::<i32>("users", "count").await, Some(42));
            assert_eq!(
                client.get::<Value>("users", "count").await,
                Some(Value::Int(42))
            );

            // ...a miss resolves through the miss handler...
            assert_eq!(
                client.get::<Value>("users", "Tom").await,
                Some(Value::Str("Tom".to_owned()))
            );

            // ...an unknown key is nil and an unknown group an error (both are
            // value-absent outcomes for the client)...
            assert_eq!(client.get::<Value>("users", "Nobody").await, None);
            assert_eq!(client.get::<Value>("nogroup", "foo").await, None);

            // ...and deletes make values disappear.
            assert_eq!(client.delete("users", "foo").await, true);
            assert_eq!(client.get::<Value>("users", "foo").await, None);

            shutdown.trigger();
        });
    }
}
