//! Provides the peer directory which knows every cache node of the cluster.
//!
//! The directory is fed by the registry: on attach, all keys under
//! `<service_name>/` are enumerated, then a watcher follows PUT and DELETE
//! events. Each known address carries a pooled [PeerClient] and a matching entry
//! on the consistent-hash [ring](crate::ring::HashRing) - the set of directory
//! keys and the set of ring nodes always move together.
//!
//! [pick_peer](PeerPicker::pick_peer) consults the ring for the owner of a key:
//! the answer is the owner's client, or **None** if the key is owned by this node
//! itself (or the ring is still empty). Picks only take reader locks and never
//! block the watcher's updates.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use etcd_client::{Client, EventType, GetOptions, WatchOptions, WatchResponse};

use crate::peer::PeerClient;
use crate::ring::{HashRing, RingSettings};
use crate::shutdown::Shutdown;
use crate::spawn;

/// The pause before a failed watch is re-established.
const WATCH_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// The peer directory of one cache node (or gateway).
pub struct PeerPicker {
    service: String,
    self_address: String,
    peers: RwLock<HashMap<String, Arc<PeerClient>>>,
    ring: HashRing,
}

impl PeerPicker {
    /// Creates a detached directory for the given service.
    ///
    /// **self_address** is the address under which this node announced itself;
    /// the directory reports "no peer" for keys owned by it. A gateway passes an
    /// empty string so that every node is a remote. The directory starts empty -
    /// call [attach](PeerPicker::attach) to populate it from the registry, or
    /// feed it manually via [set_peer](PeerPicker::set_peer).
    pub fn new(service_name: &str, self_address: &str) -> Arc<Self> {
        Arc::new(PeerPicker {
            service: service_name.to_owned(),
            self_address: self_address.to_owned(),
            peers: RwLock::new(HashMap::new()),
            ring: HashRing::new(RingSettings::default()),
        })
    }

    /// Populates the directory from the registry and forks the change watcher.
    ///
    /// A failure to connect or to perform the initial enumeration is fatal - a
    /// node without a directory would silently degrade into a standalone cache,
    /// so the caller must abort startup instead.
    pub async fn attach(
        self: &Arc<Self>,
        shutdown: Arc<Shutdown>,
        endpoints: &[String],
    ) -> anyhow::Result<()> {
        let mut client = Client::connect(endpoints, None)
            .await
            .context("Failed to connect to the etcd registry")?;

        let response = client
            .get(self.prefix(), Some(GetOptions::new().with_prefix()))
            .await
            .context("Failed to enumerate the registered cache nodes")?;
        for kv in response.kvs() {
            if let Ok(key) = kv.key_str() {
                if let Some(address) = self.parse_address(key) {
                    log::debug!("Found registered cache node: {}", address);
                    self.set_peer(address);
                }
            }
        }

        let picker = self.clone();
        spawn!(async move {
            picker.watch_loop(shutdown, client).await;
        });

        Ok(())
    }

    /// Follows registry events until the shutdown is triggered.
    ///
    /// A broken watch is logged and re-established after a short pause.
    async fn watch_loop(self: Arc<Self>, shutdown: Arc<Shutdown>, mut client: Client) {
        while !shutdown.is_stopped() {
            let (mut watcher, mut stream) = match client
                .watch(self.prefix(), Some(WatchOptions::new().with_prefix()))
                .await
            {
                Ok(channel) => channel,
                Err(error) => {
                    log::error!(
                        "Failed to watch the registry: {} - retrying in {:?}...",
                        error,
                        WATCH_RETRY_PAUSE
                    );
                    tokio::time::sleep(WATCH_RETRY_PAUSE).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    message = stream.message() => match message {
                        Ok(Some(response)) => self.handle_events(&response),
                        Ok(None) => {
                            log::warn!("The registry watch stream ended - re-establishing...");
                            break;
                        }
                        Err(error) => {
                            log::error!(
                                "The registry watch failed: {} - re-establishing...",
                                error
                            );
                            tokio::time::sleep(WATCH_RETRY_PAUSE).await;
                            break;
                        }
                    },
                    _ = shutdown.stopped() => {
                        let _ = watcher.cancel().await;
                        return;
                    }
                }
            }
        }
    }

    /// Applies a batch of registry events to the directory.
    fn handle_events(&self, response: &WatchResponse) {
        for event in response.events() {
            let kv = match event.kv() {
                Some(kv) => kv,
                None => continue,
            };
            let key = match kv.key_str() {
                Ok(key) => key,
                Err(_) => continue,
            };
            let address = match self.parse_address(key) {
                Some(address) => address.to_owned(),
                None => {
                    log::warn!(
                        "Registry key {} does not match the expected prefix {}",
                        key,
                        self.prefix()
                    );
                    continue;
                }
            };

            match event.event_type() {
                EventType::Put => {
                    log::info!("Cache node appeared: {}", address);
                    self.set_peer(&address);
                }
                EventType::Delete => {
                    log::info!("Cache node disappeared: {}", address);
                    self.remove_peer(&address);
                }
            }
        }
    }

    fn prefix(&self) -> String {
        format!("{}/", self.service)
    }

    /// Extracts the node address from a registry key.
    fn parse_address<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix())
            .filter(|address| !address.is_empty())
    }

    /// Adds (or refreshes) a peer and its ring entry.
    pub fn set_peer(&self, address: &str) {
        let mut peers = self.peers.write().unwrap();
        let _ = peers.insert(address.to_owned(), Arc::new(PeerClient::new(address)));
        let _ = self.ring.add(address);
    }

    /// Drops a peer and its ring entry.
    pub fn remove_peer(&self, address: &str) {
        let mut peers = self.peers.write().unwrap();
        let _ = peers.remove(address);
        let _ = self.ring.remove(address);
    }

    /// Returns the client of the peer owning the given key.
    ///
    /// Yields **None** when the key is owned by this node itself or when no node
    /// is known at all - in both cases the caller has to serve the key locally.
    pub fn pick_peer(&self, key: &str) -> Option<Arc<PeerClient>> {
        let owner = self.ring.get(key)?;
        if owner == self.self_address {
            return None;
        }

        let peer = self.peers.read().unwrap().get(&owner).cloned();
        if peer.is_some() {
            log::debug!("{} picked peer {} for key {}", self.self_address, owner, key);
        }
        peer
    }

    /// Returns the number of known peers (including this node's own entry).
    pub fn node_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_parsed_from_registry_keys() {
        let picker = PeerPicker::new("nimbus", "10.0.0.1:8001");

        assert_eq!(
            picker.parse_address("nimbus/10.0.0.2:8001"),
            Some("10.0.0.2:8001")
        );
        assert_eq!(picker.parse_address("nimbus/"), None);
        assert_eq!(picker.parse_address("other/10.0.0.2:8001"), None);
    }

    #[test]
    fn picks_skip_the_own_address() {
        let picker = PeerPicker::new("nimbus", "10.0.0.1:8001");
        picker.set_peer("10.0.0.1:8001");

        // Every key is owned by the only node - which is us, so there is never a
        // peer to ask...
        for i in 0..10 {
            assert!(picker.pick_peer(&format!("key-{}", i)).is_none());
        }

        // Once another node appears, some keys route to it...
        picker.set_peer("10.0.0.2:8001");
        let routed = (0..100)
            .filter(|i| picker.pick_peer(&format!("key-{}", i)).is_some())
            .count();
        assert!(routed > 0);
        assert!(routed < 100);
    }

    #[test]
    fn removed_peers_are_no_longer_picked() {
        let picker = PeerPicker::new("nimbus", "10.0.0.1:8001");
        picker.set_peer("10.0.0.1:8001");
        picker.set_peer("10.0.0.2:8001");
        assert_eq!(picker.node_count(), 2);

        picker.remove_peer("10.0.0.2:8001");
        assert_eq!(picker.node_count(), 1);
        for i in 0..20 {
            assert!(picker.pick_peer(&format!("key-{}", i)).is_none());
        }
    }

    #[test]
    fn an_empty_directory_never_picks() {
        let picker = PeerPicker::new("nimbus", "");
        assert!(picker.pick_peer("key").is_none());
        assert_eq!(picker.node_count(), 0);
    }
}
