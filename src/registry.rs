//! Provides lease based service registration against the etcd registry.
//!
//! A cache node announces itself by writing `<service_name>/<address>` under a
//! lease with a short TTL. A keep-alive task renews the lease periodically; if
//! the node dies or is partitioned, the lease expires, etcd drops the key and
//! every peer observes a DELETE event and removes the node from its directory.
//!
//! On graceful shutdown the lease is revoked explicitly, so peers learn about
//! the departure immediately instead of after a TTL.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use etcd_client::{Client, PutOptions};

use crate::spawn;

/// The lease TTL in seconds; peers learn about a dead node after this at latest.
pub const LEASE_TTL: i64 = 10;

/// The pause between two keep-alive beats, comfortably below the TTL.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Registers this node with the etcd registry and keeps the registration alive.
pub struct Registry {
    client: Client,
    lease_id: Mutex<Option<i64>>,
    stop: Arc<AtomicBool>,
}

impl Registry {
    /// Connects to the registry at the given endpoints.
    pub async fn connect(endpoints: &[String]) -> anyhow::Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .context("Failed to connect to the etcd registry")?;

        Ok(Registry {
            client,
            lease_id: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Announces the given address under the given service name.
    ///
    /// Grants a lease, writes the service key and forks the keep-alive task. A
    /// failure here is fatal for the node - without a registration, no peer will
    /// ever route to it.
    pub async fn register(&self, service_name: &str, address: &str) -> anyhow::Result<()> {
        let mut client = self.client.clone();

        let lease = client
            .lease_grant(LEASE_TTL, None)
            .await
            .context("Failed to create a registry lease")?;
        let lease_id = lease.id();

        let key = format!("{}/{}", service_name, address);
        let _ = client
            .put(
                key.clone(),
                address,
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .context("Failed to register the service key")?;

        *self.lease_id.lock().unwrap() = Some(lease_id);
        self.fork_keep_alive(lease_id);

        log::info!("Service registered: {} -> {}", key, address);
        Ok(())
    }

    /// Forks the task which renews the lease until the registry is stopped.
    fn fork_keep_alive(&self, lease_id: i64) {
        let stop = self.stop.clone();
        let mut client = self.client.clone();

        spawn!(async move {
            let (mut keeper, mut responses) = match client.lease_keep_alive(lease_id).await {
                Ok(channel) => channel,
                Err(error) => {
                    log::error!("Failed to open the keep-alive channel: {}", error);
                    return;
                }
            };

            while !stop.load(Ordering::Acquire) {
                if let Err(error) = keeper.keep_alive().await {
                    log::error!("Keep-alive failed: {}", error);
                    break;
                }
                match responses.message().await {
                    Ok(Some(_)) => log::debug!("Keep-alive check successful"),
                    Ok(None) => {
                        log::warn!("The keep-alive channel was closed by the registry");
                        break;
                    }
                    Err(error) => {
                        log::error!("Keep-alive failed: {}", error);
                        break;
                    }
                }

                tokio::time::sleep(KEEP_ALIVE_INTERVAL).await;
            }
        });
    }

    /// Revokes the lease and stops the keep-alive task.
    ///
    /// After this call, peers observe the DELETE of the service key and drop this
    /// node from their directories.
    pub async fn unregister(&self) {
        self.stop.store(true, Ordering::Release);

        let lease_id = self.lease_id.lock().unwrap().take();
        if let Some(lease_id) = lease_id {
            match self.client.clone().lease_revoke(lease_id).await {
                Ok(_) => log::info!("Registry lease revoked successfully"),
                Err(error) => log::error!("Failed to revoke the registry lease: {}", error),
            }
        }
    }
}
