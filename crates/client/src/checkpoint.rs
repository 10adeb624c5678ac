//! Checkpoint-cadence header sync: a degenerate peer group that walks
//! headers only, reporting the hash at every checkpoint-interval height.
//! The header walk itself is shared with the full sync path in `peer`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use spvkit_network::{Checkpoint, Network};
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::peer::{self, PeerCommand, PeerEvent, PeerHandle};

/// Walks headers from the newest built-in checkpoint and yields the most
/// recent checkpoint-interval (height, hash) once the tip is reached.
pub struct CheckpointSyncer {
    network: Arc<Network>,
    config: Arc<ClientConfig>,
}

impl CheckpointSyncer {
    pub fn new(network: Network, max_connections: usize) -> Self {
        let mut config = ClientConfig::new(network.clone(), ".");
        config.max_connections = max_connections;
        Self {
            network: Arc::new(network),
            config: Arc::new(config),
        }
    }

    /// Spawns the sync and fires `on_finish` with the latest checkpoint.
    pub fn start<F>(self, on_finish: F)
    where
        F: FnOnce(Checkpoint) + Send + 'static,
    {
        tokio::spawn(async move {
            let checkpoint = self.sync().await;
            on_finish(checkpoint);
        });
    }

    /// Runs until one peer's header walk reaches the advertised tip.
    /// Dropped peers are replaced from the seed rotation indefinitely, so
    /// callers wanting a bound should wrap this in a timeout.
    pub async fn sync(&self) -> Checkpoint {
        let (event_tx, mut events) = mpsc::channel::<PeerEvent>(64);
        let mut peers: HashMap<SocketAddr, PeerHandle> = HashMap::new();
        let mut syncer: Option<SocketAddr> = None;
        let mut seed_cursor = 0usize;
        let mut latest = self.network.last_checkpoint();

        loop {
            self.maintain(&mut peers, &mut seed_cursor, &event_tx).await;

            let Some(event) = events.recv().await else {
                return latest;
            };
            match event {
                PeerEvent::Connected { addr, .. } => {
                    if syncer.is_none() {
                        syncer = Some(addr);
                        info!(%addr, from_height = latest.height, "checkpoint walk started");
                        if let Some(handle) = peers.get(&addr) {
                            handle
                                .command(PeerCommand::StartSync {
                                    filters: Vec::new(),
                                    locator: vec![latest.hash],
                                    latest_height: latest.height,
                                    only_checkpoints: true,
                                })
                                .await;
                        }
                    }
                }
                PeerEvent::Disconnected { addr, reason } => {
                    debug!(%addr, %reason, "checkpoint peer lost");
                    peers.remove(&addr);
                    if syncer == Some(addr) {
                        syncer = None;
                        // Restart from the last checkpoint seen; overlap is
                        // harmless because later walks replay the same
                        // anchored hashes.
                        let next = peers.keys().next().copied();
                        if let Some(next) = next {
                            syncer = Some(next);
                            if let Some(handle) = peers.get(&next) {
                                handle
                                    .command(PeerCommand::StartSync {
                                        filters: Vec::new(),
                                        locator: vec![latest.hash],
                                        latest_height: latest.height,
                                        only_checkpoints: true,
                                    })
                                    .await;
                            }
                        }
                    }
                }
                PeerEvent::CheckpointHash { addr, height, hash } => {
                    if syncer == Some(addr) {
                        latest = Checkpoint { height, hash };
                    }
                }
                PeerEvent::HeadersSynced { addr, height } => {
                    if syncer == Some(addr) {
                        info!(height, "checkpoint walk reached the tip");
                        for handle in peers.values() {
                            handle.command(PeerCommand::Disconnect).await;
                        }
                        return latest;
                    }
                }
                _ => {}
            }
        }
    }

    async fn maintain(
        &self,
        peers: &mut HashMap<SocketAddr, PeerHandle>,
        seed_cursor: &mut usize,
        events: &mpsc::Sender<PeerEvent>,
    ) {
        let max = self.config.max_connections.max(1);
        let seeds = self.network.dns_seeds;
        let mut attempts = 0;
        while peers.len() < max && !seeds.is_empty() && attempts < seeds.len() {
            attempts += 1;
            let seed = seeds[*seed_cursor % seeds.len()];
            *seed_cursor = seed_cursor.wrapping_add(1);
            let resolved = match lookup_host((seed, self.network.port)).await {
                Ok(addrs) => addrs.collect::<Vec<_>>(),
                Err(err) => {
                    debug!(seed, %err, "seed lookup failed");
                    continue;
                }
            };
            let Some(addr) = resolved.into_iter().find(|addr| !peers.contains_key(addr)) else {
                continue;
            };
            let handle = peer::spawn(
                addr,
                Arc::clone(&self.network),
                Arc::clone(&self.config),
                events.clone(),
            );
            peers.insert(addr, handle);
        }
    }
}
