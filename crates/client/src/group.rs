//! Peer pool management: seed rotation, syncer election, transaction
//! fan-out, and the delegate surface host applications consume.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spvkit_network::Network;
use spvkit_primitives::Transaction;
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::peer::{self, PeerCommand, PeerEvent, PeerHandle};
use crate::sync::{BlockChain, MerkleOutcome, SyncError};

/// Host-visible sync status. Progress is the fraction of the distance from
/// the sync start to the best height advertised by the syncing peer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SyncState {
    NotSynced,
    Syncing(f64),
    Synced,
}

/// Callbacks delivered from the group's coordination task.
pub trait PeerGroupDelegate: Send + Sync {
    fn peer_group_started(&self) {}
    fn peer_group_stopped(&self) {}
    fn transaction_received(&self, _transaction: &Transaction) {}
    fn sync_state_changed(&self, _state: SyncState) {}
}

enum GroupCommand {
    RefreshFilter,
    SendTransaction(Transaction),
    Stop,
}

struct GroupShared {
    network: Arc<Network>,
    config: Arc<ClientConfig>,
    chain: Arc<BlockChain>,
    delegate: Mutex<Option<Arc<dyn PeerGroupDelegate>>>,
    filters: Mutex<Vec<Vec<u8>>>,
    queued_txs: Mutex<Vec<Transaction>>,
}

impl GroupShared {
    fn delegate(&self) -> Option<Arc<dyn PeerGroupDelegate>> {
        self.delegate.lock().ok().and_then(|slot| slot.clone())
    }

    fn notify_sync_state(&self, state: SyncState) {
        if let Some(delegate) = self.delegate() {
            delegate.sync_state_changed(state);
        }
    }
}

struct GroupRuntime {
    commands: mpsc::Sender<GroupCommand>,
    task: JoinHandle<()>,
}

/// A small pool of peers drawn round-robin from the network's DNS seeds.
/// Exactly one peer at a time drives synchronization.
pub struct PeerGroup {
    shared: Arc<GroupShared>,
    runtime: Mutex<Option<GroupRuntime>>,
}

impl PeerGroup {
    pub fn new(chain: Arc<BlockChain>, config: ClientConfig) -> Self {
        let network = Arc::new(config.network.clone());
        Self {
            shared: Arc::new(GroupShared {
                network,
                config: Arc::new(config),
                chain,
                delegate: Mutex::new(None),
                filters: Mutex::new(Vec::new()),
                queued_txs: Mutex::new(Vec::new()),
            }),
            runtime: Mutex::new(None),
        }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn PeerGroupDelegate>) {
        if let Ok(mut slot) = self.shared.delegate.lock() {
            *slot = Some(delegate);
        }
    }

    /// Spawns the coordination task. A second call while running is a no-op.
    pub fn start(&self) {
        let Ok(mut runtime) = self.runtime.lock() else {
            return;
        };
        if runtime.is_some() {
            return;
        }
        let (command_tx, command_rx) = mpsc::channel(64);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(run_group(shared, command_rx));
        *runtime = Some(GroupRuntime {
            commands: command_tx,
            task,
        });
    }

    /// Detaches every peer and stops the coordination task. Idempotent.
    pub async fn stop(&self) {
        let runtime = match self.runtime.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(runtime) = runtime {
            let _ = runtime.commands.send(GroupCommand::Stop).await;
            let _ = runtime.task.await;
        }
    }

    /// Registers a bloom filter element (a pubkey hash, script hash, or
    /// outpoint). Live peers receive an updated `filterload`.
    pub fn add_filter(&self, element: Vec<u8>) {
        if let Ok(mut filters) = self.shared.filters.lock() {
            filters.push(element);
        }
        self.send_command(GroupCommand::RefreshFilter);
    }

    /// Relays a signed transaction to every connected peer, or queues it
    /// until the first peer is ready.
    pub fn send_transaction(&self, transaction: Transaction) {
        let running = self
            .runtime
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        if running {
            self.send_command(GroupCommand::SendTransaction(transaction));
        } else if let Ok(mut queued) = self.shared.queued_txs.lock() {
            queued.push(transaction);
        }
    }

    fn send_command(&self, command: GroupCommand) {
        if let Ok(slot) = self.runtime.lock() {
            if let Some(runtime) = slot.as_ref() {
                let _ = runtime.commands.try_send(command);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Connecting,
    Ready,
    Syncing,
}

struct PeerSlot {
    handle: PeerHandle,
    state: SlotState,
    start_height: i32,
}

struct GroupState {
    shared: Arc<GroupShared>,
    peers: HashMap<SocketAddr, PeerSlot>,
    syncer: Option<SocketAddr>,
    fallback_addrs: VecDeque<SocketAddr>,
    seed_cursor: usize,
    events: mpsc::Sender<PeerEvent>,
    last_notified: SyncState,
    store_failed: bool,
}

async fn run_group(shared: Arc<GroupShared>, mut commands: mpsc::Receiver<GroupCommand>) {
    let (event_tx, mut events) = mpsc::channel::<PeerEvent>(256);
    let mut state = GroupState {
        shared: Arc::clone(&shared),
        peers: HashMap::new(),
        syncer: None,
        fallback_addrs: VecDeque::new(),
        seed_cursor: 0,
        events: event_tx,
        last_notified: SyncState::NotSynced,
        store_failed: false,
    };

    shared.chain.mark_sync_start().await;
    if let Some(delegate) = shared.delegate() {
        delegate.peer_group_started();
    }

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        state.maintain_connections().await;
        tokio::select! {
            Some(event) = events.recv() => state.handle_event(event).await,
            command = commands.recv() => match command {
                Some(GroupCommand::RefreshFilter) => state.refresh_filter().await,
                Some(GroupCommand::SendTransaction(tx)) => state.relay_transaction(tx).await,
                Some(GroupCommand::Stop) | None => break,
            },
            _ = tick.tick() => state.on_tick().await,
        }
    }

    for slot in state.peers.values() {
        slot.handle.command(PeerCommand::Disconnect).await;
    }
    if let Some(delegate) = shared.delegate() {
        delegate.peer_group_stopped();
    }
}

impl GroupState {
    /// Tops the pool back up to `max_connections`, one dial candidate per
    /// pass: learned addresses first, then the next DNS seed round-robin.
    async fn maintain_connections(&mut self) {
        if self.store_failed {
            return;
        }
        let max = self.shared.config.max_connections.max(1);
        while self.peers.len() < max {
            let Some(addr) = self.next_candidate().await else {
                return;
            };
            if self.peers.contains_key(&addr) {
                continue;
            }
            debug!(%addr, "dialing peer");
            let handle = peer::spawn(
                addr,
                Arc::clone(&self.shared.network),
                Arc::clone(&self.shared.config),
                self.events.clone(),
            );
            self.peers.insert(
                addr,
                PeerSlot {
                    handle,
                    state: SlotState::Connecting,
                    start_height: 0,
                },
            );
        }
    }

    async fn next_candidate(&mut self) -> Option<SocketAddr> {
        if let Some(addr) = self.fallback_addrs.pop_front() {
            return Some(addr);
        }
        let seeds = self.shared.network.dns_seeds;
        if seeds.is_empty() {
            return None;
        }
        let seed = seeds[self.seed_cursor % seeds.len()];
        self.seed_cursor = self.seed_cursor.wrapping_add(1);
        match lookup_host((seed, self.shared.network.port)).await {
            Ok(addrs) => {
                let mut resolved: Vec<SocketAddr> =
                    addrs.filter(|addr| !self.peers.contains_key(addr)).collect();
                let first = if resolved.is_empty() {
                    None
                } else {
                    Some(resolved.remove(0))
                };
                self.fallback_addrs.extend(resolved.into_iter().take(8));
                first
            }
            Err(err) => {
                debug!(seed, %err, "seed lookup failed");
                None
            }
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                addr,
                user_agent,
                start_height,
            } => {
                info!(%addr, %user_agent, start_height, "peer connected");
                if let Some(slot) = self.peers.get_mut(&addr) {
                    slot.state = SlotState::Ready;
                    slot.start_height = start_height;
                }
                self.flush_queued_transactions(addr).await;
                if self.syncer.is_none() {
                    self.promote_syncer(addr).await;
                }
            }
            PeerEvent::Disconnected { addr, reason } => {
                info!(%addr, %reason, "peer disconnected");
                self.peers.remove(&addr);
                if self.syncer == Some(addr) {
                    self.syncer = None;
                    // In-flight merkle-block requests are not re-dispatched;
                    // the replacement restarts from the persisted tip.
                    let next = self
                        .peers
                        .iter()
                        .find(|(_, slot)| slot.state == SlotState::Ready)
                        .map(|(addr, _)| *addr);
                    match next {
                        Some(next) => self.promote_syncer(next).await,
                        None => self.notify(SyncState::NotSynced),
                    }
                }
                if self.peers.is_empty() {
                    self.notify(SyncState::NotSynced);
                }
            }
            PeerEvent::MerkleBlock { addr, block } => {
                if self.syncer != Some(addr) {
                    return;
                }
                match self.shared.chain.handle_merkleblock(block).await {
                    Ok(MerkleOutcome::Committed { .. }) => self.notify_progress().await,
                    Ok(MerkleOutcome::Pending { .. }) | Ok(MerkleOutcome::Discarded) => {}
                    Ok(MerkleOutcome::Realign {
                        locator,
                        latest_height,
                    }) => {
                        warn!(%addr, "merkle-block chain discontinuity, realigning");
                        if let Some(slot) = self.peers.get(&addr) {
                            slot.handle
                                .command(PeerCommand::ResyncFrom {
                                    locator,
                                    latest_height,
                                })
                                .await;
                        }
                    }
                    Err(err) => self.handle_sync_error(addr, err).await,
                }
            }
            PeerEvent::Tx { addr, tx } => {
                let outcome = match self.shared.chain.handle_tx(&tx).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        self.handle_sync_error(addr, err).await;
                        return;
                    }
                };
                if let Some(delegate) = self.shared.delegate() {
                    delegate.transaction_received(&tx);
                }
                if outcome.committed_height.is_some() {
                    self.notify_progress().await;
                }
            }
            PeerEvent::HeadersSynced { addr, .. } => {
                if self.syncer != Some(addr) {
                    return;
                }
                if let Err(err) = self.shared.chain.flush_all().await {
                    self.handle_sync_error(addr, err).await;
                    return;
                }
                self.notify(SyncState::Synced);
            }
            // Only the checkpoint syncer walks at checkpoint cadence.
            PeerEvent::CheckpointHash { .. } => {}
            PeerEvent::KnownAddrs { addrs } => {
                for addr in addrs {
                    if !self.peers.contains_key(&addr) && self.fallback_addrs.len() < 64 {
                        self.fallback_addrs.push_back(addr);
                    }
                }
            }
        }
    }

    async fn promote_syncer(&mut self, addr: SocketAddr) {
        let locator = match self.shared.chain.locator().await {
            Ok(locator) => locator,
            Err(err) => {
                error!(%err, "cannot build locator, sync halted");
                self.store_failed = true;
                self.notify(SyncState::NotSynced);
                return;
            }
        };
        let (_, latest_height) = self.shared.chain.latest().await;
        let filters = self
            .shared
            .filters
            .lock()
            .map(|filters| filters.clone())
            .unwrap_or_default();
        let Some(slot) = self.peers.get_mut(&addr) else {
            return;
        };
        slot.state = SlotState::Syncing;
        self.syncer = Some(addr);
        info!(%addr, latest_height, "peer promoted to syncer");
        slot.handle
            .command(PeerCommand::StartSync {
                filters,
                locator,
                latest_height,
                only_checkpoints: false,
            })
            .await;
        self.notify_progress().await;
    }

    async fn handle_sync_error(&mut self, addr: SocketAddr, err: SyncError) {
        match err {
            SyncError::Protocol(err) => {
                warn!(%addr, %err, "protocol violation, dropping peer");
                if let Some(slot) = self.peers.get(&addr) {
                    slot.handle.command(PeerCommand::Disconnect).await;
                }
            }
            SyncError::Store(err) => {
                // Unrecoverable here: surface and stop writing until the
                // host reopens the store.
                error!(%err, "index write failed, sync halted");
                self.store_failed = true;
                self.notify(SyncState::NotSynced);
            }
        }
    }

    async fn flush_queued_transactions(&mut self, addr: SocketAddr) {
        let queued: Vec<Transaction> = match self.shared.queued_txs.lock() {
            Ok(mut queued) => queued.drain(..).collect(),
            Err(_) => return,
        };
        if queued.is_empty() {
            return;
        }
        if let Some(slot) = self.peers.get(&addr) {
            for tx in queued {
                slot.handle.command(PeerCommand::SendTransaction(tx)).await;
            }
        }
    }

    async fn relay_transaction(&mut self, tx: Transaction) {
        let connected: Vec<&PeerSlot> = self
            .peers
            .values()
            .filter(|slot| slot.state != SlotState::Connecting)
            .collect();
        if connected.is_empty() {
            if let Ok(mut queued) = self.shared.queued_txs.lock() {
                queued.push(tx);
            }
            return;
        }
        for slot in connected {
            slot.handle
                .command(PeerCommand::SendTransaction(tx.clone()))
                .await;
        }
    }

    async fn refresh_filter(&mut self) {
        let filters = self
            .shared
            .filters
            .lock()
            .map(|filters| filters.clone())
            .unwrap_or_default();
        if let Some(addr) = self.syncer {
            if let Some(slot) = self.peers.get(&addr) {
                slot.handle
                    .command(PeerCommand::UpdateFilter { filters })
                    .await;
            }
        }
    }

    async fn on_tick(&mut self) {
        if self.store_failed {
            return;
        }
        match self.shared.chain.flush_due().await {
            Ok(Some(_)) => self.notify_progress().await,
            Ok(None) => {}
            Err(err) => {
                if let Some(addr) = self.syncer {
                    self.handle_sync_error(addr, err).await;
                }
            }
        }
    }

    async fn notify_progress(&mut self) {
        if self.last_notified == SyncState::Synced {
            return;
        }
        let remote_best = self
            .syncer
            .and_then(|addr| self.peers.get(&addr))
            .map(|slot| slot.start_height)
            .unwrap_or(0);
        let progress = self.shared.chain.progress(remote_best).await;
        self.notify(SyncState::Syncing(progress));
    }

    fn notify(&mut self, state: SyncState) {
        if state == self.last_notified {
            return;
        }
        self.last_notified = state;
        self.shared.notify_sync_state(state);
    }
}
