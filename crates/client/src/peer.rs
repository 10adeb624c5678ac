//! One outbound connection: handshake, liveness, and the header walk that
//! drives both full sync and checkpoint-only sync.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use spvkit_network::{
    Hash256, Network, BANNED_USER_AGENT_PREFIX, MAX_HEADERS_RESULTS, MSG_BLOCK,
    MSG_FILTERED_BLOCK, PROTOCOL_VERSION,
};
use spvkit_primitives::{BlockHeader, Transaction};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::config::ClientConfig;
use crate::error::{PeerError, ProtocolError};
use crate::message::{
    is_routable, FrameHeader, GetBlocksMessage, InventoryVector, MerkleBlockMessage, Message,
    NetworkAddress, VersionMessage, HEADER_SIZE,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    VersionSent,
    VersionAcked,
    Ready,
    Syncing,
    Synced,
    Dropped,
}

#[derive(Debug)]
pub enum PeerCommand {
    StartSync {
        filters: Vec<Vec<u8>>,
        locator: Vec<Hash256>,
        latest_height: u32,
        only_checkpoints: bool,
    },
    ResyncFrom {
        locator: Vec<Hash256>,
        latest_height: u32,
    },
    UpdateFilter {
        filters: Vec<Vec<u8>>,
    },
    SendTransaction(Transaction),
    Disconnect,
}

#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        addr: SocketAddr,
        user_agent: String,
        start_height: i32,
    },
    Disconnected {
        addr: SocketAddr,
        reason: String,
    },
    MerkleBlock {
        addr: SocketAddr,
        block: MerkleBlockMessage,
    },
    Tx {
        addr: SocketAddr,
        tx: Transaction,
    },
    /// The header walk caught up with the peer's tip.
    HeadersSynced {
        addr: SocketAddr,
        height: u32,
    },
    /// A checkpoint-cadence hash seen during a checkpoint-only walk.
    CheckpointHash {
        addr: SocketAddr,
        height: u32,
        hash: Hash256,
    },
    /// Dial candidates learned from an `addr` message.
    KnownAddrs {
        addrs: Vec<SocketAddr>,
    },
}

/// Control surface the group keeps per spawned peer.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    commands: mpsc::Sender<PeerCommand>,
}

impl PeerHandle {
    pub async fn command(&self, command: PeerCommand) {
        // A send failure means the peer task already exited; its
        // Disconnected event is on the way.
        let _ = self.commands.send(command).await;
    }
}

/// Spawns the peer task. Lifecycle outcomes are reported through `events`;
/// the final event is always `Disconnected`.
pub fn spawn(
    addr: SocketAddr,
    network: Arc<Network>,
    config: Arc<ClientConfig>,
    events: mpsc::Sender<PeerEvent>,
) -> PeerHandle {
    let (command_tx, command_rx) = mpsc::channel(32);
    tokio::spawn(run_peer(addr, network, config, events, command_rx));
    PeerHandle {
        addr,
        commands: command_tx,
    }
}

async fn run_peer(
    addr: SocketAddr,
    network: Arc<Network>,
    config: Arc<ClientConfig>,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
) {
    let reason = match peer_main(addr, network, config, events.clone(), commands).await {
        Ok(()) => "disconnect requested".to_string(),
        Err(err) => err.to_string(),
    };
    debug!(%addr, %reason, "peer closed");
    let _ = events.send(PeerEvent::Disconnected { addr, reason }).await;
}

struct SyncCursor {
    last_hash: Hash256,
    last_height: u32,
    only_checkpoints: bool,
}

struct PeerRunner {
    addr: SocketAddr,
    network: Arc<Network>,
    config: Arc<ClientConfig>,
    events: mpsc::Sender<PeerEvent>,
    write: OwnedWriteHalf,
    state: PeerState,
    sync: Option<SyncCursor>,
    pending_ping: Option<(u64, Instant)>,
    last_recv: Instant,
}

async fn peer_main(
    addr: SocketAddr,
    network: Arc<Network>,
    config: Arc<ClientConfig>,
    events: mpsc::Sender<PeerEvent>,
    mut commands: mpsc::Receiver<PeerCommand>,
) -> Result<(), PeerError> {
    let stream = match timeout(config.handshake_timeout, TcpStream::connect(addr)).await {
        Ok(stream) => stream?,
        Err(_) => return Err(PeerError::Timeout("connect")),
    };
    let (read, write) = stream.into_split();

    let magic = network.magic;
    let (frame_tx, mut frames) = mpsc::channel::<Result<(String, Vec<u8>), PeerError>>(64);
    tokio::spawn(read_loop(read, magic, frame_tx));

    let mut runner = PeerRunner {
        addr,
        network,
        config,
        events,
        write,
        state: PeerState::Connecting,
        sync: None,
        pending_ping: None,
        last_recv: Instant::now(),
    };

    match timeout(
        runner.config.handshake_timeout,
        runner.handshake(&mut frames),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(PeerError::Timeout("handshake")),
    }

    runner.run(&mut frames, &mut commands).await
}

async fn read_loop(
    mut read: OwnedReadHalf,
    magic: [u8; 4],
    frames: mpsc::Sender<Result<(String, Vec<u8>), PeerError>>,
) {
    loop {
        let frame = read_frame(&mut read, magic).await;
        let failed = frame.is_err();
        if frames.send(frame).await.is_err() || failed {
            return;
        }
    }
}

async fn read_frame(
    read: &mut OwnedReadHalf,
    magic: [u8; 4],
) -> Result<(String, Vec<u8>), PeerError> {
    let mut header = [0u8; HEADER_SIZE];
    read.read_exact(&mut header).await?;
    let frame = FrameHeader::decode(&header, magic)?;
    let mut payload = vec![0u8; frame.length as usize];
    read.read_exact(&mut payload).await?;
    frame.verify(&payload)?;
    Ok((frame.command, payload))
}

impl PeerRunner {
    async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        let bytes = message.encode(self.network.magic);
        self.write.write_all(&bytes).await?;
        Ok(())
    }

    fn version_message(&self) -> VersionMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp,
            receiver: NetworkAddress::from_socket_addr(self.addr, 0),
            sender: NetworkAddress::unspecified(),
            nonce: rand::random(),
            user_agent: self.config.user_agent.clone(),
            start_height: 0,
            // Nothing is relayed until the bloom filter is installed.
            relay: false,
        }
    }

    async fn handshake(
        &mut self,
        frames: &mut mpsc::Receiver<Result<(String, Vec<u8>), PeerError>>,
    ) -> Result<(), PeerError> {
        self.send(Message::Version(self.version_message())).await?;
        self.state = PeerState::VersionSent;

        let mut remote: Option<(String, i32)> = None;
        let mut acked = false;
        while remote.is_none() || !acked {
            let frame = match frames.recv().await {
                Some(frame) => frame?,
                None => return Err(PeerError::Disconnected),
            };
            let (command, payload) = frame;
            match Message::decode_payload(&command, &payload)? {
                Message::Version(version) => {
                    if version.user_agent.starts_with(BANNED_USER_AGENT_PREFIX) {
                        self.state = PeerState::Dropped;
                        return Err(PeerError::BannedUserAgent(version.user_agent));
                    }
                    self.send(Message::Verack).await?;
                    remote = Some((version.user_agent, version.start_height));
                }
                Message::Verack => {
                    self.state = PeerState::VersionAcked;
                    acked = true;
                }
                Message::Ping(nonce) => self.send(Message::Pong(nonce)).await?,
                _ => {}
            }
        }

        let (user_agent, start_height) = remote.unwrap_or_default();
        self.state = PeerState::Ready;
        let _ = self
            .events
            .send(PeerEvent::Connected {
                addr: self.addr,
                user_agent,
                start_height,
            })
            .await;
        Ok(())
    }

    async fn run(
        &mut self,
        frames: &mut mpsc::Receiver<Result<(String, Vec<u8>), PeerError>>,
        commands: &mut mpsc::Receiver<PeerCommand>,
    ) -> Result<(), PeerError> {
        loop {
            let deadline = match self.pending_ping {
                Some((_, deadline)) => deadline,
                None => self.last_recv + self.config.idle_timeout,
            };
            tokio::select! {
                frame = frames.recv() => {
                    let (command, payload) = match frame {
                        Some(frame) => frame?,
                        None => return Err(PeerError::Disconnected),
                    };
                    self.last_recv = Instant::now();
                    self.handle_frame(&command, &payload).await?;
                }
                command = commands.recv() => {
                    match command {
                        Some(PeerCommand::Disconnect) | None => return Ok(()),
                        Some(command) => self.handle_command(command).await?,
                    }
                }
                _ = sleep_until(deadline) => {
                    if self.pending_ping.is_some() {
                        self.state = PeerState::Dropped;
                        return Err(PeerError::Timeout("pong"));
                    }
                    let nonce = rand::random();
                    self.send(Message::Ping(nonce)).await?;
                    self.pending_ping =
                        Some((nonce, Instant::now() + self.config.pong_timeout));
                }
            }
        }
    }

    async fn handle_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        // Sync and relay commands only make sense once the handshake is done.
        if !matches!(
            self.state,
            PeerState::Ready | PeerState::Syncing | PeerState::Synced
        ) {
            return Ok(());
        }
        match command {
            PeerCommand::StartSync {
                filters,
                locator,
                latest_height,
                only_checkpoints,
            } => {
                let Some(last_hash) = locator.first().copied() else {
                    return Ok(());
                };
                self.state = PeerState::Syncing;
                self.sync = Some(SyncCursor {
                    last_hash,
                    last_height: latest_height,
                    only_checkpoints,
                });
                if !only_checkpoints {
                    let filter = BloomFilter::with_elements(&filters);
                    self.send(Message::FilterLoad(filter.to_filterload()))
                        .await?;
                    // Pick up filter-matched unconfirmed transactions too.
                    self.send(Message::Mempool).await?;
                }
                self.request_headers(locator).await?;
            }
            PeerCommand::ResyncFrom {
                locator,
                latest_height,
            } => {
                if let (Some(cursor), Some(last_hash)) = (&mut self.sync, locator.first().copied())
                {
                    cursor.last_hash = last_hash;
                    cursor.last_height = latest_height;
                    self.request_headers(locator).await?;
                }
            }
            PeerCommand::UpdateFilter { filters } => {
                let filter = BloomFilter::with_elements(&filters);
                self.send(Message::FilterLoad(filter.to_filterload()))
                    .await?;
            }
            PeerCommand::SendTransaction(tx) => {
                self.send(Message::Tx(tx)).await?;
            }
            PeerCommand::Disconnect => unreachable!("handled by the run loop"),
        }
        Ok(())
    }

    async fn request_headers(&mut self, locator: Vec<Hash256>) -> Result<(), PeerError> {
        self.send(Message::GetHeaders(GetBlocksMessage {
            version: PROTOCOL_VERSION as u32,
            locator,
            stop: [0u8; 32],
        }))
        .await
    }

    async fn handle_frame(&mut self, command: &str, payload: &[u8]) -> Result<(), PeerError> {
        match Message::decode_payload(command, payload)? {
            Message::Ping(nonce) => self.send(Message::Pong(nonce)).await?,
            Message::Pong(nonce) => {
                if let Some((expected, _)) = self.pending_ping {
                    if expected == nonce {
                        self.pending_ping = None;
                    }
                }
            }
            Message::Headers(headers) => self.handle_headers(headers).await?,
            Message::MerkleBlock(block) => {
                let _ = self
                    .events
                    .send(PeerEvent::MerkleBlock {
                        addr: self.addr,
                        block,
                    })
                    .await;
            }
            Message::Tx(tx) => {
                let _ = self
                    .events
                    .send(PeerEvent::Tx {
                        addr: self.addr,
                        tx,
                    })
                    .await;
            }
            Message::Inv(items) => self.handle_inv(items).await?,
            Message::Addr(addrs) => {
                let addrs: Vec<SocketAddr> = addrs
                    .iter()
                    .map(|entry| entry.addr.socket_addr())
                    .filter(is_routable)
                    .collect();
                if !addrs.is_empty() {
                    let _ = self.events.send(PeerEvent::KnownAddrs { addrs }).await;
                }
            }
            Message::Reject(reject) => {
                warn!(
                    addr = %self.addr,
                    command = %reject.message,
                    code = reject.code,
                    reason = %reject.reason,
                    "peer rejected our message"
                );
            }
            Message::Ignored { command } => {
                debug!(addr = %self.addr, %command, "ignoring unknown command");
            }
            // Requests a serving node would answer; an SPV client does not.
            Message::Version(_)
            | Message::Verack
            | Message::GetData(_)
            | Message::GetHeaders(_)
            | Message::GetBlocks(_)
            | Message::FilterLoad(_)
            | Message::Mempool => {}
        }
        Ok(())
    }

    /// New-block announcements at the tip arrive as `inv`; request them
    /// filtered like any other synced block.
    async fn handle_inv(&mut self, items: Vec<InventoryVector>) -> Result<(), PeerError> {
        let Some(cursor) = &self.sync else {
            return Ok(());
        };
        if cursor.only_checkpoints {
            return Ok(());
        }
        let wanted: Vec<InventoryVector> = items
            .into_iter()
            .filter(|item| item.inv_type == MSG_BLOCK)
            .map(|item| InventoryVector {
                inv_type: MSG_FILTERED_BLOCK,
                hash: item.hash,
            })
            .collect();
        if !wanted.is_empty() {
            self.send(Message::GetData(wanted)).await?;
        }
        Ok(())
    }

    async fn handle_headers(&mut self, headers: Vec<BlockHeader>) -> Result<(), PeerError> {
        let Some(cursor) = &mut self.sync else {
            return Ok(());
        };

        if headers.is_empty() {
            let height = cursor.last_height;
            self.finish_header_walk(height).await;
            return Ok(());
        }

        let batch_len = headers.len();
        let mut getdata = Vec::new();
        let mut checkpoint_hashes = Vec::new();
        for header in &headers {
            if header.prev_hash != cursor.last_hash {
                self.state = PeerState::Dropped;
                return Err(ProtocolError::ChainDiscontinuity.into());
            }
            let hash = header.hash();
            let height = cursor.last_height + 1;
            if let Some(expected) = self.network.checkpoint_at(height) {
                if expected != hash {
                    self.state = PeerState::Dropped;
                    return Err(ProtocolError::CheckpointMismatch { height }.into());
                }
            }
            if cursor.only_checkpoints {
                if height % self.network.checkpoint_interval == 0 {
                    checkpoint_hashes.push((height, hash));
                }
            } else {
                getdata.push(InventoryVector {
                    inv_type: MSG_FILTERED_BLOCK,
                    hash,
                });
            }
            cursor.last_hash = hash;
            cursor.last_height = height;
        }
        let reached_height = cursor.last_height;
        let reached_hash = cursor.last_hash;

        for (height, hash) in checkpoint_hashes {
            let _ = self
                .events
                .send(PeerEvent::CheckpointHash {
                    addr: self.addr,
                    height,
                    hash,
                })
                .await;
        }
        if !getdata.is_empty() {
            self.send(Message::GetData(getdata)).await?;
        }

        if batch_len >= MAX_HEADERS_RESULTS {
            self.request_headers(vec![reached_hash]).await?;
        } else {
            self.finish_header_walk(reached_height).await;
        }
        Ok(())
    }

    async fn finish_header_walk(&mut self, height: u32) {
        if let Some(cursor) = &self.sync {
            if cursor.only_checkpoints {
                self.state = PeerState::Synced;
            }
        }
        let _ = self
            .events
            .send(PeerEvent::HeadersSynced {
                addr: self.addr,
                height,
            })
            .await;
    }
}
