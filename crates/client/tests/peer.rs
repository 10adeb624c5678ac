use std::sync::Arc;
use std::time::Duration;

use spvkit_client::config::ClientConfig;
use spvkit_client::message::{
    FrameHeader, GetBlocksMessage, InventoryVector, MerkleBlockMessage, Message, NetworkAddress,
    VersionMessage, HEADER_SIZE,
};
use spvkit_client::peer::{self, PeerCommand, PeerEvent};
use spvkit_network::{Hash256, Network};
use spvkit_primitives::BlockHeader;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

async fn recv_event(events: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event wait")
        .expect("event channel open")
}

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut header = [0u8; HEADER_SIZE];
    timeout(Duration::from_secs(5), stream.read_exact(&mut header))
        .await
        .expect("header wait")
        .expect("read header");
    let frame = FrameHeader::decode(&header, MAGIC).expect("frame header");
    let mut payload = vec![0u8; frame.length as usize];
    stream.read_exact(&mut payload).await.expect("read payload");
    frame.verify(&payload).expect("checksum");
    Message::decode_payload(&frame.command, &payload).expect("decode payload")
}

async fn send_message(stream: &mut TcpStream, message: Message) {
    stream
        .write_all(&message.encode(MAGIC))
        .await
        .expect("write message");
}

fn remote_version(user_agent: &str, start_height: i32) -> Message {
    Message::Version(VersionMessage {
        version: 70_015,
        services: 1,
        timestamp: 1_600_000_000,
        receiver: NetworkAddress::unspecified(),
        sender: NetworkAddress::unspecified(),
        nonce: 0x4242,
        user_agent: user_agent.to_string(),
        start_height,
        relay: true,
    })
}

struct Session {
    remote: TcpStream,
    events: mpsc::Receiver<PeerEvent>,
    handle: peer::PeerHandle,
}

async fn connect() -> Session {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let network = Arc::new(Network::bitcoin_mainnet());
    let config = Arc::new(ClientConfig::new(Network::bitcoin_mainnet(), "."));
    let (event_tx, events) = mpsc::channel(64);
    let handle = peer::spawn(addr, network, config, event_tx);
    let (remote, _) = listener.accept().await.expect("accept");
    Session {
        remote,
        events,
        handle,
    }
}

async fn complete_handshake(session: &mut Session, user_agent: &str, start_height: i32) {
    let Message::Version(version) = read_message(&mut session.remote).await else {
        panic!("expected version first");
    };
    assert_eq!(version.services, 0);
    assert!(!version.relay);
    send_message(&mut session.remote, remote_version(user_agent, start_height)).await;
    send_message(&mut session.remote, Message::Verack).await;
    let Message::Verack = read_message(&mut session.remote).await else {
        panic!("expected verack reply");
    };
}

#[tokio::test]
async fn handshake_completes_and_ping_is_echoed() {
    let mut session = connect().await;
    complete_handshake(&mut session, "/Satoshi:0.17.0/", 1_000).await;

    match recv_event(&mut session.events).await {
        PeerEvent::Connected {
            user_agent,
            start_height,
            ..
        } => {
            assert_eq!(user_agent, "/Satoshi:0.17.0/");
            assert_eq!(start_height, 1_000);
        }
        other => panic!("expected connected event, got {other:?}"),
    }

    send_message(&mut session.remote, Message::Ping(0x1dea)).await;
    let Message::Pong(nonce) = read_message(&mut session.remote).await else {
        panic!("expected pong");
    };
    assert_eq!(nonce, 0x1dea);

    drop(session.remote);
    assert!(matches!(
        recv_event(&mut session.events).await,
        PeerEvent::Disconnected { .. }
    ));
}

#[tokio::test]
async fn incompatible_user_agent_is_dropped_before_ready() {
    let mut session = connect().await;
    let Message::Version(_) = read_message(&mut session.remote).await else {
        panic!("expected version first");
    };
    send_message(
        &mut session.remote,
        remote_version("Bitcoin ABC:0.16.0", 500_000),
    )
    .await;

    match recv_event(&mut session.events).await {
        PeerEvent::Disconnected { reason, .. } => {
            assert!(reason.contains("incompatible"), "reason: {reason}");
        }
        other => panic!("expected disconnect, got {other:?}"),
    }
}

#[tokio::test]
async fn sync_walk_requests_filtered_blocks() {
    let mut session = connect().await;
    complete_handshake(&mut session, "/Satoshi:0.17.0/", 10).await;
    let PeerEvent::Connected { .. } = recv_event(&mut session.events).await else {
        panic!("expected connected");
    };

    let genesis: Hash256 = [0u8; 32];
    session
        .handle
        .command(PeerCommand::StartSync {
            filters: vec![vec![0xaa; 20]],
            locator: vec![genesis],
            latest_height: 0,
            only_checkpoints: false,
        })
        .await;

    let Message::FilterLoad(filter) = read_message(&mut session.remote).await else {
        panic!("expected filterload");
    };
    assert_eq!(filter.hash_funcs, 11);
    assert!(!filter.filter.is_empty());

    let Message::Mempool = read_message(&mut session.remote).await else {
        panic!("expected mempool request");
    };

    let Message::GetHeaders(request) = read_message(&mut session.remote).await else {
        panic!("expected getheaders");
    };
    assert_eq!(request.locator, vec![genesis]);

    let header = BlockHeader {
        version: 2,
        prev_hash: genesis,
        merkle_root: [0x0c; 32],
        timestamp: 1_600_000_000,
        bits: 0x1d00_ffff,
        nonce: 3,
    };
    send_message(&mut session.remote, Message::Headers(vec![header])).await;

    let Message::GetData(items) = read_message(&mut session.remote).await else {
        panic!("expected getdata");
    };
    assert_eq!(
        items,
        vec![InventoryVector {
            inv_type: 3,
            hash: header.hash(),
        }]
    );

    // The short batch ends the walk even while blocks are in flight.
    match recv_event(&mut session.events).await {
        PeerEvent::HeadersSynced { height, .. } => assert_eq!(height, 1),
        other => panic!("expected headers synced, got {other:?}"),
    }

    let block = MerkleBlockMessage {
        header,
        total_transactions: 0,
        hashes: vec![],
        flags: vec![],
    };
    send_message(&mut session.remote, Message::MerkleBlock(block.clone())).await;
    match recv_event(&mut session.events).await {
        PeerEvent::MerkleBlock { block: received, .. } => assert_eq!(received, block),
        other => panic!("expected merkleblock event, got {other:?}"),
    }
}

#[tokio::test]
async fn checkpoint_walk_reports_interval_hashes() {
    let mut session = connect().await;
    complete_handshake(&mut session, "/Satoshi:0.17.0/", 3_000).await;
    let PeerEvent::Connected { .. } = recv_event(&mut session.events).await else {
        panic!("expected connected");
    };

    let genesis: Hash256 = [0u8; 32];
    session
        .handle
        .command(PeerCommand::StartSync {
            filters: vec![],
            locator: vec![genesis],
            latest_height: 0,
            only_checkpoints: true,
        })
        .await;

    let Message::GetHeaders(GetBlocksMessage { locator, .. }) =
        read_message(&mut session.remote).await
    else {
        panic!("expected getheaders");
    };
    assert_eq!(locator, vec![genesis]);

    // Build a 2016-block chain: a full 2000-header batch, then the rest.
    let mut headers = Vec::with_capacity(2016);
    let mut prev = genesis;
    for i in 0..2016u32 {
        let header = BlockHeader {
            version: 2,
            prev_hash: prev,
            merkle_root: [(i % 251) as u8; 32],
            timestamp: 1_600_000_000 + i,
            bits: 0x1d00_ffff,
            nonce: i,
        };
        prev = header.hash();
        headers.push(header);
    }
    let checkpoint_hash = headers[2015].hash();

    send_message(&mut session.remote, Message::Headers(headers[..2000].to_vec())).await;
    let Message::GetHeaders(request) = read_message(&mut session.remote).await else {
        panic!("expected continuation getheaders");
    };
    assert_eq!(request.locator, vec![headers[1999].hash()]);

    send_message(&mut session.remote, Message::Headers(headers[2000..].to_vec())).await;
    match recv_event(&mut session.events).await {
        PeerEvent::CheckpointHash { height, hash, .. } => {
            assert_eq!(height, 2016);
            assert_eq!(hash, checkpoint_hash);
        }
        other => panic!("expected checkpoint hash, got {other:?}"),
    }
    match recv_event(&mut session.events).await {
        PeerEvent::HeadersSynced { height, .. } => assert_eq!(height, 2016),
        other => panic!("expected headers synced, got {other:?}"),
    }
}
