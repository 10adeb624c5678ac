//! Bitcoin P2P message framing and the typed payloads this client speaks.
//!
//! Frames are `magic (4) | command (12, zero padded) | length (4, LE) |
//! checksum (4)` followed by the payload; the checksum is the first four
//! bytes of the payload's double SHA-256. Unknown commands decode to
//! [`Message::Ignored`] and are never fatal.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use spvkit_network::{Hash256, MAX_HEADERS_RESULTS, MAX_PAYLOAD_SIZE};
use spvkit_primitives::{sha256d, BlockHeader, Decoder, Encoder, PartialMerkleTree, Transaction};

use crate::error::WireError;

pub const HEADER_SIZE: usize = 24;
const COMMAND_SIZE: usize = 12;
const MAX_INV_RESULTS: usize = 50_000;
const MAX_ADDR_RESULTS: usize = 1_000;
const MAX_FILTER_BYTES: usize = 36_000;
const MAX_FILTER_HASH_FUNCS: u32 = 50;

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Builds a complete frame around an already-encoded payload.
pub fn frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(command.len() <= COMMAND_SIZE);
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    let mut command_bytes = [0u8; COMMAND_SIZE];
    let len = command.len().min(COMMAND_SIZE);
    command_bytes[..len].copy_from_slice(&command.as_bytes()[..len]);
    out.extend_from_slice(&command_bytes);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(payload));
    out.extend_from_slice(payload);
    out
}

/// The fixed 24-byte prefix of a frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    pub fn decode(bytes: &[u8; HEADER_SIZE], magic: [u8; 4]) -> Result<Self, WireError> {
        if bytes[..4] != magic {
            return Err(WireError::BadMagic);
        }
        let command = bytes[4..4 + COMMAND_SIZE]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        if length as usize > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(length as usize));
        }
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        Ok(Self {
            command,
            length,
            checksum,
        })
    }

    pub fn verify(&self, payload: &[u8]) -> Result<(), WireError> {
        if checksum(payload) != self.checksum {
            return Err(WireError::BadChecksum);
        }
        Ok(())
    }
}

/// A `services + ip + port` triple as embedded in `version` and `addr`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn unspecified() -> Self {
        Self {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let ip6 = Ipv6Addr::from(self.ip);
        let ip = match ip6.to_ipv4_mapped() {
            Some(ip4) => IpAddr::V4(ip4),
            None => IpAddr::V6(ip6),
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn from_socket_addr(addr: SocketAddr, services: u64) -> Self {
        let ip6 = match addr.ip() {
            IpAddr::V4(ip4) => ip4.to_ipv6_mapped(),
            IpAddr::V6(ip6) => ip6,
        };
        Self {
            services,
            ip: ip6.octets(),
            port: addr.port(),
        }
    }

    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip);
        encoder.write_u16_be(self.port);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, WireError> {
        let services = decoder.read_u64_le()?;
        let ip = decoder.read_fixed::<16>()?;
        let port = decoder.read_u16_be()?;
        Ok(Self { services, ip, port })
    }
}

/// Loopback and unspecified addresses are useless as dial candidates.
pub fn is_routable(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return false;
    }
    match addr.ip() {
        IpAddr::V4(ip) => !ip.is_unspecified() && !ip.is_loopback() && ip != Ipv4Addr::BROADCAST,
        IpAddr::V6(ip) => !ip.is_unspecified() && !ip.is_loopback(),
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetworkAddress,
    pub sender: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: Hash256,
}

/// Shared payload of `getheaders` and `getblocks`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetBlocksMessage {
    pub version: u32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MerkleBlockMessage {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

impl MerkleBlockMessage {
    pub fn partial_tree(&self) -> PartialMerkleTree {
        PartialMerkleTree {
            total_transactions: self.total_transactions,
            hashes: self.hashes.clone(),
            flags: self.flags.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterLoadMessage {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimestampedAddress {
    pub time: u32,
    pub addr: NetworkAddress,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InventoryVector>),
    GetData(Vec<InventoryVector>),
    GetHeaders(GetBlocksMessage),
    GetBlocks(GetBlocksMessage),
    Headers(Vec<BlockHeader>),
    MerkleBlock(MerkleBlockMessage),
    Tx(Transaction),
    FilterLoad(FilterLoadMessage),
    Mempool,
    Reject(RejectMessage),
    Addr(Vec<TimestampedAddress>),
    /// A command this client does not understand. Never fatal.
    Ignored { command: String },
}

impl Message {
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::GetHeaders(_) => "getheaders",
            Message::GetBlocks(_) => "getblocks",
            Message::Headers(_) => "headers",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Tx(_) => "tx",
            Message::FilterLoad(_) => "filterload",
            Message::Mempool => "mempool",
            Message::Reject(_) => "reject",
            Message::Addr(_) => "addr",
            Message::Ignored { command } => command,
        }
    }

    pub fn encode(&self, magic: [u8; 4]) -> Vec<u8> {
        frame(magic, self.command(), &self.encode_payload())
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Message::Version(version) => encode_version(&mut encoder, version),
            Message::Verack | Message::Mempool | Message::Ignored { .. } => {}
            Message::Ping(nonce) | Message::Pong(nonce) => encoder.write_u64_le(*nonce),
            Message::Inv(items) | Message::GetData(items) => encode_inventory(&mut encoder, items),
            Message::GetHeaders(request) | Message::GetBlocks(request) => {
                encode_get_blocks(&mut encoder, request)
            }
            Message::Headers(headers) => encode_headers(&mut encoder, headers),
            Message::MerkleBlock(block) => encode_merkleblock(&mut encoder, block),
            Message::Tx(tx) => tx.encode_to(&mut encoder),
            Message::FilterLoad(filter) => encode_filterload(&mut encoder, filter),
            Message::Reject(reject) => encode_reject(&mut encoder, reject),
            Message::Addr(addrs) => encode_addr(&mut encoder, addrs),
        }
        encoder.into_inner()
    }

    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, WireError> {
        let mut decoder = Decoder::new(payload);
        match command {
            "version" => decode_version(&mut decoder).map(Message::Version),
            "verack" => Ok(Message::Verack),
            "ping" => Ok(Message::Ping(decoder.read_u64_le()?)),
            "pong" => Ok(Message::Pong(decoder.read_u64_le()?)),
            "inv" => decode_inventory(&mut decoder).map(Message::Inv),
            "getdata" => decode_inventory(&mut decoder).map(Message::GetData),
            "getheaders" => decode_get_blocks(&mut decoder).map(Message::GetHeaders),
            "getblocks" => decode_get_blocks(&mut decoder).map(Message::GetBlocks),
            "headers" => decode_headers(&mut decoder).map(Message::Headers),
            "merkleblock" => decode_merkleblock(&mut decoder).map(Message::MerkleBlock),
            "tx" => Ok(Message::Tx(Transaction::decode_from(&mut decoder)?)),
            "filterload" => decode_filterload(&mut decoder).map(Message::FilterLoad),
            "mempool" => Ok(Message::Mempool),
            "reject" => decode_reject(&mut decoder).map(Message::Reject),
            "addr" => decode_addr(&mut decoder).map(Message::Addr),
            other => Ok(Message::Ignored {
                command: other.to_string(),
            }),
        }
    }
}

fn encode_version(encoder: &mut Encoder, version: &VersionMessage) {
    encoder.write_i32_le(version.version);
    encoder.write_u64_le(version.services);
    encoder.write_i64_le(version.timestamp);
    version.receiver.encode_to(encoder);
    version.sender.encode_to(encoder);
    encoder.write_u64_le(version.nonce);
    encoder.write_var_str(&version.user_agent);
    encoder.write_i32_le(version.start_height);
    encoder.write_u8(version.relay as u8);
}

fn decode_version(decoder: &mut Decoder<'_>) -> Result<VersionMessage, WireError> {
    let version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let timestamp = decoder.read_i64_le()?;
    let receiver = NetworkAddress::decode_from(decoder)?;
    let sender = NetworkAddress::decode_from(decoder)?;
    let nonce = decoder.read_u64_le()?;
    let user_agent = decoder.read_var_str()?;
    let start_height = decoder.read_i32_le()?;
    // Old peers omit the relay flag.
    let relay = if decoder.is_empty() {
        true
    } else {
        decoder.read_u8()? != 0
    };
    Ok(VersionMessage {
        version,
        services,
        timestamp,
        receiver,
        sender,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

fn encode_inventory(encoder: &mut Encoder, items: &[InventoryVector]) {
    encoder.write_varint(items.len() as u64);
    for item in items {
        encoder.write_u32_le(item.inv_type);
        encoder.write_hash(&item.hash);
    }
}

fn decode_inventory(decoder: &mut Decoder<'_>) -> Result<Vec<InventoryVector>, WireError> {
    let count = decoder.read_count()?;
    if count > MAX_INV_RESULTS {
        return Err(WireError::Malformed("inventory count too large"));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder.read_u32_le()?;
        let hash = decoder.read_hash()?;
        items.push(InventoryVector { inv_type, hash });
    }
    Ok(items)
}

fn encode_get_blocks(encoder: &mut Encoder, request: &GetBlocksMessage) {
    encoder.write_u32_le(request.version);
    encoder.write_varint(request.locator.len() as u64);
    for hash in &request.locator {
        encoder.write_hash(hash);
    }
    encoder.write_hash(&request.stop);
}

fn decode_get_blocks(decoder: &mut Decoder<'_>) -> Result<GetBlocksMessage, WireError> {
    let version = decoder.read_u32_le()?;
    let count = decoder.read_count()?;
    if count > MAX_INV_RESULTS {
        return Err(WireError::Malformed("locator count too large"));
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(decoder.read_hash()?);
    }
    let stop = decoder.read_hash()?;
    Ok(GetBlocksMessage {
        version,
        locator,
        stop,
    })
}

fn encode_headers(encoder: &mut Encoder, headers: &[BlockHeader]) {
    encoder.write_varint(headers.len() as u64);
    for header in headers {
        header.encode_to(encoder);
        // Header announcements carry an always-zero transaction count.
        encoder.write_varint(0);
    }
}

fn decode_headers(decoder: &mut Decoder<'_>) -> Result<Vec<BlockHeader>, WireError> {
    let count = decoder.read_count()?;
    if count > MAX_HEADERS_RESULTS {
        return Err(WireError::Malformed("header count too large"));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header = BlockHeader::decode_from(decoder)?;
        let _tx_count = decoder.read_varint()?;
        headers.push(header);
    }
    Ok(headers)
}

fn encode_merkleblock(encoder: &mut Encoder, block: &MerkleBlockMessage) {
    block.header.encode_to(encoder);
    encoder.write_u32_le(block.total_transactions);
    encoder.write_varint(block.hashes.len() as u64);
    for hash in &block.hashes {
        encoder.write_hash(hash);
    }
    encoder.write_var_bytes(&block.flags);
}

fn decode_merkleblock(decoder: &mut Decoder<'_>) -> Result<MerkleBlockMessage, WireError> {
    let header = BlockHeader::decode_from(decoder)?;
    let total_transactions = decoder.read_u32_le()?;
    let count = decoder.read_count()?;
    if count > decoder.remaining() / 32 + 1 {
        return Err(WireError::Malformed("merkleblock hash count too large"));
    }
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(decoder.read_hash()?);
    }
    let flags = decoder.read_var_bytes()?;
    Ok(MerkleBlockMessage {
        header,
        total_transactions,
        hashes,
        flags,
    })
}

fn encode_filterload(encoder: &mut Encoder, filter: &FilterLoadMessage) {
    encoder.write_var_bytes(&filter.filter);
    encoder.write_u32_le(filter.hash_funcs);
    encoder.write_u32_le(filter.tweak);
    encoder.write_u8(filter.flags);
}

fn decode_filterload(decoder: &mut Decoder<'_>) -> Result<FilterLoadMessage, WireError> {
    let filter = decoder.read_var_bytes()?;
    if filter.len() > MAX_FILTER_BYTES {
        return Err(WireError::Malformed("bloom filter too large"));
    }
    let hash_funcs = decoder.read_u32_le()?;
    if hash_funcs > MAX_FILTER_HASH_FUNCS {
        return Err(WireError::Malformed("too many bloom hash functions"));
    }
    let tweak = decoder.read_u32_le()?;
    let flags = decoder.read_u8()?;
    Ok(FilterLoadMessage {
        filter,
        hash_funcs,
        tweak,
        flags,
    })
}

fn encode_reject(encoder: &mut Encoder, reject: &RejectMessage) {
    encoder.write_var_str(&reject.message);
    encoder.write_u8(reject.code);
    encoder.write_var_str(&reject.reason);
    encoder.write_bytes(&reject.data);
}

fn decode_reject(decoder: &mut Decoder<'_>) -> Result<RejectMessage, WireError> {
    let message = decoder.read_var_str()?;
    let code = decoder.read_u8()?;
    let reason = decoder.read_var_str()?;
    let data = decoder.read_bytes(decoder.remaining())?.to_vec();
    Ok(RejectMessage {
        message,
        code,
        reason,
        data,
    })
}

fn encode_addr(encoder: &mut Encoder, addrs: &[TimestampedAddress]) {
    encoder.write_varint(addrs.len() as u64);
    for entry in addrs {
        encoder.write_u32_le(entry.time);
        entry.addr.encode_to(encoder);
    }
}

fn decode_addr(decoder: &mut Decoder<'_>) -> Result<Vec<TimestampedAddress>, WireError> {
    let count = decoder.read_count()?;
    if count > MAX_ADDR_RESULTS {
        return Err(WireError::Malformed("addr count too large"));
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let time = decoder.read_u32_le()?;
        let addr = NetworkAddress::decode_from(decoder)?;
        addrs.push(TimestampedAddress { time, addr });
    }
    Ok(addrs)
}
