//! Network descriptors and protocol-wide constants.

pub mod params;

pub use params::{Checkpoint, Network};

/// A double-SHA-256 digest in natural (hashed) byte order.
pub type Hash256 = [u8; 32];

/// Protocol version advertised in `version` messages.
pub const PROTOCOL_VERSION: i32 = 70_015;
/// Hard cap on a single message payload (network rule).
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;
/// Maximum headers returned by a single `headers` message.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Inventory type for a transaction.
pub const MSG_TX: u32 = 1;
/// Inventory type for a full block.
pub const MSG_BLOCK: u32 = 2;
/// Inventory type for a bloom-filtered block.
pub const MSG_FILTERED_BLOCK: u32 = 3;

/// Handshake must complete within this window once the socket opens.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 15;
/// Inbound silence before the peer is probed with a `ping`.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
/// Silence after a `ping` before the peer is dropped.
pub const DEFAULT_PONG_TIMEOUT_SECS: u64 = 30;
/// How long an accepted merkle-block may wait for its matched transactions.
pub const DEFAULT_BLOCK_ASSEMBLY_SECS: u64 = 10;

/// BIP37 bloom filter false-positive target.
pub const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.000_05;
/// Number of BIP37 hash functions installed with `filterload`.
pub const BLOOM_HASH_FUNCS: u32 = 11;
/// BIP37 cap on the serialized filter, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Peers advertising this user-agent prefix sit on an incompatible chain
/// split and are disconnected during the handshake.
pub const BANNED_USER_AGENT_PREFIX: &str = "Bitcoin ABC:0.16";

/// Lowercase hex of a hash in natural (hashed) byte order. This is the
/// canonical form for stored ids.
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter() {
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    out
}

/// Lowercase hex with the byte order reversed, as explorers display ids.
pub fn hash_to_display_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    out
}

/// Parses the canonical (natural byte order) hex form.
pub fn hash_from_hex(hex: &str) -> Option<Hash256> {
    let bytes = parse_hex_32(hex)?;
    Some(bytes)
}

/// Parses the display (reversed byte order) hex form.
pub fn hash_from_display_hex(hex: &str) -> Option<Hash256> {
    let bytes = parse_hex_32(hex)?;
    let mut out = [0u8; 32];
    for (slot, byte) in out.iter_mut().zip(bytes.iter().rev()) {
        *slot = *byte;
    }
    Some(out)
}

fn parse_hex_32(hex: &str) -> Option<Hash256> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for (i, slot) in out.iter_mut().enumerate() {
        let high = (bytes[2 * i] as char).to_digit(16)? as u8;
        let low = (bytes[2 * i + 1] as char).to_digit(16)? as u8;
        *slot = high << 4 | low;
    }
    Some(out)
}

fn hex_digit(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        _ => (b'a' + (value - 10)) as char,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrips_both_orders() {
        let mut hash = [0u8; 32];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let natural = hash_to_hex(&hash);
        let display = hash_to_display_hex(&hash);
        assert_eq!(hash_from_hex(&natural), Some(hash));
        assert_eq!(hash_from_display_hex(&display), Some(hash));
        assert_ne!(natural, display);
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert_eq!(hash_from_hex("abc"), None);
        let bad = "zz".repeat(32);
        assert_eq!(hash_from_display_hex(&bad), None);
    }
}
