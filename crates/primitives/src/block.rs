use spvkit_network::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

pub const HEADER_SIZE: usize = 80;

/// An 80-byte block header. The block id is the double SHA-256 of the
/// serialization, kept in natural byte order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_hash);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.timestamp);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        decoder.expect_empty()?;
        Ok(header)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_hash = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let timestamp = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        Ok(Self {
            version,
            prev_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = BlockHeader {
            version: 2,
            prev_hash: [0x11; 32],
            merkle_root: [0x22; 32],
            timestamp: 1_400_000_000,
            bits: 0x1b04_864c,
            nonce: 42,
        };
        let bytes = header.consensus_encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(BlockHeader::consensus_decode(&bytes).expect("decode"), header);
    }
}
