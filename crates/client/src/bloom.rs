//! BIP37 bloom filter construction.

use spvkit_network::{BLOOM_FALSE_POSITIVE_RATE, BLOOM_HASH_FUNCS, MAX_BLOOM_FILTER_SIZE};

use crate::message::FilterLoadMessage;

/// Peer applies filter updates for both outpoints and pubkey scripts.
pub const BLOOM_UPDATE_ALL: u8 = 2;

const MURMUR_SEED_FACTOR: u32 = 0xfba4_c795;

/// The probabilistic match set installed on a peer with `filterload` so it
/// forwards only transactions relevant to our addresses.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    filter: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// Sizes the filter for `element_count` insertions at the configured
    /// false-positive rate.
    pub fn new(element_count: usize, tweak: u32) -> Self {
        Self {
            filter: vec![0u8; optimal_byte_size(element_count)],
            hash_funcs: BLOOM_HASH_FUNCS,
            tweak,
            flags: BLOOM_UPDATE_ALL,
        }
    }

    /// Builds a filter over `elements` with a random tweak.
    pub fn with_elements(elements: &[Vec<u8>]) -> Self {
        let mut filter = Self::new(elements.len(), rand::random());
        for element in elements {
            filter.insert(element);
        }
        filter
    }

    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.hash_funcs {
            let bit = self.bit_index(i, data);
            self.filter[bit >> 3] |= 1 << (bit & 7);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|i| {
            let bit = self.bit_index(i, data);
            self.filter[bit >> 3] & (1 << (bit & 7)) != 0
        })
    }

    pub fn to_filterload(&self) -> FilterLoadMessage {
        FilterLoadMessage {
            filter: self.filter.clone(),
            hash_funcs: self.hash_funcs,
            tweak: self.tweak,
            flags: self.flags,
        }
    }

    fn bit_index(&self, hash_num: u32, data: &[u8]) -> usize {
        let seed = hash_num
            .wrapping_mul(MURMUR_SEED_FACTOR)
            .wrapping_add(self.tweak);
        murmur3_32(data, seed) as usize % (self.filter.len() * 8)
    }
}

/// `S = -1 / ln(2)^2 * N * ln(P) / 8`, capped by the protocol limit.
fn optimal_byte_size(element_count: usize) -> usize {
    let n = element_count.max(1) as f64;
    let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
    let bytes = (-1.0 / ln2_squared * n * BLOOM_FALSE_POSITIVE_RATE.ln() / 8.0).ceil();
    (bytes as usize).clamp(1, MAX_BLOOM_FILTER_SIZE)
}

fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut hash = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13);
        hash = hash.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut k = 0u32;
        for (i, byte) in remainder.iter().enumerate() {
            k |= (*byte as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        hash ^= k;
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur_matches_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"\xff\xff\xff\xff", 0), 0x76293b50);
    }

    #[test]
    fn inserted_elements_match() {
        let mut filter = BloomFilter::new(3, 12345);
        let elements: [&[u8]; 3] = [b"alpha", b"beta", b"gamma"];
        for element in elements {
            filter.insert(element);
        }
        for element in elements {
            assert!(filter.contains(element));
        }
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = BloomFilter::with_elements(&[]);
        assert!(!filter.contains(b"anything"));
        assert!(!filter.contains(&[0u8; 20]));
    }

    #[test]
    fn filterload_carries_protocol_parameters() {
        let filter = BloomFilter::new(10, 42);
        let message = filter.to_filterload();
        assert_eq!(message.hash_funcs, 11);
        assert_eq!(message.tweak, 42);
        assert_eq!(message.flags, BLOOM_UPDATE_ALL);
        assert!(!message.filter.is_empty());
        assert!(message.filter.len() <= 36_000);
    }

    #[test]
    fn tweak_changes_bit_pattern() {
        let mut a = BloomFilter::new(1, 1);
        let mut b = BloomFilter::new(1, 2);
        a.insert(b"same");
        b.insert(b"same");
        assert_ne!(a.to_filterload().filter, b.to_filterload().filter);
    }
}
