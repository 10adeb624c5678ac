//! The two digest chains everything above is built on: double SHA-256 for
//! ids and checksums, RIPEMD-160 over SHA-256 for address payloads.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use spvkit_network::Hash256;

pub fn sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    Sha256::digest(Sha256::digest(data)).into()
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}
