//! Consensus serialization and the script shapes needed for indexing.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use address::{
    base58check_decode, base58check_encode, payee_address, payer_address, AddressError,
};
pub use block::BlockHeader;
pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{hash160, sha256, sha256d};
pub use merkle::{MerkleError, MerkleMatch, PartialMerkleTree};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
