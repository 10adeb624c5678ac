//! SPV peer-to-peer client: wire messages, bloom filtering, the peer state
//! machine, the peer group and the sync controller.

pub mod bloom;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod group;
pub mod message;
pub mod peer;
pub mod sync;

pub use bloom::BloomFilter;
pub use checkpoint::CheckpointSyncer;
pub use config::ClientConfig;
pub use error::{PeerError, ProtocolError, WireError};
pub use group::{PeerGroup, PeerGroupDelegate, SyncState};
pub use message::Message;
pub use sync::BlockChain;
