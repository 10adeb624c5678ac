use std::fmt;

use spvkit_primitives::DecodeError;

/// Framing-level failures. Any of these severs the peer connection.
#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    BadMagic,
    BadChecksum,
    PayloadTooLarge(usize),
    Malformed(&'static str),
    Decode(DecodeError),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::BadMagic => write!(f, "frame carries the wrong network magic"),
            WireError::BadChecksum => write!(f, "payload checksum mismatch"),
            WireError::PayloadTooLarge(size) => write!(f, "payload of {size} bytes exceeds cap"),
            WireError::Malformed(message) => write!(f, "{message}"),
            WireError::Decode(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<DecodeError> for WireError {
    fn from(err: DecodeError) -> Self {
        WireError::Decode(err)
    }
}

/// Violations of the sync protocol above the framing layer. The offending
/// peer is dropped and sync restarts from the persisted tip.
#[derive(Debug, Eq, PartialEq)]
pub enum ProtocolError {
    MerkleRootMismatch,
    ChainDiscontinuity,
    CheckpointMismatch { height: u32 },
    InvalidFilter,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MerkleRootMismatch => {
                write!(f, "partial merkle tree does not match the header root")
            }
            ProtocolError::ChainDiscontinuity => {
                write!(f, "headers do not extend the known chain")
            }
            ProtocolError::CheckpointMismatch { height } => {
                write!(f, "header at height {height} contradicts a checkpoint")
            }
            ProtocolError::InvalidFilter => write!(f, "bloom filter outside protocol limits"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Everything that can take a single peer down.
#[derive(Debug)]
pub enum PeerError {
    Io(std::io::Error),
    Wire(WireError),
    Protocol(ProtocolError),
    Timeout(&'static str),
    BannedUserAgent(String),
    Disconnected,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Io(err) => write!(f, "{err}"),
            PeerError::Wire(err) => write!(f, "{err}"),
            PeerError::Protocol(err) => write!(f, "{err}"),
            PeerError::Timeout(what) => write!(f, "{what} timed out"),
            PeerError::BannedUserAgent(agent) => {
                write!(f, "peer runs incompatible software: {agent}")
            }
            PeerError::Disconnected => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Io(err)
    }
}

impl From<WireError> for PeerError {
    fn from(err: WireError) -> Self {
        PeerError::Wire(err)
    }
}

impl From<ProtocolError> for PeerError {
    fn from(err: ProtocolError) -> Self {
        PeerError::Protocol(err)
    }
}
