//! Chain parameters for the supported networks.

use crate::{hash_from_display_hex, Hash256};

/// A trust anchor bounding how deep a reorganization can reach.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

/// Immutable description of one Bitcoin-family network.
#[derive(Clone, Debug)]
pub struct Network {
    pub name: &'static str,
    pub scheme: &'static str,
    pub magic: [u8; 4],
    pub port: u16,
    pub pubkey_hash_version: u8,
    pub script_hash_version: u8,
    pub dns_seeds: &'static [&'static str],
    pub genesis_hash: Hash256,
    pub checkpoints: Vec<Checkpoint>,
    pub checkpoint_interval: u32,
}

const BITCOIN_MAINNET_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
    "seed.bitcoin.jonasschnelli.ch",
    "seed.btc.petertodd.org",
];

const BITCOIN_TESTNET_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
    "testnet-seed.bluematt.me",
];

const BITCOIN_CASH_MAINNET_SEEDS: &[&str] = &[
    "seed.bitcoinabc.org",
    "seed-abc.bitcoinforks.org",
    "btccash-seeder.bitcoinunlimited.info",
    "seed.bchd.cash",
];

const BITCOIN_CASH_TESTNET_SEEDS: &[&str] = &[
    "testnet-seed.bitcoinabc.org",
    "testnet-seed-abc.bitcoinforks.org",
    "testnet-seed.bchd.cash",
];

const GENESIS_MAINNET: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
const GENESIS_TESTNET: &str = "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943";

impl Network {
    pub fn bitcoin_mainnet() -> Self {
        Self {
            name: "mainnet",
            scheme: "bitcoin",
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            port: 8333,
            pubkey_hash_version: 0x00,
            script_hash_version: 0x05,
            dns_seeds: BITCOIN_MAINNET_SEEDS,
            genesis_hash: display_hash(GENESIS_MAINNET),
            checkpoints: mainnet_checkpoints(),
            checkpoint_interval: 2016,
        }
    }

    pub fn bitcoin_testnet() -> Self {
        Self {
            name: "testnet",
            scheme: "bitcoin",
            magic: [0x0b, 0x11, 0x09, 0x07],
            port: 18333,
            pubkey_hash_version: 0x6f,
            script_hash_version: 0xc4,
            dns_seeds: BITCOIN_TESTNET_SEEDS,
            genesis_hash: display_hash(GENESIS_TESTNET),
            checkpoints: testnet_checkpoints(),
            checkpoint_interval: 2016,
        }
    }

    pub fn bitcoin_cash_mainnet() -> Self {
        Self {
            name: "mainnet",
            scheme: "bitcoincash",
            magic: [0xe3, 0xe1, 0xf3, 0xe8],
            port: 8333,
            pubkey_hash_version: 0x00,
            script_hash_version: 0x05,
            dns_seeds: BITCOIN_CASH_MAINNET_SEEDS,
            genesis_hash: display_hash(GENESIS_MAINNET),
            checkpoints: bitcoin_cash_checkpoints(),
            checkpoint_interval: 2016,
        }
    }

    pub fn bitcoin_cash_testnet() -> Self {
        Self {
            name: "testnet",
            scheme: "bitcoincash",
            magic: [0xf4, 0xe5, 0xf3, 0xf4],
            port: 18333,
            pubkey_hash_version: 0x6f,
            script_hash_version: 0xc4,
            dns_seeds: BITCOIN_CASH_TESTNET_SEEDS,
            genesis_hash: display_hash(GENESIS_TESTNET),
            checkpoints: testnet_checkpoints(),
            checkpoint_interval: 2016,
        }
    }

    /// The hash the chain must carry at `height`, when `height` is anchored.
    pub fn checkpoint_at(&self, height: u32) -> Option<Hash256> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
            .map(|checkpoint| checkpoint.hash)
    }

    /// The deepest anchor not above `height`.
    pub fn latest_checkpoint_at_or_below(&self, height: u32) -> Option<Checkpoint> {
        self.checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.height <= height)
            .max_by_key(|checkpoint| checkpoint.height)
            .copied()
    }

    /// The most recent built-in anchor; sync starts here on a fresh store.
    pub fn last_checkpoint(&self) -> Checkpoint {
        self.checkpoints
            .iter()
            .max_by_key(|checkpoint| checkpoint.height)
            .copied()
            .unwrap_or(Checkpoint {
                height: 0,
                hash: self.genesis_hash,
            })
    }
}

fn display_hash(hex: &str) -> Hash256 {
    match hash_from_display_hex(hex) {
        Some(hash) => hash,
        None => panic!("invalid built-in hash constant"),
    }
}

fn checkpoint(height: u32, hex: &str) -> Checkpoint {
    Checkpoint {
        height,
        hash: display_hash(hex),
    }
}

fn mainnet_checkpoints() -> Vec<Checkpoint> {
    vec![
        checkpoint(0, GENESIS_MAINNET),
        checkpoint(
            11111,
            "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
        ),
        checkpoint(
            33333,
            "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
        ),
        checkpoint(
            105000,
            "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
        ),
        checkpoint(
            134444,
            "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
        ),
        checkpoint(
            168000,
            "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
        ),
        checkpoint(
            210000,
            "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e",
        ),
        checkpoint(
            250000,
            "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214",
        ),
    ]
}

fn testnet_checkpoints() -> Vec<Checkpoint> {
    vec![
        checkpoint(0, GENESIS_TESTNET),
        checkpoint(
            546,
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        ),
    ]
}

fn bitcoin_cash_checkpoints() -> Vec<Checkpoint> {
    let mut checkpoints = mainnet_checkpoints();
    // First block mined after the 2017 chain split.
    checkpoints.push(checkpoint(
        478559,
        "000000000000000000651ef99cb9fcbe0dadde1d424bd9f15ff20136191a5eec",
    ));
    checkpoints
}
