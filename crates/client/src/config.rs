use std::path::PathBuf;
use std::time::Duration;

use spvkit_network::{
    Network, DEFAULT_BLOCK_ASSEMBLY_SECS, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PONG_TIMEOUT_SECS,
};

/// Everything a host application can tune. No environment variables and no
/// process-global state; the caches directory is an explicit root path.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub network: Network,
    pub max_connections: usize,
    /// Optional prefix for the database file name.
    pub db_name: Option<String>,
    /// Enables symmetric encryption of the database file when the linked
    /// SQLite supports it.
    pub db_passphrase: Option<String>,
    pub user_agent: String,
    pub caches_dir: PathBuf,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub pong_timeout: Duration,
    pub block_assembly_window: Duration,
}

impl ClientConfig {
    pub fn new(network: Network, caches_dir: impl Into<PathBuf>) -> Self {
        Self {
            network,
            max_connections: 3,
            db_name: None,
            db_passphrase: None,
            user_agent: concat!("/spvkit:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            caches_dir: caches_dir.into(),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
            block_assembly_window: Duration::from_secs(DEFAULT_BLOCK_ASSEMBLY_SECS),
        }
    }

    /// `<caches-dir>/<optional-name>-<scheme>-<network>-blockchain.sqlite`
    pub fn database_path(&self) -> PathBuf {
        let prefix = match &self.db_name {
            Some(name) => format!("{name}-"),
            None => String::new(),
        };
        self.caches_dir.join(format!(
            "{prefix}{}-{}-blockchain.sqlite",
            self.network.scheme, self.network.name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_path_includes_scheme_and_network() {
        let config = ClientConfig::new(Network::bitcoin_testnet(), "/tmp/caches");
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/caches/bitcoin-testnet-blockchain.sqlite")
        );

        let mut named = ClientConfig::new(Network::bitcoin_cash_mainnet(), "/tmp/caches");
        named.db_name = Some("wallet0".to_string());
        assert_eq!(
            named.database_path(),
            PathBuf::from("/tmp/caches/wallet0-bitcoincash-mainnet-blockchain.sqlite")
        );
    }
}
