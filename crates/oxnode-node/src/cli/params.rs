use crate::config::NodeConfig;
use clap::Parser;
use std::path::PathBuf;

/// Chain.
#[derive(Clone, Copy, Default, Debug, clap::ValueEnum)]
pub enum Chain {
    /// Bitcoin mainnet.
    #[default]
    Mainnet,
    /// Bitcoin testnet.
    Testnet,
    /// Bitcoin signet.
    Signet,
    /// Local regression test network.
    Regtest,
}

impl Chain {
    /// Name of the network subdirectory under the base path.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Signet => "signet",
            Self::Regtest => "regtest",
        }
    }

    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Self::Mainnet => bitcoin::Network::Bitcoin,
            Self::Testnet => bitcoin::Network::Testnet,
            Self::Signet => bitcoin::Network::Signet,
            Self::Regtest => bitcoin::Network::Regtest,
        }
    }
}

/// Parameters shared by every command opening the node.
#[derive(Debug, Clone, Parser)]
pub struct CommonParams {
    /// Specify the chain.
    #[arg(long, value_name = "CHAIN", default_value = "mainnet")]
    pub chain: Chain,

    /// Specify custom base path.
    ///
    /// The data of each chain lives in its own subdirectory.
    #[arg(long, short = 'd', value_name = "PATH")]
    pub base_path: Option<PathBuf>,

    /// Maintain the index of confirmed transactions by txid.
    #[arg(long)]
    pub txindex: bool,

    /// Memory ceiling of the UTXO cache in MiB.
    #[arg(long, value_name = "MiB", default_value_t = 450)]
    pub dbcache: usize,

    /// Trust every input script.
    ///
    /// Only meant for benchmarking and importing a chain known to be valid.
    #[arg(long)]
    pub no_script_verification: bool,

    /// Number of script verification workers, `0` uses every CPU.
    #[arg(long, default_value_t = 0)]
    pub script_threads: usize,

    /// Free space in MiB required on the data directory filesystem at startup.
    ///
    /// `0` disables the check.
    #[arg(long, value_name = "MiB", default_value_t = 50)]
    pub db_storage_threshold: u64,
}

impl CommonParams {
    pub fn data_dir(&self) -> PathBuf {
        self.base_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(".oxnode"))
            .join(self.chain.dir_name())
    }

    pub fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig::new(self.data_dir(), self.chain.bitcoin_network());
        config.txindex = self.txindex;
        config.coins_cache_size = self.dbcache * 1024 * 1024;
        config.verify_scripts = !self.no_script_verification;
        config.script_threads = self.script_threads;
        config.min_free_disk_space = self.db_storage_threshold * 1024 * 1024;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_is_per_chain() {
        let params = CommonParams::parse_from(["oxnode", "--chain", "regtest", "-d", "/tmp/ox", "--dbcache", "16"]);
        let config = params.node_config();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/ox/regtest"));
        assert_eq!(config.network, bitcoin::Network::Regtest);
        assert_eq!(config.coins_cache_size, 16 * 1024 * 1024);
        assert!(config.verify_scripts);
        assert!(!config.txindex);
        assert_eq!(config.min_free_disk_space, crate::DEFAULT_MIN_FREE_DISK_SPACE);

        let params = CommonParams::parse_from(["oxnode", "--db-storage-threshold", "0"]);
        assert_eq!(params.node_config().min_free_disk_space, 0);
    }
}
