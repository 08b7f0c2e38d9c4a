use crate::cli::params::CommonParams;
use crate::cli::{CliError, CliResult};
use crate::node::{BlockRef, Node};
use bitcoin::{BlockHash, Txid};
use std::path::PathBuf;

/// Handles both file paths and raw block data in hex format.
fn parse_raw_block(input: &str) -> Result<String, String> {
    let path = PathBuf::from(input);

    if path.is_file() {
        std::fs::read_to_string(&path)
            .map(|data| data.trim().to_string())
            .map_err(|err| format!("Failed to read block data from {}: {err}", path.display()))
    } else {
        Ok(input.to_string())
    }
}

/// Block hash or height.
fn parse_block_ref(input: &str) -> Result<BlockRef, String> {
    if let Ok(height) = input.parse::<u32>() {
        return Ok(BlockRef::Height(height));
    }
    input
        .parse::<BlockHash>()
        .map(BlockRef::Hash)
        .map_err(|err| format!("Neither a height nor a block hash: {err}"))
}

/// Blockchain.
#[derive(Debug, clap::Subcommand)]
pub enum Blockchain {
    /// Hash and height of the best block.
    #[command(name = "getbestblock")]
    GetBestBlock {
        #[allow(missing_docs)]
        #[clap(flatten)]
        common_params: CommonParams,
    },

    /// Raw block in hex.
    #[command(name = "getblock")]
    GetBlock {
        /// Block hash or height in the active chain.
        #[clap(value_parser = parse_block_ref)]
        block: BlockRef,

        #[allow(missing_docs)]
        #[clap(flatten)]
        common_params: CommonParams,
    },

    /// Index entry of a block.
    #[command(name = "getblockheader")]
    GetBlockHeader {
        hash: BlockHash,

        #[allow(missing_docs)]
        #[clap(flatten)]
        common_params: CommonParams,
    },

    /// Raw confirmed transaction in hex.
    #[command(name = "getrawtransaction")]
    GetRawTransaction {
        txid: Txid,

        #[allow(missing_docs)]
        #[clap(flatten)]
        common_params: CommonParams,
    },

    /// Whether an output is missing from the UTXO set.
    #[command(name = "isspent")]
    IsSpent {
        txid: Txid,
        vout: u32,

        #[allow(missing_docs)]
        #[clap(flatten)]
        common_params: CommonParams,
    },

    /// Chain height, sync state and verification progress.
    #[command(name = "getsyncstatus")]
    GetSyncStatus {
        #[allow(missing_docs)]
        #[clap(flatten)]
        common_params: CommonParams,
    },

    /// Fee rate in sat/kvB for confirmation within `target` blocks.
    #[command(name = "estimatefee")]
    EstimateFee {
        #[clap(default_value_t = 6)]
        target: usize,

        #[allow(missing_docs)]
        #[clap(flatten)]
        common_params: CommonParams,
    },

    /// Validate and store a block.
    #[command(name = "submitblock")]
    SubmitBlock {
        /// The raw block data in hex or a path containing it.
        #[clap(value_parser = parse_raw_block)]
        block: String,

        #[allow(missing_docs)]
        #[clap(flatten)]
        common_params: CommonParams,
    },
}

impl Blockchain {
    fn common_params(&self) -> &CommonParams {
        match self {
            Self::GetBestBlock { common_params }
            | Self::GetBlock { common_params, .. }
            | Self::GetBlockHeader { common_params, .. }
            | Self::GetRawTransaction { common_params, .. }
            | Self::IsSpent { common_params, .. }
            | Self::GetSyncStatus { common_params }
            | Self::EstimateFee { common_params, .. }
            | Self::SubmitBlock { common_params, .. } => common_params,
        }
    }

    pub fn execute(self) -> CliResult {
        let mut config = self.common_params().node_config();
        // Queries do not need to re-check the chain.
        config.check_blocks = 0;

        let node = Node::open(config)?;

        let result = self.query(&node);

        node.close()?;

        result
    }

    fn query(self, node: &Node) -> CliResult {
        match self {
            Self::GetBestBlock { .. } => match node.best_block() {
                Some(tip) => println!("{} {}", tip.number, tip.hash),
                None => println!("No block"),
            },
            Self::GetBlock { block, .. } => match node.get_block(block)? {
                Some(bytes) => println!("{}", hex::encode(bytes)),
                None => return Err(CliError::InvalidArgument(format!("Block {block:?} not found"))),
            },
            Self::GetBlockHeader { hash, .. } => match node.get_block_index_info(&hash) {
                Some(info) => {
                    println!("height: {}", info.height);
                    println!("chainwork: {}", info.chain_work);
                    if let Some(previous_hash) = info.previous_hash {
                        println!("previousblockhash: {previous_hash}");
                    }
                }
                None => return Err(CliError::InvalidArgument(format!("Block {hash} not found"))),
            },
            Self::GetRawTransaction { txid, .. } => match node.get_transaction(&txid, false)? {
                Some(info) => {
                    println!("{}", hex::encode(info.raw_bytes()));
                    if let Some(confirmed) = info.confirmed {
                        println!("block: {} at #{}", confirmed.block_hash, confirmed.height);
                    }
                }
                None => {
                    return Err(CliError::InvalidArgument(format!(
                        "Transaction {txid} not found, enable --txindex to look up spent transactions"
                    )));
                }
            },
            Self::IsSpent { txid, vout, .. } => {
                // The mempool is not persisted, an offline node has no spends to add.
                println!("{}", node.is_output_spent(txid, vout, false)?);
            }
            Self::GetSyncStatus { .. } => {
                println!("height: {}", node.get_chain_height());
                println!("synced: {}", node.is_synced());
                println!("progress: {:.6}", node.get_sync_progress());
            }
            Self::EstimateFee { target, .. } => {
                println!("{}", node.estimate_fee(target));
            }
            Self::SubmitBlock { block, .. } => {
                let bytes = hex::decode(block.trim()).map_err(crate::error::Error::from)?;
                let status = node.submit_block(&bytes)?;
                println!("{status:?}");
            }
        }

        Ok(())
    }
}
