use crate::resources::Resource;
use std::path::PathBuf;

/// Failure to bring up a [`crate::Node`].
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to create data directory {path}: {err}")]
    DataDir {
        path: PathBuf,
        err: std::io::Error,
    },
    #[error("Insufficient {resource}: {available} available, {required} required")]
    InsufficientResources {
        resource: Resource,
        available: u64,
        required: u64,
    },
    #[error("Failed to load the chain state: {0}")]
    ChainState(#[from] oxnode_chain::Error),
    #[error("Reindex failed: {0}")]
    Reindex(oxnode_chain::Error),
    #[error("Corrupted block database detected, restart with reindex: {0}")]
    Verification(oxnode_chain::Error),
    #[error("Interrupted by shutdown")]
    Interrupted,
}

/// Errors of the node operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Chain(#[from] oxnode_chain::Error),
    #[error(transparent)]
    Mempool(#[from] oxnode_mempool::MempoolError),
    #[error(transparent)]
    BlockStore(#[from] oxnode_blockstore::Error),
    #[error(transparent)]
    Coins(#[from] oxnode_coins::Error),
    #[error("Invalid hex data: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Failed to decode {what}: {err}")]
    Decode {
        what: &'static str,
        err: bitcoin::consensus::encode::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
