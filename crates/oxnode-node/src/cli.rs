pub mod params;

use crate::commands::blockchain::Blockchain;
use crate::commands::import_blocks::ImportBlocks;
use crate::commands::reindex::Reindex;
use crate::commands::run::Run;
use crate::commands::verify_chain::VerifyChain;
use crate::error::{Error, StartupError};
use clap::Parser;

/// Error returned by [`run`].
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Node(#[from] Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CliResult<T = ()> = std::result::Result<T, CliError>;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the node until interrupted.
    Run(Run),

    /// Import blocks from a directory of Bitcoin Core block files.
    ImportBlocks(ImportBlocks),

    /// Rebuild the block index and the UTXO set from the stored block files.
    Reindex(Reindex),

    /// Check the undo data of the most recent blocks.
    VerifyChain(VerifyChain),

    /// Blockchain queries.
    #[command(subcommand)]
    Blockchain(Blockchain),
}

/// Embedded Bitcoin block storage and validation engine.
#[derive(Debug, Parser)]
#[command(name = "oxnode", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Parse and run command line arguments
pub fn run() -> CliResult {
    let Cli { command } = Cli::parse();

    match command {
        Command::Run(run) => run.execute(),
        Command::ImportBlocks(import_blocks) => import_blocks.execute(),
        Command::Reindex(reindex) => reindex.execute(),
        Command::VerifyChain(verify_chain) => verify_chain.execute(),
        Command::Blockchain(blockchain) => blockchain.execute(),
    }
}
