use crate::cli::CliResult;
use crate::cli::params::CommonParams;
use crate::commands::import_blocks::ctrlc_flag;
use crate::node::Node;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Rebuild the block index and the UTXO set from the block files on disk.
///
/// An interrupted reindex resumes on the next start.
#[derive(clap::Parser, Debug, Clone)]
pub struct Reindex {
    #[allow(missing_docs)]
    #[clap(flatten)]
    pub common_params: CommonParams,
}

impl Reindex {
    pub fn execute(self) -> CliResult {
        let mut config = self.common_params.node_config();
        config.reindex = true;

        let shutdown = Arc::new(AtomicBool::new(false));
        ctrlc_flag(&shutdown);

        let node = Node::open_with_shutdown(config, shutdown)?;

        match node.best_block() {
            Some(tip) => tracing::info!("Reindexed up to #{} ({})", tip.number, tip.hash),
            None => tracing::info!("Reindex finished, no block connected"),
        }

        node.close()?;

        Ok(())
    }
}
