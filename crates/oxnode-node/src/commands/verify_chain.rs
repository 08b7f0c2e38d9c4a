use crate::cli::CliResult;
use crate::cli::params::CommonParams;
use crate::node::Node;

/// Check that the most recent blocks can be disconnected with their undo data.
#[derive(clap::Parser, Debug, Clone)]
pub struct VerifyChain {
    /// Number of blocks below the tip to check, `0` checks the whole chain.
    #[clap(long, default_value_t = 288)]
    pub depth: u32,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub common_params: CommonParams,
}

impl VerifyChain {
    pub fn execute(self) -> CliResult {
        let mut config = self.common_params.node_config();
        config.check_blocks = if self.depth == 0 { u32::MAX } else { self.depth };

        // Opening the node runs the check and fails on any inconsistency.
        let node = Node::open(config)?;

        tracing::info!("Chain state is consistent, tip at #{}", node.get_chain_height());

        node.close()?;

        Ok(())
    }
}
