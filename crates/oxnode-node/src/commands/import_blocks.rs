use crate::cli::CliResult;
use crate::cli::params::CommonParams;
use crate::node::Node;
use std::path::PathBuf;

/// Import Bitcoin blocks into the node.
#[derive(clap::Parser, Debug, Clone)]
pub struct ImportBlocks {
    /// Directory holding the `blk?????.dat` files.
    ///
    /// This is the `blocks` directory under the bitcoind data directory.
    #[clap(value_parser)]
    pub blocks_dir: PathBuf,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub common_params: CommonParams,
}

impl ImportBlocks {
    pub fn execute(self) -> CliResult {
        let node = Node::open(self.common_params.node_config())?;

        let shutdown = node.shutdown_flag();
        ctrlc_flag(&shutdown);

        let stats = node.import_block_files(&self.blocks_dir, &shutdown)?;

        if stats.interrupted {
            tracing::info!("Import interrupted at #{}", node.get_chain_height());
        }

        node.close()?;

        Ok(())
    }
}

/// Sets `flag` on ctrl-c, from a dedicated single threaded runtime.
pub(crate) fn ctrlc_flag(flag: &std::sync::Arc<std::sync::atomic::AtomicBool>) {
    let flag = flag.clone();
    let spawned = std::thread::Builder::new()
        .name("oxnode-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::warn!("Failed to start the signal handler: {err}");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received ctrl-c, stopping");
                    flag.store(true, std::sync::atomic::Ordering::Relaxed);
                }
            });
        });
    if let Err(err) = spawned {
        tracing::warn!("Failed to spawn the signal thread: {err}");
    }
}
