use crate::cli::CliResult;
use crate::cli::params::CommonParams;
use crate::config::DEFAULT_CHECK_BLOCKS;
use crate::events::NodeEvent;
use crate::maintenance::{MaintenanceConfig, spawn_maintenance};
use crate::node::Node;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// The `run` command used to run the node.
#[derive(Debug, Clone, Parser)]
pub struct Run {
    /// Maximum size of the mempool in MB.
    #[clap(long, default_value_t = 300)]
    pub max_mempool: usize,

    /// Hours a transaction may stay in the mempool.
    #[clap(long, default_value_t = 336)]
    pub mempool_expiry: u32,

    /// Rebuild the block index and the UTXO set before starting.
    #[clap(long)]
    pub reindex: bool,

    /// Number of recent blocks checked at startup.
    #[clap(long, default_value_t = DEFAULT_CHECK_BLOCKS)]
    pub check_blocks: u32,

    /// Import the Bitcoin Core block files of this directory after startup.
    #[clap(long, value_name = "PATH")]
    pub load_blocks: Option<PathBuf>,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub common_params: CommonParams,
}

impl Run {
    pub fn execute(self) -> CliResult {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("oxnode-worker")
            .enable_all()
            .build()?;
        runtime.block_on(self.run_until_exit())
    }

    async fn run_until_exit(self) -> CliResult {
        let mut config = self.common_params.node_config();
        config.mempool_max_size_mb = self.max_mempool;
        config.mempool_expiry_hours = self.mempool_expiry;
        config.reindex = self.reindex;
        config.check_blocks = self.check_blocks;

        let shutdown = Arc::new(AtomicBool::new(false));
        let exit = Arc::new(Notify::new());

        tokio::spawn({
            let shutdown = shutdown.clone();
            let exit = exit.clone();
            async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for ctrl-c: {err}");
                    return;
                }
                tracing::info!("Received ctrl-c, shutting down");
                shutdown.store(true, Ordering::Relaxed);
                exit.notify_one();
            }
        });

        tracing::info!("💾 Data directory: {}", config.data_dir.display());

        let node = tokio::task::spawn_blocking({
            let shutdown = shutdown.clone();
            move || Node::open_with_shutdown(config, shutdown)
        })
        .await
        .map_err(std::io::Error::other)??;

        let node = Arc::new(node);

        let maintenance = spawn_maintenance(node.clone(), MaintenanceConfig::default())?;

        tokio::spawn(log_events(node.subscribe()));

        if let Some(dir) = self.load_blocks {
            let node = node.clone();
            tokio::task::spawn_blocking(move || {
                let shutdown = node.shutdown_flag();
                if let Err(err) = node.import_block_files(&dir, &shutdown) {
                    tracing::error!(dir = %dir.display(), "Failed to import block files: {err}");
                }
            });
        }

        exit.notified().await;

        node.request_shutdown();
        tokio::task::spawn_blocking(move || {
            if maintenance.join().is_err() {
                tracing::error!("Maintenance thread panicked");
            }
        })
        .await
        .map_err(std::io::Error::other)?;

        // The importer may still hold a handle, flush instead of consuming the node.
        tokio::task::spawn_blocking(move || node.flush())
            .await
            .map_err(std::io::Error::other)??;

        tracing::info!("Node state flushed, shutting down");

        Ok(())
    }
}

async fn log_events(events: async_channel::Receiver<NodeEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            NodeEvent::ChainTipChanged { hash, height } => {
                tracing::info!("✨ New best block #{height} ({hash})");
            }
            NodeEvent::BlockDisconnected { hash, height } => {
                tracing::info!("↩️  Disconnected block #{height} ({hash})");
            }
            NodeEvent::BlockConnected { hash, height } => {
                tracing::debug!(%hash, height, "Connected block");
            }
            NodeEvent::TransactionAccepted { txid } => {
                tracing::debug!(%txid, "Accepted transaction");
            }
        }
    }
}
