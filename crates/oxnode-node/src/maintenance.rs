use crate::node::Node;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often the maintenance thread checks the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Intervals of the background maintenance tasks.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
    /// Periodic chain state flush and mempool expiry.
    pub maintain_interval: Duration,
    pub fee_estimates_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            maintain_interval: Duration::from_secs(60),
            fee_estimates_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Spawns the thread flushing the chain state, expiring mempool entries and
/// saving fee estimates until the node shuts down.
pub fn spawn_maintenance(node: Arc<Node>, config: MaintenanceConfig) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("oxnode-maintenance".to_string())
        .spawn(move || {
            let mut last_maintain = Instant::now();
            let mut last_fee_estimates = Instant::now();

            while !node.is_shutting_down() {
                std::thread::sleep(POLL_INTERVAL);

                if last_maintain.elapsed() >= config.maintain_interval {
                    if let Err(err) = node.maintain() {
                        tracing::error!("Periodic maintenance failed: {err}");
                    }
                    last_maintain = Instant::now();
                }

                if last_fee_estimates.elapsed() >= config.fee_estimates_interval {
                    node.write_fee_estimates();
                    last_fee_estimates = Instant::now();
                }
            }

            tracing::debug!("Maintenance thread stopped");
        })
}
