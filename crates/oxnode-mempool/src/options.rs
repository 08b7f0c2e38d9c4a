use crate::types::FeeRate;
use std::time::Duration;

/// Configuration options for the transaction memory pool.
#[derive(Clone, Debug)]
pub struct MempoolOptions {
    /// Maximum size of the mempool in MB (default: 300)
    pub max_size_mb: usize,

    /// Number of hours to keep transactions in the mempool
    pub expiry_hours: u32,

    /// Minimum fee rate for a transaction to be accepted
    pub min_relay_fee_rate: FeeRate,

    /// Fee rate added to the rate of evicted packages when raising the
    /// rolling minimum fee
    pub incremental_relay_fee_rate: FeeRate,

    /// Highest fee rate accepted unless the caller allows high fees
    pub max_fee_rate: FeeRate,

    /// Script verification flags applied to mempool transactions
    pub script_flags: u32,
}

impl Default for MempoolOptions {
    fn default() -> Self {
        Self {
            max_size_mb: 300,
            expiry_hours: 336,                       // 2 weeks
            min_relay_fee_rate: FeeRate(1000),       // 1 sat/byte
            incremental_relay_fee_rate: FeeRate(1000),
            max_fee_rate: FeeRate(10_000_000),       // 0.1 BTC/kvB
            script_flags: oxnode_primitives::script::flags::STANDARD,
        }
    }
}

impl MempoolOptions {
    /// Create new mempool options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for configuring mempool options
    pub fn builder() -> MempoolOptionsBuilder {
        MempoolOptionsBuilder::default()
    }

    /// Get the maximum size of the mempool in bytes
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_mb * 1_000_000
    }

    /// Get the expiry duration
    pub fn expiry_duration(&self) -> Duration {
        Duration::from_secs(self.expiry_hours as u64 * 3600)
    }
}

/// Builder pattern for MempoolOptions
#[derive(Default)]
pub struct MempoolOptionsBuilder {
    options: MempoolOptions,
}

impl MempoolOptionsBuilder {
    /// Set maximum size of the mempool in MB
    pub fn max_size_mb(mut self, size: usize) -> Self {
        self.options.max_size_mb = size;
        self
    }

    /// Set minimum relay fee rate
    pub fn min_relay_fee_rate(mut self, rate: FeeRate) -> Self {
        self.options.min_relay_fee_rate = rate;
        self
    }

    /// Set expiry time in hours
    pub fn expiry_hours(mut self, hours: u32) -> Self {
        self.options.expiry_hours = hours;
        self
    }

    pub fn max_fee_rate(mut self, rate: FeeRate) -> Self {
        self.options.max_fee_rate = rate;
        self
    }

    pub fn script_flags(mut self, flags: u32) -> Self {
        self.options.script_flags = flags;
        self
    }

    /// Build the final MempoolOptions
    pub fn build(self) -> MempoolOptions {
        self.options
    }
}
