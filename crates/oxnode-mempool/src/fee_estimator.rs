//! Fee estimation from the confirmation times of mempool transactions.
//!
//! Transactions are grouped into exponentially spaced fee rate buckets. For
//! every bucket and every confirmation target `k` the estimator keeps an
//! exponentially decayed count of transactions that confirmed within `k`
//! blocks of entering the mempool, together with the decayed count of all
//! transactions that confirmed in the bucket. Transactions that are still
//! waiting for longer than `k` blocks count as failures for target `k`.

use crate::types::FeeRate;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Name of the file the estimator state is persisted to.
pub const FEE_ESTIMATES_FILENAME: &str = "fee_estimates.dat";

const FILE_VERSION: u32 = 1;

/// Tunable parameters of the [`FeeEstimator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeEstimatorConfig {
    /// Highest confirmation target that can be estimated.
    pub max_target: usize,
    /// Factor applied to all counters once per block.
    pub decay: f64,
    /// Minimum share of transactions in a bucket range that must confirm
    /// within the target for the range to pass.
    pub success_threshold: f64,
    /// Decayed number of data points a bucket range needs before its
    /// success ratio is evaluated.
    pub sufficient_txs: f64,
    /// Upper bound of the lowest bucket.
    pub min_bucket_fee_rate: f64,
    /// Upper bound of the highest finite bucket.
    pub max_bucket_fee_rate: f64,
    /// Ratio between the bounds of two adjacent buckets.
    pub bucket_spacing: f64,
}

impl Default for FeeEstimatorConfig {
    fn default() -> Self {
        Self {
            max_target: 25,
            decay: 0.998,
            success_threshold: 0.85,
            // One transaction per block in the range on average.
            sufficient_txs: 1.0 / (1.0 - 0.998),
            min_bucket_fee_rate: 1000.0,
            max_bucket_fee_rate: 10_000_000.0,
            bucket_spacing: 1.1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EstimatorError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to decode fee estimates: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Fee estimates file version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("Fee estimates were written with different parameters")]
    ConfigMismatch,
}

#[derive(Debug, Clone, Copy)]
struct TrackedTx {
    entry_height: u32,
    bucket: usize,
}

#[derive(Serialize, Deserialize)]
struct EstimatorSnapshot {
    version: u32,
    config: FeeEstimatorConfig,
    best_height: u32,
    confirmed: Vec<Vec<f64>>,
    total: Vec<f64>,
    fee_sum: Vec<f64>,
}

/// Decaying histogram of confirmation delays bucketed by fee rate.
#[derive(Debug, Clone)]
pub struct FeeEstimator {
    config: FeeEstimatorConfig,
    /// Upper bound of every bucket, the last one is unbounded.
    buckets: Vec<f64>,
    /// `confirmed[k - 1][bucket]`: transactions confirmed within `k` blocks.
    confirmed: Vec<Vec<f64>>,
    /// Transactions confirmed in the bucket, regardless of the delay.
    total: Vec<f64>,
    /// Sum of the fee rates of the confirmed transactions in the bucket.
    fee_sum: Vec<f64>,
    /// Mempool transactions waiting for confirmation.
    tracked: HashMap<Txid, TrackedTx>,
    best_height: u32,
}

impl Default for FeeEstimator {
    fn default() -> Self {
        Self::new(FeeEstimatorConfig::default())
    }
}

impl FeeEstimator {
    pub fn new(config: FeeEstimatorConfig) -> Self {
        let buckets = build_buckets(&config);
        let n = buckets.len();
        Self {
            confirmed: vec![vec![0.0; n]; config.max_target],
            total: vec![0.0; n],
            fee_sum: vec![0.0; n],
            tracked: HashMap::new(),
            best_height: 0,
            buckets,
            config,
        }
    }

    pub fn config(&self) -> &FeeEstimatorConfig {
        &self.config
    }

    /// Height of the last block processed.
    pub fn best_height(&self) -> u32 {
        self.best_height
    }

    /// Number of mempool transactions being tracked.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    fn bucket_index(&self, fee_rate: f64) -> usize {
        self.buckets
            .iter()
            .position(|upper| fee_rate <= *upper)
            .unwrap_or(self.buckets.len() - 1)
    }

    /// Starts tracking a transaction that entered the mempool at `height`.
    pub fn process_transaction(&mut self, txid: Txid, height: u32, fee_rate: FeeRate) {
        // Skip transactions accepted while the estimator lags behind the chain,
        // their confirmation delay would be meaningless.
        if height < self.best_height {
            return;
        }
        let bucket = self.bucket_index(fee_rate.as_sat_per_kvb() as f64);
        self.tracked.insert(
            txid,
            TrackedTx {
                entry_height: height,
                bucket,
            },
        );
    }

    /// Stops tracking a transaction that left the mempool without being mined.
    pub fn remove_transaction(&mut self, txid: &Txid) -> bool {
        self.tracked.remove(txid).is_some()
    }

    /// Records the confirmation of the tracked transactions in `confirmed`
    /// by the block at `height`.
    ///
    /// Blocks at or below the last processed height are ignored, which skips
    /// blocks connected again during a reorg.
    pub fn process_block<'a>(
        &mut self,
        height: u32,
        confirmed: impl IntoIterator<Item = (&'a Txid, FeeRate)>,
    ) {
        if height <= self.best_height {
            for (txid, _) in confirmed {
                self.tracked.remove(txid);
            }
            return;
        }
        self.best_height = height;

        let decay = self.config.decay;
        for row in self.confirmed.iter_mut() {
            row.iter_mut().for_each(|v| *v *= decay);
        }
        self.total.iter_mut().for_each(|v| *v *= decay);
        self.fee_sum.iter_mut().for_each(|v| *v *= decay);

        let mut counted = 0usize;
        for (txid, fee_rate) in confirmed {
            let Some(tracked) = self.tracked.remove(txid) else {
                continue;
            };
            if height <= tracked.entry_height {
                continue;
            }
            let blocks_to_confirm = (height - tracked.entry_height) as usize;
            let bucket = tracked.bucket;
            for row in self.confirmed.iter_mut().skip(blocks_to_confirm - 1) {
                row[bucket] += 1.0;
            }
            self.total[bucket] += 1.0;
            self.fee_sum[bucket] += fee_rate.as_sat_per_kvb() as f64;
            counted += 1;
        }

        tracing::trace!(height, counted, tracked = self.tracked.len(), "Fee estimator processed block");
    }

    /// Unconfirmed transactions per bucket that have been waiting for at
    /// least `target` blocks.
    fn waiting(&self, target: usize) -> Vec<f64> {
        let mut waiting = vec![0.0; self.buckets.len()];
        for tx in self.tracked.values() {
            let waited = self.best_height.saturating_sub(tx.entry_height) as usize;
            if waited >= target {
                waiting[tx.bucket] += 1.0;
            }
        }
        waiting
    }

    /// Estimate for exactly `target` blocks, not clamped against lower targets.
    fn estimate_raw(&self, target: usize) -> Option<f64> {
        if target == 0 || target > self.config.max_target {
            return None;
        }
        let confirmed = &self.confirmed[target - 1];
        let waiting = self.waiting(target);

        let mut best_range = None;
        let mut range_end = self.buckets.len() - 1;
        let (mut conf, mut total, mut extra) = (0.0, 0.0, 0.0);

        // Walk from the most expensive bucket down, grouping buckets until
        // the group holds enough data points, and stop at the first group
        // failing the success threshold.
        for bucket in (0..self.buckets.len()).rev() {
            conf += confirmed[bucket];
            total += self.total[bucket];
            extra += waiting[bucket];

            if total + extra >= self.config.sufficient_txs {
                if conf / (total + extra) < self.config.success_threshold {
                    break;
                }
                best_range = Some((bucket, range_end));
                conf = 0.0;
                total = 0.0;
                extra = 0.0;
                range_end = bucket.saturating_sub(1);
            }
        }

        let (start, end) = best_range?;
        let range_total: f64 = self.total[start..=end].iter().sum();
        if range_total <= 0.0 {
            return None;
        }

        let mut cumulative = 0.0;
        for bucket in start..=end {
            cumulative += self.total[bucket];
            if cumulative >= range_total / 2.0 && self.total[bucket] > 0.0 {
                return Some(self.fee_sum[bucket] / self.total[bucket]);
            }
        }
        None
    }

    /// Returns the fee rate needed to confirm within `target` blocks, `None`
    /// if there is not enough data.
    ///
    /// The result never increases with the target: a rate that confirms
    /// within `k` blocks also confirms within any `k' > k`.
    pub fn estimate_fee(&self, target: usize) -> Option<FeeRate> {
        let target = target.min(self.config.max_target);
        (1..=target)
            .filter_map(|k| self.estimate_raw(k))
            .min_by(|a, b| a.total_cmp(b))
            .map(|rate| FeeRate(rate.round() as u64))
    }

    /// Writes the histogram to `path`, replacing any previous file.
    pub fn write_to(&self, path: &Path) -> Result<(), EstimatorError> {
        let snapshot = EstimatorSnapshot {
            version: FILE_VERSION,
            config: self.config.clone(),
            best_height: self.best_height,
            confirmed: self.confirmed.clone(),
            total: self.total.clone(),
            fee_sum: self.fee_sum.clone(),
        };

        let tmp = path.with_extension("new");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, &snapshot)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;

        Ok(())
    }

    /// Restores a histogram written by [`Self::write_to`].
    ///
    /// Tracked mempool transactions are not persisted.
    pub fn read_from(path: &Path, config: FeeEstimatorConfig) -> Result<Self, EstimatorError> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: EstimatorSnapshot = bincode::deserialize_from(reader)?;

        if snapshot.version != FILE_VERSION {
            return Err(EstimatorError::UnsupportedVersion(snapshot.version));
        }

        let mut estimator = Self::new(config);
        if snapshot.config != estimator.config
            || snapshot.total.len() != estimator.buckets.len()
            || snapshot.confirmed.len() != estimator.config.max_target
        {
            return Err(EstimatorError::ConfigMismatch);
        }

        estimator.best_height = snapshot.best_height;
        estimator.confirmed = snapshot.confirmed;
        estimator.total = snapshot.total;
        estimator.fee_sum = snapshot.fee_sum;

        Ok(estimator)
    }
}

fn build_buckets(config: &FeeEstimatorConfig) -> Vec<f64> {
    let mut buckets = Vec::new();
    let mut bound = config.min_bucket_fee_rate;
    while bound <= config.max_bucket_fee_rate {
        buckets.push(bound);
        bound *= config.bucket_spacing;
    }
    buckets.push(f64::INFINITY);
    buckets
}
