//! Core type definitions for the mempool.

use bitcoin::{Amount, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Fee rate in satoshis per virtual kilobyte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    pub const ZERO: Self = Self(0);

    /// Create fee rate from satoshis per virtual byte.
    pub fn from_sat_per_vb(sat_vb: u64) -> Self {
        Self(sat_vb.saturating_mul(1000))
    }

    /// Create fee rate from satoshis per kilovirtual byte.
    pub fn from_sat_per_kvb(sat_kvb: u64) -> Self {
        Self(sat_kvb)
    }

    /// Calculate fee rate from amount and vsize.
    ///
    /// A zero `vsize` is treated as one vbyte.
    pub fn from_amount_and_vsize(fee: Amount, vsize: u64) -> Self {
        let numerator = u128::from(fee.to_sat()) * 1000;
        let rate = numerator / u128::from(vsize.max(1));
        Self(u64::try_from(rate).unwrap_or(u64::MAX))
    }

    /// Get fee for given virtual size.
    pub fn get_fee(&self, vsize: u64) -> Amount {
        let fee = u128::from(self.0) * u128::from(vsize) / 1000;
        Amount::from_sat(u64::try_from(fee).unwrap_or(u64::MAX))
    }

    /// Get the fee rate in satoshis per kilovirtual byte.
    pub fn as_sat_per_kvb(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl std::fmt::Display for FeeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} sat/kvB", self.0)
    }
}

/// Reason for removing transactions from mempool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Included in a block.
    Block,
    /// Chain reorganization made the transaction invalid.
    Reorg,
    /// Conflicted with a transaction included in a block.
    Conflict,
    /// Evicted due to mempool size limit.
    SizeLimit,
    /// Expired (too old).
    Expiry,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Reorg => "reorg",
            Self::Conflict => "conflict",
            Self::SizeLimit => "sizelimit",
            Self::Expiry => "expiry",
        }
    }
}

/// Transaction in the mempool together with its admission metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Arc<Transaction>,
    pub txid: Txid,
    /// Fee paid by the transaction.
    pub fee: Amount,
    /// Serialized size including witness data.
    pub size: usize,
    /// Virtual size used for fee rate computations.
    pub vsize: u64,
    /// Unix time at which the transaction entered the mempool.
    pub time: u64,
    /// Chain height when the transaction entered the mempool.
    pub entry_height: u32,
    /// Coin age priority at entry: sum of input value times input age,
    /// divided by the transaction size.
    pub priority: f64,
    pub spends_coinbase: bool,
    /// In-mempool transactions this one spends from.
    pub(crate) parents: HashSet<Txid>,
    /// In-mempool transactions spending from this one.
    pub(crate) children: HashSet<Txid>,
}

impl MempoolEntry {
    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::from_amount_and_vsize(self.fee, self.vsize)
    }

    pub fn parents(&self) -> impl Iterator<Item = &Txid> {
        self.parents.iter()
    }

    pub fn children(&self) -> impl Iterator<Item = &Txid> {
        self.children.iter()
    }
}

/// Outcome of a successful [`crate::Mempool::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub txid: Txid,
    pub fee: Amount,
    pub vsize: u64,
}

/// Chain tip the mempool validates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipContext {
    pub height: u32,
    pub median_time_past: u32,
}

/// Summary of the mempool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolInfo {
    pub size: usize,
    pub bytes: usize,
    pub total_fee: Amount,
    pub max_bytes: usize,
    pub min_fee: FeeRate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_rate_conversions() {
        let rate = FeeRate::from_amount_and_vsize(Amount::from_sat(250), 250);
        assert_eq!(rate, FeeRate::from_sat_per_vb(1));
        assert_eq!(rate.get_fee(1000), Amount::from_sat(1000));
        assert_eq!(FeeRate(1500).get_fee(141), Amount::from_sat(211));
        assert_eq!(FeeRate::from_amount_and_vsize(Amount::from_sat(7), 0), FeeRate(7000));
    }
}
