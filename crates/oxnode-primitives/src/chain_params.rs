use crate::COINBASE_MATURITY;
use crate::script::flags;
use bitcoin::consensus::Params;
use bitcoin::{Amount, BlockHash, Network};
use std::collections::HashMap;

/// Statistics about the transaction count of a chain, used to estimate the
/// verification progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainTxData {
    /// UNIX timestamp of the last known number of transactions.
    pub time: u64,
    /// Total number of transactions between genesis and that timestamp.
    pub tx_count: u64,
    /// Estimated number of transactions per second after that timestamp.
    pub tx_rate: f64,
}

/// Extended [`Params`].
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Chain params defined in rust-bitcoin.
    pub params: Params,
    /// Block height at which CSV becomes active.
    pub csv_height: u32,
    /// Block height at which Segwit becomes active.
    pub segwit_height: u32,
    /// Number of blocks between subsidy halvings.
    pub subsidy_halving_interval: u32,
    /// Confirmations required before a coinbase output becomes spendable.
    pub coinbase_maturity: u32,
    /// Blocks whose script verification flags deviate from the height based rules.
    pub script_flag_exceptions: HashMap<BlockHash, u32>,
    /// Blocks allowed to overwrite unspent outputs of an earlier transaction.
    pub bip30_exceptions: Vec<(u32, BlockHash)>,
    /// Transaction count statistics.
    pub chain_tx_data: ChainTxData,
}

fn block_hash(hex: &str) -> BlockHash {
    hex.parse().expect("Hardcoded block hash must be valid; qed")
}

impl ChainParams {
    /// Constructs a new instance of [`ChainParams`].
    // https://github.com/bitcoin/bitcoin/blob/6f9db1ebcab4064065ccd787161bf2b87e03cc1f/src/kernel/chainparams.cpp#L71
    pub fn new(network: Network) -> Self {
        let params = Params::new(network);
        match network {
            Network::Bitcoin => Self {
                params,
                csv_height: 419328, // 000000000000000004a1b34462cb8aeebd5799177f7a29cf28f2d1961716b5b5
                segwit_height: 481824, // 0000000000000000001c8018d9cb3b742ef25114f27563e3fc4a1902167f9893
                subsidy_halving_interval: 210_000,
                coinbase_maturity: COINBASE_MATURITY,
                script_flag_exceptions: HashMap::from([
                    (
                        block_hash(
                            "00000000000002dc756eebf4f49723ed8d30cc28a5f108eb94b1ba88ac4f9c22",
                        ),
                        flags::NONE,
                    ),
                    (
                        block_hash(
                            "0000000000000000000f14c35b2d841e986ab5441de8c585d5ffe55ea1e395ad",
                        ),
                        flags::P2SH | flags::WITNESS,
                    ),
                ]),
                bip30_exceptions: vec![
                    (
                        91842,
                        block_hash(
                            "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
                        ),
                    ),
                    (
                        91880,
                        block_hash(
                            "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
                        ),
                    ),
                ],
                chain_tx_data: ChainTxData {
                    time: 1681542696,
                    tx_count: 820876044,
                    tx_rate: 3.672283614033389,
                },
            },
            Network::Testnet => Self {
                params,
                csv_height: 770112, // 00000000025e930139bac5c6c31a403776da130831ab85be56578f3fa75369bb
                segwit_height: 834624, // 00000000002b980fcd729daaa248fd9316a5200e9b367f4ff2c42453e84201ca
                subsidy_halving_interval: 210_000,
                coinbase_maturity: COINBASE_MATURITY,
                script_flag_exceptions: HashMap::new(),
                bip30_exceptions: Vec::new(),
                chain_tx_data: ChainTxData {
                    time: 1681127428,
                    tx_count: 65345929,
                    tx_rate: 0.09611801281396926,
                },
            },
            Network::Signet => Self {
                params,
                csv_height: 1,
                segwit_height: 1,
                subsidy_halving_interval: 210_000,
                coinbase_maturity: COINBASE_MATURITY,
                script_flag_exceptions: HashMap::new(),
                bip30_exceptions: Vec::new(),
                chain_tx_data: ChainTxData {
                    time: 1681127428,
                    tx_count: 2226359,
                    tx_rate: 0.006424463050600656,
                },
            },
            _ => Self {
                params,
                csv_height: 1,    // Always active unless overridden
                segwit_height: 0, // Always active unless overridden
                subsidy_halving_interval: 150,
                coinbase_maturity: COINBASE_MATURITY,
                script_flag_exceptions: HashMap::new(),
                bip30_exceptions: Vec::new(),
                chain_tx_data: ChainTxData::default(),
            },
        }
    }

    /// Returns the network of this chain.
    pub fn network(&self) -> Network {
        self.params.network
    }

    /// Returns the block subsidy at given height.
    // https://github.com/bitcoin/bitcoin/blob/6f9db1ebcab4064065ccd787161bf2b87e03cc1f/src/validation.cpp#L1807
    pub fn block_subsidy(&self, height: u32) -> Amount {
        let halvings = height / self.subsidy_halving_interval;
        // Force block reward to zero when right shift is undefined.
        if halvings >= 64 {
            return Amount::ZERO;
        }
        Amount::from_sat((50 * Amount::ONE_BTC.to_sat()) >> halvings)
    }

    /// Returns whether the block at given height is allowed to overwrite
    /// existing unspent outputs.
    pub fn is_bip30_exception(&self, height: u32, hash: &BlockHash) -> bool {
        self.bip30_exceptions
            .iter()
            .any(|(h, exception)| *h == height && exception == hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsidy_halves_every_interval() {
        let params = ChainParams::new(Network::Bitcoin);
        assert_eq!(params.block_subsidy(0), Amount::from_sat(5_000_000_000));
        assert_eq!(params.block_subsidy(209_999), Amount::from_sat(5_000_000_000));
        assert_eq!(params.block_subsidy(210_000), Amount::from_sat(2_500_000_000));
        assert_eq!(params.block_subsidy(840_000), Amount::from_sat(312_500_000));
        assert_eq!(params.block_subsidy(64 * 210_000), Amount::ZERO);

        let regtest = ChainParams::new(Network::Regtest);
        assert_eq!(regtest.block_subsidy(150), Amount::from_sat(2_500_000_000));
    }

    #[test]
    fn bip30_exceptions_match_height_and_hash() {
        let params = ChainParams::new(Network::Bitcoin);
        let hash = params.bip30_exceptions[0].1;
        assert!(params.is_bip30_exception(91842, &hash));
        assert!(!params.is_bip30_exception(91843, &hash));
    }
}
