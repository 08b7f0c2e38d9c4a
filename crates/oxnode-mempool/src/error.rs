use bitcoin::{Amount, Txid};

/// Errors that can occur when validating or managing mempool transactions.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("Transaction already in mempool")]
    AlreadyInMempool,

    #[error("Transaction outputs already exist in the UTXO set")]
    AlreadyConfirmed,

    #[error("Coinbase transaction not allowed")]
    Coinbase,

    #[error("Missing inputs: {parents:?}")]
    MissingInputs { parents: Vec<Txid> },

    #[error("Transaction conflicts with mempool transaction {0}")]
    Conflict(Txid),

    #[error("Fee rate {actual_kvb} sat/kvB too low (min: {min_kvb})")]
    InsufficientFee { min_kvb: u64, actual_kvb: u64 },

    #[error("Mempool is full")]
    MempoolFull,

    #[error("Non-final transaction")]
    NonFinal,

    #[error("Transaction spends immature coinbase output")]
    PrematureCoinbaseSpend,

    #[error("Absurdly high fee {fee} (max: {max})")]
    AbsurdFee { fee: Amount, max: Amount },

    #[error("Script validation failed: {0}")]
    ScriptValidationFailed(String),

    #[error("Overflow in input values")]
    InputValueOverflow,

    #[error("Negative fee")]
    NegativeFee,

    #[error(transparent)]
    Sanity(#[from] oxnode_primitives::consensus::TxError),

    #[error(transparent)]
    Storage(#[from] oxnode_coins::Error),
}
