use bitcoin::{Amount, BlockHash, CompactTarget, OutPoint, Txid};
use oxnode_primitives::consensus::TxError;
use oxnode_primitives::script::ScriptError;

/// Consensus failure of a block, the block is marked failed and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    /// Block's difficulty is invalid.
    #[error("Incorrect proof-of-work bits: {{ got: {got:?}, expected: {expected:?} }}")]
    BadDifficultyBits {
        got: CompactTarget,
        expected: CompactTarget,
    },
    /// Block's proof-of-work is invalid.
    #[error("Proof-of-work validation failed")]
    InvalidProofOfWork,
    /// Block's timestamp is too far in the future.
    #[error("Block time is too far in the future")]
    TooFarInFuture,
    /// Block's timestamp is too old.
    #[error("Time is the median time of last 11 blocks or before")]
    TimeTooOld,
    #[error("Parent block {0} is marked as failed")]
    FailedParent(BlockHash),
    #[error("Transaction list is empty")]
    EmptyTransactionList,
    #[error("First transaction is not coinbase")]
    FirstTransactionIsNotCoinbase,
    #[error("Block contains multiple coinbase transactions")]
    MultipleCoinbase,
    #[error("Block contains duplicate transaction at index {0}")]
    DuplicateTransaction(usize),
    #[error("Invalid merkle root")]
    BadMerkleRoot,
    #[error("Invalid witness commitment")]
    BadWitnessCommitment,
    #[error("Block weight exceeds the limit")]
    BadBlockWeight,
    #[error("Transaction {index} is invalid: {err}")]
    Transaction { index: usize, err: TxError },
    #[error("Transaction {0} is not final")]
    NonFinalTransaction(Txid),
    #[error("Coinbase does not commit to block height {0}")]
    BadCoinbaseHeight(u32),
    #[error("Output {out_point:?} spent by {txid} not found")]
    MissingInput { txid: Txid, out_point: OutPoint },
    #[error("Transaction {txid} spends immature coinbase output {out_point:?}")]
    PrematureCoinbaseSpend { txid: Txid, out_point: OutPoint },
    #[error("Input values of transaction {0} are out of range")]
    InputValuesOutOfRange(Txid),
    #[error("Total output amount of {0} exceeds total input amount")]
    InsufficientFunds(Txid),
    #[error("Transaction {0} overwrites unspent outputs")]
    Bip30(Txid),
    #[error("Coinbase pays {got} which exceeds the subsidy and fees of {max}")]
    InvalidBlockReward { got: Amount, max: Amount },
    #[error("Transaction {txid} failed script verification: {err}")]
    Script { txid: Txid, err: ScriptError },
}

/// Chain state error, anything that is not a consensus failure of a block.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    BlockStore(#[from] oxnode_blockstore::Error),
    #[error(transparent)]
    Index(#[from] oxnode_index::Error),
    #[error(transparent)]
    Coins(#[from] oxnode_coins::Error),
    #[error("Block {0} not found")]
    UnknownBlock(BlockHash),
    #[error("Data of block {0} is not available")]
    MissingBlockData(BlockHash),
    #[error("Undo data of block {0} is not available")]
    MissingUndoData(BlockHash),
    #[error("The genesis block can not be invalidated")]
    GenesisInvalidation,
    #[error("Chain state is corrupted: {0}")]
    Corruption(String),
    #[error("Failed to build the script verification pool: {0}")]
    ThreadPool(String),
    #[error("Interrupted by shutdown")]
    Interrupted,
}
