//! Consensus checks of headers and blocks that do not touch the UTXO set.

use crate::block_tree::{BlockId, BlockTree};
use crate::BlockError;
use bitcoin::consensus::Params;
use bitcoin::hashes::Hash;
use bitcoin::{Block, CompactTarget, TxMerkleNode, Txid};
use oxnode_primitives::consensus::{check_transaction_sanity, is_final};
use oxnode_primitives::{ChainParams, MAX_BLOCK_WEIGHT};
use std::collections::HashSet;

// 2 hours
const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Usually, it's just the target of last block. However, if we are in a retarget period,
/// it will be calculated from the last 2016 blocks (about two weeks for Bitcoin mainnet).
///
/// https://github.com/bitcoin/bitcoin/blob/89b910711c004c21b7d67baa888073742f7f94f0/src/pow.cpp#L13
pub fn get_next_work_required(
    tree: &BlockTree,
    parent: BlockId,
    header_time: u32,
    params: &Params,
) -> CompactTarget {
    let last = tree.entry(parent);

    if params.no_pow_retargeting {
        return last.header.bits;
    }

    let height = last.height + 1;
    let interval = params.difficulty_adjustment_interval() as u32;

    // Only change once per difficulty adjustment interval.
    if height % interval != 0 {
        if params.allow_min_difficulty_blocks {
            let pow_limit = params.max_attainable_target.to_compact_lossy();

            // A block more than twice the target spacing after its parent may
            // be mined at minimum difficulty.
            if header_time as u64 > last.header.time as u64 + params.pow_target_spacing * 2 {
                return pow_limit;
            }

            // Otherwise use the bits of the last block not mined under that rule.
            let mut walk = last;
            while let Some(parent) = walk.parent {
                if walk.height % interval == 0 || walk.header.bits != pow_limit {
                    break;
                }
                walk = tree.entry(parent);
            }
            return walk.header.bits;
        }

        return last.header.bits;
    }

    let first = tree
        .ancestor(parent, height - interval)
        .map(|id| tree.entry(id))
        .expect("Retarget block must be an ancestor of the parent; qed");

    let timespan = last.header.time.saturating_sub(first.header.time);

    CompactTarget::from_next_work_required(last.header.bits, timespan as u64, params)
}

/// Contextual checks of a header whose parent is `parent`.
///
/// - The difficulty bits match the expected ones and the proof-of-work is valid.
/// - Time is not greater than 2 hours from now.
/// - Time is after the median time of the last 11 blocks.
///
/// https://github.com/bitcoin/bitcoin/blob/6f9db1ebcab4064065ccd787161bf2b87e03cc1f/src/validation.cpp#L4146
pub fn check_header(
    tree: &BlockTree,
    parent: BlockId,
    header: &bitcoin::block::Header,
    params: &ChainParams,
    now: u64,
) -> Result<(), BlockError> {
    let expected = get_next_work_required(tree, parent, header.time, &params.params);
    if header.bits != expected {
        return Err(BlockError::BadDifficultyBits {
            got: header.bits,
            expected,
        });
    }

    let target = header.target();
    if target > params.params.max_attainable_target {
        return Err(BlockError::InvalidProofOfWork);
    }
    header
        .validate_pow(target)
        .map_err(|_| BlockError::InvalidProofOfWork)?;

    if header.time as u64 > now + MAX_FUTURE_BLOCK_TIME {
        return Err(BlockError::TooFarInFuture);
    }

    if header.time <= tree.median_time_past(parent) {
        return Err(BlockError::TimeTooOld);
    }

    Ok(())
}

/// Performs the context free checks of a block and returns the txids.
pub fn check_block_sanity(block: &Block) -> Result<Vec<Txid>, BlockError> {
    // Transaction list must be non-empty.
    if block.txdata.is_empty() {
        return Err(BlockError::EmptyTransactionList);
    }

    // First transaction must be coinbase, the rest must not be.
    if !block.txdata[0].is_coinbase() {
        return Err(BlockError::FirstTransactionIsNotCoinbase);
    }

    if block.txdata.iter().skip(1).any(|tx| tx.is_coinbase()) {
        return Err(BlockError::MultipleCoinbase);
    }

    if block.weight() > MAX_BLOCK_WEIGHT {
        return Err(BlockError::BadBlockWeight);
    }

    let mut seen_transactions = HashSet::with_capacity(block.txdata.len());
    let mut txids = Vec::with_capacity(block.txdata.len());
    for (index, tx) in block.txdata.iter().enumerate() {
        let txid = tx.compute_txid();
        if !seen_transactions.insert(txid) {
            return Err(BlockError::DuplicateTransaction(index));
        }

        check_transaction_sanity(tx).map_err(|err| BlockError::Transaction { index, err })?;

        txids.push(txid);
    }

    // Inline `Block::check_merkle_root()` to avoid redundantly computing txid.
    let merkle_root: Option<TxMerkleNode> =
        bitcoin::merkle_tree::calculate_root(txids.iter().map(|txid| txid.to_raw_hash()))
            .map(|hash| hash.into());

    if merkle_root != Some(block.header.merkle_root) {
        return Err(BlockError::BadMerkleRoot);
    }

    if !block.check_witness_commitment() {
        return Err(BlockError::BadWitnessCommitment);
    }

    Ok(txids)
}

/// Checks that depend on the position of the block in the chain.
///
/// `median_time_past` is the median time past of the parent.
pub fn check_block_contextual(
    block: &Block,
    height: u32,
    median_time_past: u32,
    params: &ChainParams,
) -> Result<(), BlockError> {
    let lock_time_cutoff = if height >= params.csv_height {
        median_time_past
    } else {
        block.header.time
    };

    for tx in &block.txdata {
        if !is_final(tx, height, lock_time_cutoff) {
            return Err(BlockError::NonFinalTransaction(tx.compute_txid()));
        }
    }

    if height >= params.params.bip34_height
        && block.bip34_block_height().ok() != Some(height as u64)
    {
        return Err(BlockError::BadCoinbaseHeight(height));
    }

    Ok(())
}

impl BlockError {
    /// Whether the error can be caused by tampering with the block body, in
    /// which case the header itself may still be valid.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::BadMerkleRoot | Self::BadWitnessCommitment | Self::DuplicateTransaction(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::block::Header;
    use bitcoin::consensus::encode::deserialize_hex;
    use oxnode_test_utils::{Miner, mainnet_blocks, spend_tx};

    #[test]
    fn retarget_matches_mainnet() {
        // block_354816
        let block_354816: Header = deserialize_hex("020000003f99814a36d2a2043b1d4bf61a410f71828eca1decbf56000000000000000000b3762ed278ac44bb953e24262cfeb952d0abe6d3b7f8b74fd24e009b96b6cb965d674655dd1317186436e79d").unwrap();

        // block_352800, first block in this period.
        let first_block: Header = deserialize_hex("0200000074c51c1cc53aaf478c643bb612da6bd17b268cd9bdccc4000000000000000000ccc0a2618a1f973dfac37827435b463abd18cbfd0f280a90432d3d78497a36cc02f33355f0171718b72a1dc7").unwrap();

        // block_354815, last block in this period.
        let last_block: Header = deserialize_hex("030000004c9c1b59250f30b8d360886a5433501120b056a000bdc0160000000000000000caca1bf0c55a5ba2299f9e60d10c01c679bb266c7df815ff776a1b97fd3a199ac1644655f01717182707bd59").unwrap();

        let new_bits = CompactTarget::from_next_work_required(
            last_block.bits,
            (last_block.time - first_block.time) as u64,
            Params::new(bitcoin::Network::Bitcoin),
        );

        assert_eq!(new_bits, block_354816.bits, "Difficulty bits must match");
    }

    #[test]
    fn mainnet_headers_pass_contextual_checks() {
        let params = ChainParams::new(bitcoin::Network::Bitcoin);
        let blocks = mainnet_blocks();
        let mut tree = BlockTree::default();
        let mut parent = tree.insert(blocks[0].header);
        for block in &blocks[1..] {
            check_header(&tree, parent, &block.header, &params, oxnode_primitives::unix_time()).unwrap();
            check_block_sanity(block).unwrap();
            parent = tree.insert(block.header);
        }
    }

    #[test]
    fn header_checks_reject_bad_headers() {
        let params = ChainParams::new(bitcoin::Network::Regtest);
        let mut miner = Miner::new();
        let mut tree = BlockTree::default();
        let genesis = tree.insert(miner.genesis().header);
        let block = miner.mine(miner.genesis().block_hash(), 1, bitcoin::Amount::ZERO, Vec::new());
        let now = oxnode_primitives::unix_time();
        check_header(&tree, genesis, &block.header, &params, now).unwrap();

        let mut header = block.header;
        header.bits = CompactTarget::from_consensus(0x1d00ffff);
        assert!(matches!(
            check_header(&tree, genesis, &header, &params, now),
            Err(BlockError::BadDifficultyBits { .. })
        ));

        let mut header = block.header;
        header.time = miner.genesis().header.time;
        let err = check_header(&tree, genesis, &header, &params, now).unwrap_err();
        assert!(matches!(err, BlockError::TimeTooOld | BlockError::InvalidProofOfWork));

        let mut header = block.header;
        header.time = (now + MAX_FUTURE_BLOCK_TIME + 60) as u32;
        while header.validate_pow(header.target()).is_err() {
            header.nonce += 1;
        }
        assert_eq!(
            check_header(&tree, genesis, &header, &params, now),
            Err(BlockError::TooFarInFuture)
        );
    }

    #[test]
    fn block_sanity_rejects_malformed_blocks() {
        let mut miner = Miner::new();
        let parent = miner.genesis().block_hash();
        let block = miner.mine(parent, 1, bitcoin::Amount::ZERO, Vec::new());
        check_block_sanity(&block).unwrap();

        let mut no_coinbase = block.clone();
        no_coinbase.txdata[0] = spend_tx(
            &[bitcoin::OutPoint::new(oxnode_test_utils::random_txid(), 0)],
            &[bitcoin::Amount::from_sat(1)],
        );
        assert_eq!(
            check_block_sanity(&no_coinbase),
            Err(BlockError::FirstTransactionIsNotCoinbase)
        );

        let mut bad_root = block.clone();
        bad_root.header.merkle_root = TxMerkleNode::all_zeros();
        let err = check_block_sanity(&bad_root).unwrap_err();
        assert_eq!(err, BlockError::BadMerkleRoot);
        assert!(err.is_mutation());

        let mut duplicated = block.clone();
        duplicated.txdata.push(duplicated.txdata[0].clone());
        assert_eq!(
            check_block_sanity(&duplicated),
            Err(BlockError::MultipleCoinbase)
        );
    }
}
