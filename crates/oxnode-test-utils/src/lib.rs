//! Test tooling shared by the oxnode crates.
//!
//! Blocks mined here target regtest, whose proof-of-work limit lets a block
//! be found after a couple of nonce attempts.

use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, Network, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Txid, Witness, absolute, script, transaction,
};
use oxnode_primitives::ChainParams;

/// Installs a `tracing` subscriber honouring `RUST_LOG`, once per process.
pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The first four blocks of the Bitcoin mainnet.
pub fn mainnet_blocks() -> Vec<Block> {
    [
        "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c0101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000",
        "010000006fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000982051fd1e4ba744bbbe680e1fee14677ba1a3c3540bf7b1cdb606e857233e0e61bc6649ffff001d01e362990101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d0104ffffffff0100f2052a0100000043410496b538e853519c726a2c91e61ec11600ae1390813a627c66fb8be7947be63c52da7589379515d4e0a604f8141781e62294721166bf621e73a82cbf2342c858eeac00000000",
        "010000004860eb18bf1b1620e37e9490fc8a427514416fd75159ab86688e9a8300000000d5fdcc541e25de1c7a5addedf24858b8bb665c9f36ef744ee42c316022c90f9bb0bc6649ffff001d08d2bd610101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d010bffffffff0100f2052a010000004341047211a824f55b505228e4c3d5194c1fcfaa15a456abdf37f9b9d97a4040afc073dee6c89064984f03385237d92167c13e236446b417ab79a0fcae412ae3316b77ac00000000",
        "01000000bddd99ccfda39da1b108ce1a5d70038d0a967bacb68b6b63065f626a0000000044f672226090d85db9a9f2fbfe5f0f9609b387af7be5b7fbb7a1767c831c9e995dbe6649ffff001d05e0ed6d0101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d010effffffff0100f2052a0100000043410494b9d3e76c5b1629ecf97fff95d7a4bbdac87cc26099ada28066c6ff1eb9191223cd897194a08d0c2726c5747f1db49e8cf90e75dc3e3550ae9b30086f3cd5aaac00000000",
    ]
    .into_iter()
    .map(|hex| deserialize_hex(hex).expect("Hardcoded block must be valid; qed"))
    .collect()
}

/// Script anyone can spend.
pub fn op_true() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x51])
}

/// Coinbase paying `value` to [`op_true`].
///
/// The height and `extra_nonce` in the script sig keep coinbase txids unique.
pub fn coinbase_tx(height: u32, extra_nonce: u32, value: Amount) -> Transaction {
    let script_sig = script::Builder::new()
        .push_int(height as i64)
        .push_int(extra_nonce as i64)
        .into_script();
    Transaction {
        version: transaction::Version::ONE,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: op_true(),
        }],
    }
}

/// Transaction spending `inputs` into outputs of the given values, all paid to [`op_true`].
pub fn spend_tx(inputs: &[OutPoint], values: &[Amount]) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs
            .iter()
            .map(|previous_output| TxIn {
                previous_output: *previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: values
            .iter()
            .map(|value| TxOut {
                value: *value,
                script_pubkey: op_true(),
            })
            .collect(),
    }
}

/// Regtest block miner keeping track of the blocks it produced.
pub struct Miner {
    params: ChainParams,
    genesis: Block,
    extra_nonce: u32,
}

impl Default for Miner {
    fn default() -> Self {
        Self::new()
    }
}

impl Miner {
    pub fn new() -> Self {
        Self {
            params: ChainParams::new(Network::Regtest),
            genesis: bitcoin::constants::genesis_block(Network::Regtest),
            extra_nonce: fastrand::u32(..1 << 24),
        }
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    /// Mines a block at `height` on top of `parent` carrying `txs` after the coinbase.
    ///
    /// The coinbase claims the full subsidy plus `fees`. Block times advance
    /// ten minutes per height from the genesis time, which keeps them above
    /// the median time past of any chain produced by this miner.
    pub fn mine(&mut self, parent: BlockHash, height: u32, fees: Amount, txs: Vec<Transaction>) -> Block {
        self.extra_nonce += 1;
        let coinbase_value = self.params.block_subsidy(height) + fees;
        let mut txdata = vec![coinbase_tx(height, self.extra_nonce, coinbase_value)];
        txdata.extend(txs);
        self.assemble(parent, height, txdata)
    }

    /// Grinds the nonce of a block with the given transactions.
    pub fn assemble(&mut self, parent: BlockHash, height: u32, txdata: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: Header {
                version: BlockVersion::from_consensus(4),
                prev_blockhash: parent,
                merkle_root: TxMerkleNode::all_zeros(),
                time: self.genesis.header.time + height * 600,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: 0,
            },
            txdata,
        };
        block.header.merkle_root = block
            .compute_merkle_root()
            .expect("Block has at least one transaction; qed");
        let target = block.header.target();
        while block.header.validate_pow(target).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    /// Mines `count` empty blocks on top of `parent` which sits at `parent_height`.
    pub fn mine_chain(&mut self, parent: BlockHash, parent_height: u32, count: u32) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(count as usize);
        let mut parent = parent;
        for height in parent_height + 1..=parent_height + count {
            let block = self.mine(parent, height, Amount::ZERO, Vec::new());
            parent = block.block_hash();
            blocks.push(block);
        }
        blocks
    }
}

/// Random txid for outputs that exist nowhere.
pub fn random_txid() -> Txid {
    Txid::from_byte_array(std::array::from_fn(|_| fastrand::u8(..)))
}
