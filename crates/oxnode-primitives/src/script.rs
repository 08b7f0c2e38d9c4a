//! Seam to the external script interpreter.

use crate::ChainParams;
use bitcoin::{BlockHash, TxOut};

/// Script verification flags, bit compatible with libbitcoinconsensus.
pub mod flags {
    pub const NONE: u32 = 0;
    pub const P2SH: u32 = 1 << 0;
    pub const DERSIG: u32 = 1 << 2;
    pub const NULLDUMMY: u32 = 1 << 4;
    pub const CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
    pub const CHECKSEQUENCEVERIFY: u32 = 1 << 10;
    pub const WITNESS: u32 = 1 << 11;

    /// Flags used for mempool admission.
    pub const STANDARD: u32 =
        P2SH | DERSIG | NULLDUMMY | CHECKLOCKTIMEVERIFY | CHECKSEQUENCEVERIFY | WITNESS;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Script verification failed for input {input_index}: {reason}")]
pub struct ScriptError {
    pub input_index: usize,
    pub reason: String,
}

/// Pure predicate deciding whether an input satisfies the script of the
/// output it spends.
///
/// Implementations are shared across the script verification workers.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        spent_output: &TxOut,
        spending_transaction: &[u8],
        input_index: usize,
        flags: u32,
    ) -> Result<(), ScriptError>;
}

/// Accepts every script, for nodes running with script checks disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScriptVerification;

impl ScriptVerifier for NoScriptVerification {
    fn verify(&self, _: &TxOut, _: &[u8], _: usize, _: u32) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Script verifier backed by libbitcoinconsensus.
#[cfg(feature = "bitcoinconsensus")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusScriptVerifier;

#[cfg(feature = "bitcoinconsensus")]
impl ScriptVerifier for ConsensusScriptVerifier {
    fn verify(
        &self,
        spent_output: &TxOut,
        spending_transaction: &[u8],
        input_index: usize,
        flags: u32,
    ) -> Result<(), ScriptError> {
        bitcoinconsensus::verify_with_flags(
            spent_output.script_pubkey.as_bytes(),
            spent_output.value.to_sat(),
            spending_transaction,
            input_index,
            flags,
        )
        .map_err(|err| ScriptError {
            input_index,
            reason: format!("{err:?}"),
        })
    }
}

/// Returns the script validation flags for the specified block.
///
/// <https://github.com/bitcoin/bitcoin/blob/6f9db1ebcab4064065ccd787161bf2b87e03cc1f/src/validation.cpp#L2360>
pub fn get_block_script_flags(height: u32, block_hash: BlockHash, chain_params: &ChainParams) -> u32 {
    if let Some(flag) = chain_params
        .script_flag_exceptions
        .get(&block_hash)
        .copied()
    {
        return flag;
    }

    let mut script_flags = flags::P2SH | flags::WITNESS;

    // Enforce the DERSIG (BIP66) rule
    if height >= chain_params.params.bip66_height {
        script_flags |= flags::DERSIG;
    }

    // Enforce CHECKLOCKTIMEVERIFY (BIP65)
    if height >= chain_params.params.bip65_height {
        script_flags |= flags::CHECKLOCKTIMEVERIFY;
    }

    // Enforce CHECKSEQUENCEVERIFY (BIP112)
    if height >= chain_params.csv_height {
        script_flags |= flags::CHECKSEQUENCEVERIFY;
    }

    // Enforce BIP147 NULLDUMMY (activated simultaneously with segwit)
    if height >= chain_params.segwit_height {
        script_flags |= flags::NULLDUMMY;
    }

    script_flags
}
