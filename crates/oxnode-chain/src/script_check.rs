use crate::{BlockError, Error};
use bitcoin::{TxOut, Txid};
use oxnode_primitives::script::ScriptVerifier;
use rayon::prelude::*;
use std::sync::Arc;

/// Script checks of one transaction.
#[derive(Debug, Clone)]
pub struct TxScriptJob {
    pub txid: Txid,
    /// Consensus encoded spending transaction.
    pub tx_bytes: Vec<u8>,
    /// Outputs spent by the inputs, in input order.
    pub spent: Vec<TxOut>,
}

/// Runs the script checks of a block on a dedicated worker pool.
///
/// Verification is a pure function of the spent output and the spending
/// transaction, so the inputs of a block are checked in any order and the
/// first failure found aborts the remaining work.
pub struct ScriptChecker {
    pool: rayon::ThreadPool,
    verifier: Arc<dyn ScriptVerifier>,
}

impl ScriptChecker {
    /// Creates a checker with `threads` workers, `0` picks the number of CPUs.
    pub fn new(verifier: Arc<dyn ScriptVerifier>, threads: usize) -> Result<Self, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("script-check-{index}"))
            .build()
            .map_err(|err| Error::ThreadPool(err.to_string()))?;

        Ok(Self { pool, verifier })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Verifies every input of `jobs`, returning one of the failures if any.
    pub fn verify(&self, jobs: &[TxScriptJob], flags: u32) -> Result<(), BlockError> {
        let verifier = &self.verifier;

        let failure = self.pool.install(|| {
            jobs.par_iter()
                .flat_map_iter(|job| {
                    job.spent
                        .iter()
                        .enumerate()
                        .map(move |(input_index, spent)| (job, input_index, spent))
                })
                .find_map_any(|(job, input_index, spent)| {
                    verifier
                        .verify(spent, &job.tx_bytes, input_index, flags)
                        .err()
                        .map(|err| BlockError::Script { txid: job.txid, err })
                })
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxnode_primitives::script::{NoScriptVerification, ScriptError};
    use oxnode_test_utils::random_txid;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects input 1 of transactions whose first byte is odd.
    struct PickyVerifier {
        calls: AtomicUsize,
    }

    impl ScriptVerifier for PickyVerifier {
        fn verify(&self, _: &TxOut, tx: &[u8], input_index: usize, _: u32) -> Result<(), ScriptError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if tx[0] % 2 == 1 && input_index == 1 {
                return Err(ScriptError {
                    input_index,
                    reason: "odd".into(),
                });
            }
            Ok(())
        }
    }

    fn job(first_byte: u8, inputs: usize) -> TxScriptJob {
        TxScriptJob {
            txid: random_txid(),
            tx_bytes: vec![first_byte],
            spent: vec![TxOut::NULL; inputs],
        }
    }

    #[test]
    fn every_input_is_checked() {
        let verifier = Arc::new(PickyVerifier {
            calls: AtomicUsize::new(0),
        });
        let checker = ScriptChecker::new(verifier.clone(), 4).unwrap();
        let jobs = (0..50).map(|_| job(2, 3)).collect::<Vec<_>>();
        checker.verify(&jobs, 0).unwrap();
        assert_eq!(verifier.calls.load(Ordering::Relaxed), 150);
    }

    #[test]
    fn failure_names_the_transaction() {
        let checker = ScriptChecker::new(
            Arc::new(PickyVerifier {
                calls: AtomicUsize::new(0),
            }),
            2,
        )
        .unwrap();
        let mut jobs = (0..20).map(|_| job(2, 2)).collect::<Vec<_>>();
        let bad = job(3, 2);
        let bad_txid = bad.txid;
        jobs.insert(7, bad);

        match checker.verify(&jobs, 0) {
            Err(BlockError::Script { txid, err }) => {
                assert_eq!(txid, bad_txid);
                assert_eq!(err.input_index, 1);
            }
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_block_passes() {
        let checker = ScriptChecker::new(Arc::new(NoScriptVerification), 1).unwrap();
        assert_eq!(checker.threads(), 1);
        checker.verify(&[], 0).unwrap();
    }
}
