//! Allow-all in-memory pool for tests and proofless deployments.

use alloy_primitives::{B256, Keccak256};
use dashmap::DashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use shield_types::error::RelayerError;
use shield_types::proto::ShieldedPaymentPayload;

use super::{CreditSettlement, ProofVerifier, SettlementOutcome, SettlementSubmitter};

/// In-memory stand-in for the pool and settlement contracts.
///
/// Proofs always verify; roots are always known unless a finite root set is
/// installed; nullifier uniqueness is tracked in-process. Settlement mints
/// a deterministic pseudo tx hash and advances a leaf counter by two (one
/// merchant output, one change output) per spend.
#[derive(Debug, Default)]
pub struct StubPool {
    nullifiers: DashSet<B256>,
    known_roots: DashSet<B256>,
    leaf_count: AtomicU32,
    verify_calls: AtomicUsize,
    settle_calls: AtomicUsize,
}

impl StubPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts `is_known_root` to the given set. With no roots installed
    /// every root is accepted.
    pub fn insert_known_root(&self, root: B256) {
        self.known_roots.insert(root);
    }

    /// How many times `verify_proof` ran; test observability.
    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    /// How many times `settle_onchain` ran; test observability.
    pub fn settle_calls(&self) -> usize {
        self.settle_calls.load(Ordering::SeqCst)
    }

    fn pseudo_tx_hash(nullifier: &B256) -> B256 {
        let mut hasher = Keccak256::new();
        hasher.update(b"stub-settlement");
        hasher.update(nullifier);
        hasher.finalize()
    }
}

#[async_trait::async_trait]
impl ProofVerifier for StubPool {
    async fn verify_proof(&self, _payload: &ShieldedPaymentPayload) -> Result<bool, RelayerError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn is_nullifier_used(&self, nullifier: &B256) -> Result<bool, RelayerError> {
        Ok(self.nullifiers.contains(nullifier))
    }

    async fn is_known_root(&self, root: &B256) -> Result<bool, RelayerError> {
        if self.known_roots.is_empty() {
            return Ok(true);
        }
        Ok(self.known_roots.contains(root))
    }

    async fn mark_nullifier_used(&self, nullifier: &B256) -> Result<(), RelayerError> {
        self.nullifiers.insert(*nullifier);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SettlementSubmitter for StubPool {
    async fn settle_onchain(
        &self,
        payload: &ShieldedPaymentPayload,
    ) -> Result<SettlementOutcome, RelayerError> {
        self.settle_calls.fetch_add(1, Ordering::SeqCst);
        if !self.nullifiers.insert(payload.nullifier) {
            return Ok(SettlementOutcome {
                already_settled: true,
                ..Default::default()
            });
        }
        let count = self.leaf_count.fetch_add(2, Ordering::SeqCst) + 2;
        Ok(SettlementOutcome {
            already_settled: false,
            tx_hash: Some(Self::pseudo_tx_hash(&payload.nullifier)),
            merchant_leaf_index: Some(count - 2),
            change_leaf_index: Some(count - 1),
        })
    }
}

#[async_trait::async_trait]
impl CreditSettlement for StubPool {
    async fn open_or_topup(&self, channel_id: &B256, _amount: u128) -> Result<B256, RelayerError> {
        Ok(Self::pseudo_tx_hash(channel_id))
    }

    async fn start_close(
        &self,
        channel_id: &B256,
        _seq: u64,
        _available: u128,
    ) -> Result<B256, RelayerError> {
        Ok(Self::pseudo_tx_hash(channel_id))
    }

    async fn challenge_close(
        &self,
        channel_id: &B256,
        _seq: u64,
        _available: u128,
    ) -> Result<B256, RelayerError> {
        Ok(Self::pseudo_tx_hash(channel_id))
    }

    async fn finalize_close(&self, channel_id: &B256) -> Result<B256, RelayerError> {
        Ok(Self::pseudo_tx_hash(channel_id))
    }
}
