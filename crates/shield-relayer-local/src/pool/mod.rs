//! Adapter traits for the on-chain pool and settlement contracts.
//!
//! The relayer consumes three narrow contract surfaces: proof verification
//! ([`ProofVerifier`]), spend settlement ([`SettlementSubmitter`]), and the
//! optional credit-settlement contract ([`CreditSettlement`]). Each is
//! implemented twice: against live RPC ([`onchain::OnchainPool`]) and as an
//! in-memory stub ([`stub::StubPool`]) for tests and proofless deployments.
//!
//! Verification failures are terminal for the current request and never
//! mutate state; only settlement writes anything on-chain.

use alloy_primitives::B256;
use shield_types::error::RelayerError;
use shield_types::proto::ShieldedPaymentPayload;

pub mod onchain;
pub mod stub;

pub use onchain::OnchainPool;
pub use stub::StubPool;

/// Result of submitting a spend to the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementOutcome {
    /// The chain reported this nullifier as already consumed. Not an error:
    /// the caller decides whether that means replay or crash recovery.
    pub already_settled: bool,
    pub tx_hash: Option<B256>,
    /// Pool index of the merchant output commitment, surfaced so the agent
    /// wallet can patch its Merkle view without re-scanning.
    pub merchant_leaf_index: Option<u32>,
    /// Pool index of the change output commitment.
    pub change_leaf_index: Option<u32>,
}

/// Verifies shielded spend proofs and tracks nullifier consumption.
#[async_trait::async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify_proof(&self, payload: &ShieldedPaymentPayload) -> Result<bool, RelayerError>;

    async fn is_nullifier_used(&self, nullifier: &B256) -> Result<bool, RelayerError>;

    async fn is_known_root(&self, root: &B256) -> Result<bool, RelayerError>;

    /// Idempotent; the on-chain variant is a no-op because settlement marks
    /// the nullifier as part of the spend transaction.
    async fn mark_nullifier_used(&self, nullifier: &B256) -> Result<(), RelayerError>;
}

/// Submits spends to the pool contract.
#[async_trait::async_trait]
pub trait SettlementSubmitter: Send + Sync {
    /// Submits the spend. A "nullifier already used" report from the chain
    /// comes back as `already_settled = true` rather than an error; all
    /// other RPC failures are retryable [`RelayerError::settlement`]s.
    async fn settle_onchain(
        &self,
        payload: &ShieldedPaymentPayload,
    ) -> Result<SettlementOutcome, RelayerError>;
}

/// The optional credit-settlement contract driving channel lifecycle
/// on-chain.
#[async_trait::async_trait]
pub trait CreditSettlement: Send + Sync {
    async fn open_or_topup(&self, channel_id: &B256, amount: u128) -> Result<B256, RelayerError>;

    async fn start_close(
        &self,
        channel_id: &B256,
        seq: u64,
        available: u128,
    ) -> Result<B256, RelayerError>;

    async fn challenge_close(
        &self,
        channel_id: &B256,
        seq: u64,
        available: u128,
    ) -> Result<B256, RelayerError>;

    async fn finalize_close(&self, channel_id: &B256) -> Result<B256, RelayerError>;
}
