//! Live RPC implementation of the pool and settlement adapters.

use alloy_network::EthereumWallet;
use alloy_primitives::{Address, B256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::sol;
use tracing::instrument;
use url::Url;

use shield_types::error::RelayerError;
use shield_types::proto::ShieldedPaymentPayload;

use super::{CreditSettlement, ProofVerifier, SettlementOutcome, SettlementSubmitter};

sol! {
    #[sol(rpc)]
    interface IShieldedPool {
        function verifyProof(bytes calldata proof, bytes32[6] calldata publicInputs) external view returns (bool);
        function isKnownRoot(bytes32 root) external view returns (bool);
        function isNullifierUsed(bytes32 nullifier) external view returns (bool);
        function submitSpend(bytes calldata proof, bytes32[6] calldata publicInputs, bytes calldata encryptedReceipt) external;
        function latestRoot() external view returns (bytes32);
        function leafCount() external view returns (uint32);
    }

    #[sol(rpc)]
    interface ICreditSettlement {
        function openOrTopup(bytes32 channelId, uint128 amount) external;
        function startClose(bytes32 channelId, uint64 seq, uint128 available) external;
        function challengeClose(bytes32 channelId, uint64 seq, uint128 available) external;
        function finalizeClose(bytes32 channelId) external;
    }
}

/// Pool adapter speaking JSON-RPC through an alloy provider with the
/// relayer's wallet attached.
pub struct OnchainPool {
    provider: DynProvider,
    pool_address: Address,
    credit_settlement_address: Option<Address>,
}

impl OnchainPool {
    /// Connects to `rpc_url` with the relayer key as the transaction signer.
    pub fn connect(
        rpc_url: Url,
        relayer_key: &str,
        pool_address: Address,
        credit_settlement_address: Option<Address>,
    ) -> Result<Self, RelayerError> {
        let signer: PrivateKeySigner = relayer_key
            .trim()
            .parse()
            .map_err(|_| RelayerError::internal("invalid relayer private key"))?;
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(rpc_url)
            .erased();
        Ok(Self {
            provider,
            pool_address,
            credit_settlement_address,
        })
    }

    fn pool(&self) -> IShieldedPool::IShieldedPoolInstance<DynProvider> {
        IShieldedPool::new(self.pool_address, self.provider.clone())
    }

    fn credit(
        &self,
    ) -> Result<ICreditSettlement::ICreditSettlementInstance<DynProvider>, RelayerError> {
        let address = self
            .credit_settlement_address
            .ok_or_else(|| RelayerError::settlement("no credit settlement contract configured"))?;
        Ok(ICreditSettlement::new(address, self.provider.clone()))
    }

    fn public_inputs(payload: &ShieldedPaymentPayload) -> Result<[B256; 6], RelayerError> {
        payload
            .public_inputs
            .clone()
            .try_into()
            .map_err(|_| RelayerError::protocol("publicInputs must contain exactly 6 words"))
    }

    /// Whether an RPC error text is the pool's nullifier-consumed revert.
    fn is_nullifier_conflict(error: &str) -> bool {
        let lower = error.to_lowercase();
        lower.contains("nullifier") && (lower.contains("used") || lower.contains("spent"))
    }
}

#[async_trait::async_trait]
impl ProofVerifier for OnchainPool {
    #[instrument(skip_all, err)]
    async fn verify_proof(&self, payload: &ShieldedPaymentPayload) -> Result<bool, RelayerError> {
        let inputs = Self::public_inputs(payload)?;
        self.pool()
            .verifyProof(payload.proof.clone(), inputs)
            .call()
            .await
            .map_err(|e| RelayerError::settlement(format!("verifyProof rpc failed: {e}")))
    }

    #[instrument(skip_all, err)]
    async fn is_nullifier_used(&self, nullifier: &B256) -> Result<bool, RelayerError> {
        self.pool()
            .isNullifierUsed(*nullifier)
            .call()
            .await
            .map_err(|e| RelayerError::settlement(format!("isNullifierUsed rpc failed: {e}")))
    }

    #[instrument(skip_all, err)]
    async fn is_known_root(&self, root: &B256) -> Result<bool, RelayerError> {
        self.pool()
            .isKnownRoot(*root)
            .call()
            .await
            .map_err(|e| RelayerError::settlement(format!("isKnownRoot rpc failed: {e}")))
    }

    async fn mark_nullifier_used(&self, _nullifier: &B256) -> Result<(), RelayerError> {
        // The pool marks the nullifier inside submitSpend; nothing to do.
        Ok(())
    }
}

#[async_trait::async_trait]
impl SettlementSubmitter for OnchainPool {
    #[instrument(skip_all, err)]
    async fn settle_onchain(
        &self,
        payload: &ShieldedPaymentPayload,
    ) -> Result<SettlementOutcome, RelayerError> {
        let inputs = Self::public_inputs(payload)?;
        let pool = self.pool();

        // Cheap pre-flight read; a consumed nullifier is a conflict, not an
        // RPC failure.
        if self.is_nullifier_used(&payload.nullifier).await? {
            return Ok(SettlementOutcome {
                already_settled: true,
                ..Default::default()
            });
        }

        let pending = pool
            .submitSpend(
                payload.proof.clone(),
                inputs,
                payload.encrypted_receipt.clone(),
            )
            .send()
            .await;
        let pending = match pending {
            Ok(pending) => pending,
            Err(e) if Self::is_nullifier_conflict(&e.to_string()) => {
                return Ok(SettlementOutcome {
                    already_settled: true,
                    ..Default::default()
                });
            }
            Err(e) => {
                return Err(RelayerError::settlement(format!(
                    "submitSpend send failed: {e}"
                )));
            }
        };
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| RelayerError::settlement(format!("submitSpend receipt failed: {e}")))?;
        if !receipt.status() {
            return Err(RelayerError::settlement("submitSpend reverted"));
        }

        // The spend inserts two output leaves; their indices are the tail of
        // the pool after inclusion.
        let leaf_count = pool
            .leafCount()
            .call()
            .await
            .map_err(|e| RelayerError::settlement(format!("leafCount rpc failed: {e}")))?;
        let (merchant_leaf_index, change_leaf_index) = if leaf_count >= 2 {
            (Some(leaf_count - 2), Some(leaf_count - 1))
        } else {
            (None, None)
        };

        Ok(SettlementOutcome {
            already_settled: false,
            tx_hash: Some(receipt.transaction_hash),
            merchant_leaf_index,
            change_leaf_index,
        })
    }
}

#[async_trait::async_trait]
impl CreditSettlement for OnchainPool {
    #[instrument(skip_all, err)]
    async fn open_or_topup(&self, channel_id: &B256, amount: u128) -> Result<B256, RelayerError> {
        let receipt = self
            .credit()?
            .openOrTopup(*channel_id, amount)
            .send()
            .await
            .map_err(|e| RelayerError::settlement(format!("openOrTopup send failed: {e}")))?
            .get_receipt()
            .await
            .map_err(|e| RelayerError::settlement(format!("openOrTopup receipt failed: {e}")))?;
        Ok(receipt.transaction_hash)
    }

    #[instrument(skip_all, err)]
    async fn start_close(
        &self,
        channel_id: &B256,
        seq: u64,
        available: u128,
    ) -> Result<B256, RelayerError> {
        let receipt = self
            .credit()?
            .startClose(*channel_id, seq, available)
            .send()
            .await
            .map_err(|e| RelayerError::settlement(format!("startClose send failed: {e}")))?
            .get_receipt()
            .await
            .map_err(|e| RelayerError::settlement(format!("startClose receipt failed: {e}")))?;
        Ok(receipt.transaction_hash)
    }

    #[instrument(skip_all, err)]
    async fn challenge_close(
        &self,
        channel_id: &B256,
        seq: u64,
        available: u128,
    ) -> Result<B256, RelayerError> {
        let receipt = self
            .credit()?
            .challengeClose(*channel_id, seq, available)
            .send()
            .await
            .map_err(|e| RelayerError::settlement(format!("challengeClose send failed: {e}")))?
            .get_receipt()
            .await
            .map_err(|e| RelayerError::settlement(format!("challengeClose receipt failed: {e}")))?;
        Ok(receipt.transaction_hash)
    }

    #[instrument(skip_all, err)]
    async fn finalize_close(&self, channel_id: &B256) -> Result<B256, RelayerError> {
        let receipt = self
            .credit()?
            .finalizeClose(*channel_id)
            .send()
            .await
            .map_err(|e| RelayerError::settlement(format!("finalizeClose send failed: {e}")))?
            .get_receipt()
            .await
            .map_err(|e| RelayerError::settlement(format!("finalizeClose receipt failed: {e}")))?;
        Ok(receipt.transaction_hash)
    }
}
