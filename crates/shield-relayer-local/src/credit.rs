//! Credit-channel processor: topup, debit, and close.
//!
//! A channel is a strictly linear log of doubly-signed states. All work for
//! one `channelId` runs under its named mutex, and the mutex is released
//! only after the durable head write, so accepted states have contiguous
//! `seq` with no gaps and the durable order matches the logical order.
//!
//! Request ids make every operation at-least-once safe: terminal responses
//! are cached in-process and persisted, and a retry replays the stored
//! response byte-for-byte without re-forwarding to the merchant.

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::Eip712Domain;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::instrument;

use shield_types::credit::{ChannelHead, CreditState, SignedCreditState};
use shield_types::crypto::canonical::merchant_binding_digest;
use shield_types::crypto::{channel_id as derive_channel_id, recover_message_signer, recover_prehash_signer};
use shield_types::error::{ErrorKind, RelayerError};
use shield_types::proto::relay::{
    ChannelStatus, CloseChallengeRequest, CloseFinalizeRequest, CloseResponse, CloseStartRequest,
    CreditPayRequest, CreditPayResponse, RelayStatus, TopupRequest, TopupResponse,
};
use shield_types::sequencer::intent_digest;
use shield_types::timestamp::UnixTimestamp;
use shield_types::typed_data;

use crate::challenge::ChallengeBridge;
use crate::locks::MutexRegistry;
use crate::payout::{PayoutAdapter, PayoutCall};
use crate::pool::{CreditSettlement, ProofVerifier, SettlementSubmitter};
use crate::signer::RelayerSigner;
use crate::store::SettlementStore;

/// Reason used whenever an incoming `latestState` does not hash-equal the
/// durable head.
pub const STALE_STATE_REASON: &str = "stale latestState: does not match relayer channel head";

#[derive(Debug, Clone)]
pub struct CreditConfig {
    pub chain_id: u64,
    pub verifying_contract: Address,
}

pub struct CreditProcessor {
    verifier: Arc<dyn ProofVerifier>,
    settlement: Arc<dyn SettlementSubmitter>,
    payout: Arc<PayoutAdapter>,
    store: Arc<dyn SettlementStore>,
    bridge: Arc<ChallengeBridge>,
    signer: Arc<RelayerSigner>,
    credit_settlement: Option<Arc<dyn CreditSettlement>>,
    domain: Eip712Domain,
    config: CreditConfig,
    locks: MutexRegistry<B256>,
    topup_cache: DashMap<B256, TopupResponse>,
    pay_cache: DashMap<B256, CreditPayResponse>,
    closing: DashSet<B256>,
}

impl CreditProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: Arc<dyn ProofVerifier>,
        settlement: Arc<dyn SettlementSubmitter>,
        payout: Arc<PayoutAdapter>,
        store: Arc<dyn SettlementStore>,
        bridge: Arc<ChallengeBridge>,
        signer: Arc<RelayerSigner>,
        credit_settlement: Option<Arc<dyn CreditSettlement>>,
        config: CreditConfig,
    ) -> Self {
        let domain = typed_data::credit_domain(config.chain_id, config.verifying_contract);
        Self {
            verifier,
            settlement,
            payout,
            store,
            bridge,
            signer,
            credit_settlement,
            domain,
            config,
            locks: MutexRegistry::new(),
            topup_cache: DashMap::new(),
            pay_cache: DashMap::new(),
            closing: DashSet::new(),
        }
    }

    pub fn relayer_address(&self) -> Address {
        self.signer.address()
    }

    // ---- topup -----------------------------------------------------------

    /// Credits a channel from a settled shielded note, seeding the channel
    /// on its first call.
    #[instrument(skip_all, fields(request_id = %request.request_id, channel_id = %request.channel_id))]
    pub async fn topup(&self, request: TopupRequest) -> TopupResponse {
        if let Some(cached) = self.topup_cache.get(&request.request_id) {
            return cached.clone();
        }
        let _guard = self.locks.acquire(request.channel_id).await;
        if let Some(cached) = self.topup_cache.get(&request.request_id) {
            return cached.clone();
        }
        if let Some(stored) = self.stored_response::<TopupResponse>(&request.request_id).await {
            return stored;
        }

        match self.topup_inner(&request).await {
            Ok(response) => {
                self.persist_response(&request.request_id, &response).await;
                self.topup_cache.insert(request.request_id, response.clone());
                response
            }
            Err(error) => {
                let response = TopupResponse {
                    status: RelayStatus::Failed,
                    channel_id: request.channel_id,
                    next_state: None,
                    next_state_relayer_signature: None,
                    settlement_tx_hash: None,
                    amount_credited: None,
                    settled_nullifier: None,
                    failure_reason: Some(error.reason().to_string()),
                    failure_kind: Some(error.kind()),
                };
                // Retryable settlement failures are not cached so the same
                // request id can replay into the eventual success.
                if error.kind() != ErrorKind::Settlement {
                    self.persist_response(&request.request_id, &response).await;
                    self.topup_cache.insert(request.request_id, response.clone());
                }
                response
            }
        }
    }

    async fn topup_inner(&self, request: &TopupRequest) -> Result<TopupResponse, RelayerError> {
        let payload = &request.payment_payload;
        payload.validate_shape()?;
        let amount = word_amount(payload.amount_word())?;
        if amount == 0 {
            return Err(RelayerError::state("topup amount must be positive"));
        }

        // The topup challenge binds the relayer's own verifying contract.
        self.bridge.assert_live(&payload.challenge_hash, amount)?;

        let signed_json = serde_json::to_string(payload)
            .map_err(|e| RelayerError::internal(format!("payload serialization failed: {e}")))?;
        let payer =
            recover_message_signer(signed_json.as_bytes(), &request.payment_payload_signature)
                .map_err(|_| RelayerError::signature("invalid payment signature"))?;

        let expected_channel = derive_channel_id(
            self.config.chain_id,
            self.config.verifying_contract,
            payer,
            self.signer.address(),
        );
        if expected_channel != request.channel_id {
            return Err(RelayerError::signature("channel id does not match payer"));
        }

        if self.verifier.is_nullifier_used(&payload.nullifier).await? {
            return Err(RelayerError::nullifier("nullifier already used"));
        }
        if !self.verifier.is_known_root(&payload.root).await? {
            return Err(RelayerError::proof("unknown commitment root"));
        }
        if !self.verifier.verify_proof(payload).await? {
            return Err(RelayerError::proof("proof verification failed"));
        }

        let head = self.store.get_head(&request.channel_id).await?;
        match (&head, &request.latest_state) {
            (Some(head), Some(latest)) => {
                self.verify_signed_state(latest)?;
                if latest.state.channel_id != request.channel_id {
                    return Err(RelayerError::state("latestState channel mismatch"));
                }
                if latest.state.agent_address != payer {
                    return Err(RelayerError::signature("latestState agent does not match payer"));
                }
                if self.state_hash(&latest.state) != self.state_hash(&head.state) {
                    return Err(RelayerError::state(STALE_STATE_REASON));
                }
            }
            (Some(_), None) => {
                return Err(RelayerError::state(
                    "latestState required: channel head exists",
                ));
            }
            (None, Some(_)) => {
                return Err(RelayerError::state(
                    "latestState provided but channel has no head",
                ));
            }
            (None, None) => {}
        }

        let outcome = self.settlement.settle_onchain(payload).await?;
        if outcome.already_settled {
            return Err(RelayerError::nullifier("already settled onchain"));
        }
        self.verifier.mark_nullifier_used(&payload.nullifier).await?;

        if let Some(credit_settlement) = &self.credit_settlement {
            // Registration is advisory once the pool spend has landed; a
            // failure here must not strand the settled note.
            if let Err(e) = credit_settlement
                .open_or_topup(&request.channel_id, amount)
                .await
            {
                tracing::warn!(
                    channel_id = %request.channel_id,
                    error = %e.reason(),
                    "credit settlement registration failed"
                );
            }
        }

        let next_state = match &head {
            Some(head) => CreditState {
                channel_id: request.channel_id,
                seq: head.state.seq + 1,
                available: head.state.available + amount,
                cumulative_spent: head.state.cumulative_spent,
                last_debit_digest: payload.nullifier,
                updated_at: UnixTimestamp::now().as_secs(),
                agent_address: head.state.agent_address,
                relayer_address: head.state.relayer_address,
            },
            None => CreditState {
                channel_id: request.channel_id,
                seq: 0,
                available: amount,
                cumulative_spent: 0,
                last_debit_digest: payload.nullifier,
                updated_at: UnixTimestamp::now().as_secs(),
                agent_address: payer,
                relayer_address: self.signer.address(),
            },
        };
        let relayer_signature = self.signer.sign_credit_state(&next_state, &self.domain)?;
        self.store
            .put_head(&ChannelHead {
                state: next_state.clone(),
                relayer_signature: relayer_signature.clone(),
                agent_signature: None,
            })
            .await?;

        Ok(TopupResponse {
            status: RelayStatus::Done,
            channel_id: request.channel_id,
            next_state: Some(next_state),
            next_state_relayer_signature: Some(relayer_signature),
            settlement_tx_hash: outcome.tx_hash,
            amount_credited: Some(amount),
            settled_nullifier: Some(payload.nullifier),
            failure_reason: None,
            failure_kind: None,
        })
    }

    // ---- pay -------------------------------------------------------------

    /// Executes one signed debit: validate the state transition, forward to
    /// the merchant, mint and persist the next state.
    #[instrument(skip_all, fields(request_id = %request.request_id))]
    pub async fn pay(&self, request: CreditPayRequest) -> CreditPayResponse {
        let channel_id = request.latest_state.state.channel_id;
        if let Some(cached) = self.pay_cache.get(&request.request_id) {
            return cached.clone();
        }
        let _guard = self.locks.acquire(channel_id).await;
        if let Some(cached) = self.pay_cache.get(&request.request_id) {
            return cached.clone();
        }
        if let Some(stored) = self
            .stored_response::<CreditPayResponse>(&request.request_id)
            .await
        {
            return stored;
        }

        match self.pay_inner(&request, channel_id).await {
            Ok(response) => {
                self.persist_response(&request.request_id, &response).await;
                self.pay_cache.insert(request.request_id, response.clone());
                response
            }
            Err(error) => {
                let response = CreditPayResponse {
                    status: RelayStatus::Failed,
                    channel_id,
                    next_state: None,
                    next_state_relayer_signature: None,
                    merchant_result: None,
                    failure_reason: Some(error.reason().to_string()),
                    failure_kind: Some(error.kind()),
                };
                if error.kind() != ErrorKind::Settlement {
                    self.persist_response(&request.request_id, &response).await;
                    self.pay_cache.insert(request.request_id, response.clone());
                }
                response
            }
        }
    }

    async fn pay_inner(
        &self,
        request: &CreditPayRequest,
        channel_id: B256,
    ) -> Result<CreditPayResponse, RelayerError> {
        let mut requirement = request.requirement.clone();
        requirement.normalize();

        if self.closing.contains(&channel_id) {
            return Err(RelayerError::state("channel is closing"));
        }

        // Head CAS: the state the agent extends must be the durable head.
        let head = self
            .store
            .get_head(&channel_id)
            .await?
            .ok_or_else(|| RelayerError::state("no channel head exists for channel"))?;
        self.verify_signed_state(&request.latest_state)?;
        let state = &request.latest_state.state;
        if self.state_hash(state) != self.state_hash(&head.state) {
            return Err(RelayerError::state(STALE_STATE_REASON));
        }

        let intent = &request.debit_intent;
        if intent.channel_id != state.channel_id {
            return Err(RelayerError::state("debit intent channel mismatch"));
        }
        if intent.request_id != request.request_id {
            return Err(RelayerError::state("debit intent request id mismatch"));
        }

        let expected_binding = merchant_binding_digest(
            &request.merchant_request.url,
            &request.merchant_request.method,
            request.merchant_request.challenge_url.as_deref(),
            &requirement.scheme,
            &requirement.network,
            &requirement.asset,
            &format!("{:#x}", requirement.pay_to),
            requirement.amount,
        )?;
        if intent.merchant_request_hash != expected_binding {
            return Err(RelayerError::state(
                "debit intent does not bind this merchant request",
            ));
        }
        if intent.prev_state_hash != self.state_hash(state) {
            return Err(RelayerError::state("debit intent prev state hash mismatch"));
        }

        let intent_hash = typed_data::debit_intent_signing_hash(intent, &self.domain);
        let intent_signer =
            recover_prehash_signer(&intent_hash, &request.debit_intent_signature)
                .map_err(|_| RelayerError::signature("invalid debit intent signature"))?;
        if intent_signer != state.agent_address {
            return Err(RelayerError::signature("debit intent signer mismatch"));
        }

        if intent.next_seq != state.seq + 1 {
            return Err(RelayerError::state("non-contiguous debit sequence"));
        }
        if intent.amount != requirement.amount {
            return Err(RelayerError::state("debit amount does not match requirement"));
        }
        if intent.amount > state.available {
            return Err(RelayerError::state("insufficient channel balance"));
        }
        if UnixTimestamp::now().as_secs() > intent.deadline {
            return Err(RelayerError::state("debit intent deadline passed"));
        }

        // External write: the merchant forward. Any >= 400 is terminal and
        // the head does not advance.
        let forward_id = format!("{:x}", request.request_id);
        let merchant_result = self
            .payout
            .pay_merchant(PayoutCall {
                settlement_id: &forward_id,
                merchant_request: &request.merchant_request,
                requirement: &requirement,
                nullifier: intent.merchant_request_hash,
            })
            .await?;
        if merchant_result.status >= 400 {
            return Err(RelayerError::payout(format!(
                "merchant returned status {}",
                merchant_result.status
            )));
        }

        let next_state = CreditState {
            channel_id,
            seq: intent.next_seq,
            available: state.available - intent.amount,
            cumulative_spent: state.cumulative_spent + intent.amount,
            last_debit_digest: intent_digest(intent)?,
            updated_at: UnixTimestamp::now().as_secs(),
            agent_address: state.agent_address,
            relayer_address: state.relayer_address,
        };
        let relayer_signature = self.signer.sign_credit_state(&next_state, &self.domain)?;
        self.store
            .put_head(&ChannelHead {
                state: next_state.clone(),
                relayer_signature: relayer_signature.clone(),
                agent_signature: None,
            })
            .await?;

        Ok(CreditPayResponse {
            status: RelayStatus::Done,
            channel_id,
            next_state: Some(next_state),
            next_state_relayer_signature: Some(relayer_signature),
            merchant_result: Some(merchant_result),
            failure_reason: None,
            failure_kind: None,
        })
    }

    // ---- close -----------------------------------------------------------

    /// Starts an on-chain close from the current head.
    #[instrument(skip_all)]
    pub async fn close_start(&self, request: CloseStartRequest) -> CloseResponse {
        let channel_id = request.latest_state.state.channel_id;
        let _guard = self.locks.acquire(channel_id).await;
        match self.close_start_inner(&request, channel_id).await {
            Ok(tx_hash) => CloseResponse {
                status: RelayStatus::Done,
                channel_id,
                tx_hash: Some(tx_hash),
                failure_reason: None,
                failure_kind: None,
            },
            Err(error) => Self::close_failure(channel_id, error),
        }
    }

    async fn close_start_inner(
        &self,
        request: &CloseStartRequest,
        channel_id: B256,
    ) -> Result<B256, RelayerError> {
        let head = self
            .store
            .get_head(&channel_id)
            .await?
            .ok_or_else(|| RelayerError::state("no channel head exists for channel"))?;
        self.verify_signed_state(&request.latest_state)?;
        let state = &request.latest_state.state;
        if self.state_hash(state) != self.state_hash(&head.state) {
            return Err(RelayerError::state(STALE_STATE_REASON));
        }
        let contract = self.require_credit_settlement()?;
        let tx_hash = contract
            .start_close(&channel_id, state.seq, state.available)
            .await?;
        self.closing.insert(channel_id);
        Ok(tx_hash)
    }

    /// Answers an in-flight close with a later state. The challenged state
    /// must not be behind the durable head; a strictly newer one also
    /// advances the head.
    #[instrument(skip_all)]
    pub async fn close_challenge(&self, request: CloseChallengeRequest) -> CloseResponse {
        let channel_id = request.higher_state.state.channel_id;
        let _guard = self.locks.acquire(channel_id).await;
        match self.close_challenge_inner(&request, channel_id).await {
            Ok(tx_hash) => CloseResponse {
                status: RelayStatus::Done,
                channel_id,
                tx_hash: Some(tx_hash),
                failure_reason: None,
                failure_kind: None,
            },
            Err(error) => Self::close_failure(channel_id, error),
        }
    }

    async fn close_challenge_inner(
        &self,
        request: &CloseChallengeRequest,
        channel_id: B256,
    ) -> Result<B256, RelayerError> {
        self.verify_signed_state(&request.higher_state)?;
        let state = &request.higher_state.state;
        let head = self.store.get_head(&channel_id).await?;
        if let Some(head) = &head
            && state.seq < head.state.seq
        {
            return Err(RelayerError::state("challenge state behind channel head"));
        }
        let contract = self.require_credit_settlement()?;
        let tx_hash = contract
            .challenge_close(&channel_id, state.seq, state.available)
            .await?;
        let advances = head
            .as_ref()
            .map(|head| state.seq > head.state.seq)
            .unwrap_or(true);
        if advances {
            self.store
                .put_head(&ChannelHead {
                    state: state.clone(),
                    relayer_signature: request.higher_state.relayer_signature.clone(),
                    agent_signature: Some(request.higher_state.agent_signature.clone()),
                })
                .await?;
        }
        self.closing.insert(channel_id);
        Ok(tx_hash)
    }

    /// Finalizes a close and retires the channel head.
    #[instrument(skip_all)]
    pub async fn close_finalize(&self, request: CloseFinalizeRequest) -> CloseResponse {
        let channel_id = request.channel_id;
        let _guard = self.locks.acquire(channel_id).await;
        match self.close_finalize_inner(channel_id).await {
            Ok(tx_hash) => CloseResponse {
                status: RelayStatus::Done,
                channel_id,
                tx_hash: Some(tx_hash),
                failure_reason: None,
                failure_kind: None,
            },
            Err(error) => Self::close_failure(channel_id, error),
        }
    }

    async fn close_finalize_inner(&self, channel_id: B256) -> Result<B256, RelayerError> {
        if !self.closing.contains(&channel_id) {
            return Err(RelayerError::state("channel is not closing"));
        }
        let contract = self.require_credit_settlement()?;
        let tx_hash = contract.finalize_close(&channel_id).await?;
        self.store.delete_head(&channel_id).await?;
        self.closing.remove(&channel_id);
        Ok(tx_hash)
    }

    /// Current channel visibility for `GET /v1/relay/credit/close/{id}`.
    pub async fn status(&self, channel_id: &B256) -> Result<ChannelStatus, RelayerError> {
        let head = self.store.get_head(channel_id).await?;
        Ok(ChannelStatus {
            exists: head.is_some(),
            closing: self.closing.contains(channel_id),
            seq: head.as_ref().map(|head| head.state.seq),
            available: head.as_ref().map(|head| head.state.available),
        })
    }

    // ---- shared ----------------------------------------------------------

    fn state_hash(&self, state: &CreditState) -> B256 {
        typed_data::credit_state_signing_hash(state, &self.domain)
    }

    /// Both signatures on an incoming state must recover their declared
    /// parties: the agent of the state, and this relayer.
    fn verify_signed_state(&self, signed: &SignedCreditState) -> Result<(), RelayerError> {
        let hash = self.state_hash(&signed.state);
        let agent = recover_prehash_signer(&hash, &signed.agent_signature)
            .map_err(|_| RelayerError::signature("invalid agent signature on latestState"))?;
        if agent != signed.state.agent_address {
            return Err(RelayerError::signature(
                "latestState agent signature mismatch",
            ));
        }
        let relayer = recover_prehash_signer(&hash, &signed.relayer_signature)
            .map_err(|_| RelayerError::signature("invalid relayer signature on latestState"))?;
        if relayer != self.signer.address() {
            return Err(RelayerError::signature(
                "latestState relayer signature mismatch",
            ));
        }
        Ok(())
    }

    fn require_credit_settlement(&self) -> Result<&Arc<dyn CreditSettlement>, RelayerError> {
        self.credit_settlement
            .as_ref()
            .ok_or_else(|| RelayerError::state("credit settlement is not configured"))
    }

    fn close_failure(channel_id: B256, error: RelayerError) -> CloseResponse {
        CloseResponse {
            status: RelayStatus::Failed,
            channel_id,
            tx_hash: None,
            failure_reason: Some(error.reason().to_string()),
            failure_kind: Some(error.kind()),
        }
    }

    async fn stored_response<T: DeserializeOwned>(&self, request_id: &B256) -> Option<T> {
        match self.store.get_response(request_id).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "stored response lookup failed");
                None
            }
        }
    }

    async fn persist_response<T: Serialize>(&self, request_id: &B256, response: &T) {
        match serde_json::to_value(response) {
            Ok(value) => {
                if let Err(e) = self.store.put_response(request_id, &value).await {
                    tracing::error!(error = %e, "failed to persist terminal response");
                }
            }
            Err(e) => tracing::error!(error = %e, "response serialization failed"),
        }
    }
}

/// Decodes a big-endian amount word into micro-units.
fn word_amount(word: &B256) -> Result<u128, RelayerError> {
    let value = U256::from_be_bytes(word.0);
    u128::try_from(value).map_err(|_| RelayerError::state("amount word exceeds u128"))
}
