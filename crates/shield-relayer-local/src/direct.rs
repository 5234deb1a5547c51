//! Direct shielded-payment processor.
//!
//! `handle_pay` drives one proof-carrying payment end to end:
//! verify → settle → payout, with the settlement record written after every
//! stage. Requests are serialized per idempotency key; a repeated request
//! replays the stored terminal response without touching the chain or the
//! merchant, and a crash between settlement and payout resumes at payout.
//!
//! Validation order (each violation fails with a stable reason and no side
//! effects beyond the record trail): envelope shape, challenge binding,
//! merchant-terms refetch, payer signature, nullifier uniqueness, proof.

use alloy_primitives::{B256, keccak256};
use std::sync::Arc;
use tracing::instrument;

use shield_types::crypto::{amount_word, challenge_hash, recover_message_signer};
use shield_types::error::{ErrorKind, RelayerError};
use shield_types::proto::relay::{PayRequest, PayResponse, RelayStatus};
use shield_types::proto::{PaymentSignatureEnvelope, SCHEME_EXACT, decode_payment_signature};
use shield_types::timestamp::UnixTimestamp;

use crate::challenge::ChallengeBridge;
use crate::locks::MutexRegistry;
use crate::payout::{PayoutAdapter, PayoutCall};
use crate::pool::{ProofVerifier, SettlementSubmitter};
use crate::store::{SettlementRecord, SettlementStatus, SettlementStore};

#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Re-fetch the merchant challenge before settling and refuse on drift.
    pub refetch_challenge: bool,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            refetch_challenge: true,
        }
    }
}

pub struct DirectProcessor {
    verifier: Arc<dyn ProofVerifier>,
    settlement: Arc<dyn SettlementSubmitter>,
    payout: Arc<PayoutAdapter>,
    store: Arc<dyn SettlementStore>,
    bridge: Arc<ChallengeBridge>,
    locks: MutexRegistry<String>,
    config: DirectConfig,
}

impl DirectProcessor {
    pub fn new(
        verifier: Arc<dyn ProofVerifier>,
        settlement: Arc<dyn SettlementSubmitter>,
        payout: Arc<PayoutAdapter>,
        store: Arc<dyn SettlementStore>,
        bridge: Arc<ChallengeBridge>,
        config: DirectConfig,
    ) -> Self {
        Self {
            verifier,
            settlement,
            payout,
            store,
            bridge,
            locks: MutexRegistry::new(),
            config,
        }
    }

    /// Processes one direct payment. Never returns an error: every failure
    /// becomes a `FAILED` response with its reason preserved verbatim.
    #[instrument(skip_all)]
    pub async fn handle_pay(&self, request: PayRequest) -> PayResponse {
        let idempotency_key = request
            .idempotency_key
            .clone()
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| {
                format!(
                    "{:x}",
                    keccak256(request.payment_signature_header.as_bytes())
                )
            });

        let _guard = self.locks.acquire(idempotency_key.clone()).await;

        let existing = match self.store.get_by_idempotency_key(&idempotency_key).await {
            Ok(existing) => existing,
            Err(e) => return Self::unrecorded_failure(RelayerError::from(e)),
        };
        if let Some(record) = existing {
            if record.status.is_terminal()
                && let Some(response) = record.pay_response.clone()
            {
                return response;
            }
            return self.resume(record, &request).await;
        }

        let mut record = SettlementRecord {
            settlement_id: Self::new_settlement_id(),
            idempotency_key,
            status: SettlementStatus::Received,
            nullifier: B256::ZERO,
            root: B256::ZERO,
            settlement_tx_hash: None,
            merchant_leaf_index: None,
            change_leaf_index: None,
            merchant_result: None,
            failure_reason: None,
            created_at: UnixTimestamp::now(),
            pay_response: None,
        };
        if let Err(e) = self.store.put(&record).await {
            return Self::unrecorded_failure(RelayerError::from(e));
        }

        match self.run(&mut record, &request, false).await {
            Ok(response) => response,
            Err(error) => self.fail(&mut record, error).await,
        }
    }

    /// Picks the pipeline up wherever the record stopped.
    async fn resume(&self, mut record: SettlementRecord, request: &PayRequest) -> PayResponse {
        tracing::info!(
            settlement_id = %record.settlement_id,
            status = ?record.status,
            "resuming settlement record"
        );
        let result = match record.status {
            SettlementStatus::Received | SettlementStatus::Verified => {
                self.run(&mut record, request, false).await
            }
            SettlementStatus::SentOnchain => self.run(&mut record, request, true).await,
            SettlementStatus::Confirmed => self.payout_stage(&mut record, request).await,
            SettlementStatus::PaidMerchant | SettlementStatus::Done | SettlementStatus::Failed => {
                Ok(record.pay_response.clone().unwrap_or_else(|| {
                    Self::response_from_record(&record)
                }))
            }
        };
        match result {
            Ok(response) => response,
            Err(error) => self.fail(&mut record, error).await,
        }
    }

    async fn run(
        &self,
        record: &mut SettlementRecord,
        request: &PayRequest,
        resumed_settle: bool,
    ) -> Result<PayResponse, RelayerError> {
        // A record that already reached SENT_ONCHAIN passed every check
        // once; re-running them would trip over our own side effects (the
        // settled nullifier, an expired challenge). Only the payload itself
        // is re-derived from the request.
        let envelope = if resumed_settle {
            self.reload_envelope(record, request)?
        } else {
            self.validate(record, request).await?
        };
        self.settle(record, &envelope, resumed_settle).await?;
        self.payout_stage(record, request).await
    }

    /// Re-decodes the envelope of an in-flight record and pins it to the
    /// payload the record was opened for.
    fn reload_envelope(
        &self,
        record: &SettlementRecord,
        request: &PayRequest,
    ) -> Result<PaymentSignatureEnvelope, RelayerError> {
        let envelope = decode_payment_signature(&request.payment_signature_header)?;
        envelope.payload.validate_shape()?;
        if envelope.payload.nullifier != record.nullifier {
            return Err(RelayerError::internal(
                "resumed request does not match the original payload",
            ));
        }
        Ok(envelope)
    }

    /// Stages 1-6: shape, challenge binding, refetch, signature, nullifier,
    /// proof. No side effects besides the record trail.
    async fn validate(
        &self,
        record: &mut SettlementRecord,
        request: &PayRequest,
    ) -> Result<PaymentSignatureEnvelope, RelayerError> {
        let mut requirement = request.requirement.clone();
        requirement.normalize();
        requirement.ensure_shielded()?;
        if requirement.scheme != SCHEME_EXACT {
            return Err(RelayerError::protocol(format!(
                "unsupported scheme `{}`",
                requirement.scheme
            )));
        }

        let envelope = decode_payment_signature(&request.payment_signature_header)?;
        let payload = &envelope.payload;
        payload.validate_shape()?;
        record.nullifier = payload.nullifier;
        record.root = payload.root;

        // Challenge binding: the payload answers exactly the challenge this
        // relayer issued for these terms.
        if envelope.challenge_nonce != requirement.challenge_nonce {
            return Err(RelayerError::challenge("challenge nonce mismatch"));
        }
        let expected = challenge_hash(
            &requirement.challenge_nonce,
            requirement.amount,
            requirement.verifying_contract,
        );
        if payload.challenge_hash != expected {
            return Err(RelayerError::challenge("challenge hash mismatch"));
        }
        if *payload.amount_word() != amount_word(requirement.amount) {
            return Err(RelayerError::challenge("challenge amount mismatch"));
        }
        if requirement.challenge_expiry < UnixTimestamp::now().as_secs() {
            return Err(RelayerError::challenge("challenge expired"));
        }
        let issued = self.bridge.assert_live(&expected, requirement.amount)?;

        if self.config.refetch_challenge {
            let terms = self.bridge.refetch_terms(&request.merchant_request).await?;
            if terms.terms_hash() != issued.upstream_terms_hash {
                return Err(RelayerError::challenge("merchant challenge mismatch"));
            }
        }

        let signed_json = envelope.signed_payload_json()?;
        let payer = recover_message_signer(signed_json.as_bytes(), &envelope.signature)
            .map_err(|_| RelayerError::signature("invalid payment signature"))?;
        tracing::debug!(payer = %payer, "recovered payment signer");

        if self.verifier.is_nullifier_used(&payload.nullifier).await? {
            return Err(RelayerError::nullifier("nullifier already used"));
        }
        if !self.verifier.is_known_root(&payload.root).await? {
            return Err(RelayerError::proof("unknown commitment root"));
        }
        if !self.verifier.verify_proof(payload).await? {
            return Err(RelayerError::proof("proof verification failed"));
        }

        record.status = SettlementStatus::Verified;
        self.store.put(record).await?;
        Ok(envelope)
    }

    /// Stage 7: submit the spend. In the resume path a nullifier conflict
    /// means our earlier submission landed and the pipeline continues; on a
    /// fresh request it is a replayed note and the payment is refused.
    async fn settle(
        &self,
        record: &mut SettlementRecord,
        envelope: &PaymentSignatureEnvelope,
        resumed: bool,
    ) -> Result<(), RelayerError> {
        record.status = SettlementStatus::SentOnchain;
        self.store.put(record).await?;

        let outcome = self.settlement.settle_onchain(&envelope.payload).await?;
        if outcome.already_settled && !resumed {
            return Err(RelayerError::nullifier("already settled onchain"));
        }
        self.verifier
            .mark_nullifier_used(&envelope.payload.nullifier)
            .await?;

        record.status = SettlementStatus::Confirmed;
        record.settlement_tx_hash = outcome.tx_hash.or(record.settlement_tx_hash);
        record.merchant_leaf_index = outcome.merchant_leaf_index.or(record.merchant_leaf_index);
        record.change_leaf_index = outcome.change_leaf_index.or(record.change_leaf_index);
        self.store.put(record).await?;
        Ok(())
    }

    /// Stage 8: the merchant forward. Settlement is never rolled back from
    /// here: a merchant error leaves the record at `PAID_MERCHANT` with the
    /// reason surfaced, and the stored response replays on retries.
    async fn payout_stage(
        &self,
        record: &mut SettlementRecord,
        request: &PayRequest,
    ) -> Result<PayResponse, RelayerError> {
        let call = PayoutCall {
            settlement_id: &record.settlement_id,
            merchant_request: &request.merchant_request,
            requirement: &request.requirement,
            nullifier: record.nullifier,
        };
        let response = match self.payout.pay_merchant(call).await {
            Ok(result) => {
                record.merchant_result = Some(result.clone());
                if result.status < 400 {
                    record.status = SettlementStatus::Done;
                    record.failure_reason = None;
                    PayResponse {
                        status: RelayStatus::Done,
                        settlement_id: record.settlement_id.clone(),
                        settlement_tx_hash: record.settlement_tx_hash,
                        merchant_leaf_index: record.merchant_leaf_index,
                        change_leaf_index: record.change_leaf_index,
                        merchant_result: Some(result),
                        failure_reason: None,
                        failure_kind: None,
                    }
                } else {
                    let reason = format!("merchant returned status {}", result.status);
                    record.status = SettlementStatus::PaidMerchant;
                    record.failure_reason = Some(reason.clone());
                    PayResponse {
                        status: RelayStatus::Failed,
                        settlement_id: record.settlement_id.clone(),
                        settlement_tx_hash: record.settlement_tx_hash,
                        merchant_leaf_index: record.merchant_leaf_index,
                        change_leaf_index: record.change_leaf_index,
                        merchant_result: Some(result),
                        failure_reason: Some(reason),
                        failure_kind: Some(ErrorKind::Payout),
                    }
                }
            }
            Err(error) => {
                // Settled on-chain but the merchant call never completed;
                // record it so the agent can reconcile out-of-band.
                let reason = error.reason().to_string();
                record.status = SettlementStatus::PaidMerchant;
                record.failure_reason = Some(reason.clone());
                PayResponse {
                    status: RelayStatus::Failed,
                    settlement_id: record.settlement_id.clone(),
                    settlement_tx_hash: record.settlement_tx_hash,
                    merchant_leaf_index: record.merchant_leaf_index,
                    change_leaf_index: record.change_leaf_index,
                    merchant_result: None,
                    failure_reason: Some(reason),
                    failure_kind: Some(ErrorKind::Payout),
                }
            }
        };
        record.pay_response = Some(response.clone());
        self.store.put(record).await?;
        Ok(response)
    }

    /// Converts a pipeline error into a terminal `FAILED` record, except for
    /// retryable settlement errors which leave the record where it was so
    /// the same request id can retry into the eventual success.
    async fn fail(&self, record: &mut SettlementRecord, error: RelayerError) -> PayResponse {
        let response = PayResponse {
            status: RelayStatus::Failed,
            settlement_id: record.settlement_id.clone(),
            settlement_tx_hash: record.settlement_tx_hash,
            merchant_leaf_index: record.merchant_leaf_index,
            change_leaf_index: record.change_leaf_index,
            merchant_result: record.merchant_result.clone(),
            failure_reason: Some(error.reason().to_string()),
            failure_kind: Some(error.kind()),
        };
        if error.kind() == ErrorKind::Settlement {
            tracing::warn!(
                settlement_id = %record.settlement_id,
                reason = %error.reason(),
                "retryable settlement failure"
            );
            return response;
        }
        record.status = SettlementStatus::Failed;
        record.failure_reason = Some(error.reason().to_string());
        record.pay_response = Some(response.clone());
        if let Err(e) = self.store.put(record).await {
            tracing::error!(
                settlement_id = %record.settlement_id,
                error = %e,
                "failed to persist terminal record"
            );
        }
        response
    }

    fn response_from_record(record: &SettlementRecord) -> PayResponse {
        PayResponse {
            status: if record.status == SettlementStatus::Done {
                RelayStatus::Done
            } else {
                RelayStatus::Failed
            },
            settlement_id: record.settlement_id.clone(),
            settlement_tx_hash: record.settlement_tx_hash,
            merchant_leaf_index: record.merchant_leaf_index,
            change_leaf_index: record.change_leaf_index,
            merchant_result: record.merchant_result.clone(),
            failure_reason: record.failure_reason.clone(),
            failure_kind: record.failure_reason.as_ref().map(|_| {
                if record.status == SettlementStatus::PaidMerchant {
                    ErrorKind::Payout
                } else {
                    ErrorKind::Internal
                }
            }),
        }
    }

    fn unrecorded_failure(error: RelayerError) -> PayResponse {
        PayResponse {
            status: RelayStatus::Failed,
            settlement_id: String::new(),
            settlement_tx_hash: None,
            merchant_leaf_index: None,
            change_leaf_index: None,
            merchant_result: None,
            failure_reason: Some(error.reason().to_string()),
            failure_kind: Some(error.kind()),
        }
    }

    fn new_settlement_id() -> String {
        let entropy = B256::random();
        format!("stl_{}", &format!("{entropy:x}")[..32])
    }
}
