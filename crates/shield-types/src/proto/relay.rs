//! Request and response bodies of the relay endpoints.
//!
//! These are the shapes the agent SDK exchanges with
//! `POST /v1/relay/pay`, `POST /v1/relay/challenge`, and the
//! `/v1/relay/credit/*` family. Terminal outcomes are always
//! `{status: DONE | FAILED, ...}` with the failure reason preserved
//! verbatim.

use alloy_primitives::{B256, Bytes};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use std::collections::BTreeMap;

use crate::credit::{CreditDebitIntent, CreditState, SignedCreditState};
use crate::error::ErrorKind;
use crate::proto::{PaymentRequirement, ShieldedPaymentPayload};

/// Terminal status of a processed relay request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayStatus {
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAILED")]
    Failed,
}

/// The agent's original merchant call, replayed by the relayer after
/// settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantRequest {
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_base64: Option<String>,
    /// Where the merchant's 402 challenge is fetched, when it differs from
    /// the paid URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_url: Option<String>,
}

/// Outcome of one merchant forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantResult {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub body_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_reference: Option<String>,
}

/// Body of `POST /v1/relay/pay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayRequest {
    pub merchant_request: MerchantRequest,
    pub requirement: PaymentRequirement,
    /// The agent's `PAYMENT-SIGNATURE` header, verbatim.
    pub payment_signature_header: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Body of the `POST /v1/relay/pay` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayResponse {
    pub status: RelayStatus,
    pub settlement_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_tx_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_leaf_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_leaf_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_result: Option<MerchantResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Error classification backing the HTTP status mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
}

/// Body of `POST /v1/relay/challenge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub merchant_request: MerchantRequest,
    /// The merchant's own `PAYMENT-REQUIRED` header if the agent already
    /// holds one; used for drift detection only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_payment_required_header: Option<String>,
}

/// Body of the `POST /v1/relay/challenge` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub requirement: PaymentRequirement,
    pub payment_required_header: String,
}

/// Body of `POST /v1/relay/credit/topup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopupRequest {
    pub request_id: B256,
    pub channel_id: B256,
    pub payment_payload: ShieldedPaymentPayload,
    /// EIP-191 signature over the canonical JSON of `paymentPayload`.
    pub payment_payload_signature: Bytes,
    /// The current head as the agent sees it; absent on the seeding topup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_state: Option<SignedCreditState>,
}

/// Body of the `POST /v1/relay/credit/topup` response.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopupResponse {
    pub status: RelayStatus,
    pub channel_id: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_state: Option<CreditState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_state_relayer_signature: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_tx_hash: Option<B256>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_credited: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_nullifier: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
}

/// Body of `POST /v1/relay/credit/pay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPayRequest {
    pub request_id: B256,
    pub latest_state: SignedCreditState,
    pub debit_intent: CreditDebitIntent,
    /// EIP-712 signature by the channel's agent over the intent.
    pub debit_intent_signature: Bytes,
    pub merchant_request: MerchantRequest,
    pub requirement: PaymentRequirement,
}

/// Body of the `POST /v1/relay/credit/pay` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPayResponse {
    pub status: RelayStatus,
    pub channel_id: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_state: Option<CreditState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_state_relayer_signature: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_result: Option<MerchantResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
}

/// Body of `POST /v1/relay/credit/close/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseStartRequest {
    pub latest_state: SignedCreditState,
}

/// Body of `POST /v1/relay/credit/close/challenge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseChallengeRequest {
    pub higher_state: SignedCreditState,
}

/// Body of `POST /v1/relay/credit/close/finalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseFinalizeRequest {
    pub channel_id: B256,
}

/// Body of every `close/*` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseResponse {
    pub status: RelayStatus,
    pub channel_id: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
}

/// Body of `GET /v1/relay/credit/close/{channelId}`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub exists: bool,
    pub closing: bool,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<u128>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_status_tokens() {
        assert_eq!(serde_json::to_string(&RelayStatus::Done).unwrap(), "\"DONE\"");
        assert_eq!(
            serde_json::to_string(&RelayStatus::Failed).unwrap(),
            "\"FAILED\""
        );
    }

    #[test]
    fn test_channel_status_serializes_numbers_as_strings() {
        let status = ChannelStatus {
            exists: true,
            closing: false,
            seq: Some(2),
            available: Some(80),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["seq"], "2");
        assert_eq!(json["available"], "80");
    }

    #[test]
    fn test_merchant_request_minimal_shape() {
        let request: MerchantRequest = serde_json::from_str(
            r#"{"url": "https://api.example/data", "method": "GET"}"#,
        )
        .unwrap();
        assert!(request.headers.is_empty());
        assert!(request.challenge_url.is_none());
    }
}
