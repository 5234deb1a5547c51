//! Canonical records for the credit-sequencer wire contract.
//!
//! The multi-chain sequencer's ledger service is an external collaborator;
//! the relayer only speaks its wire contract. That contract consists of
//! tag-prefixed canonical encodings for debit intents, authorizations, and
//! execution reports, plus a depth-32 inclusion tree over authorization
//! leaves.

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

use crate::credit::CreditDebitIntent;
use crate::crypto::canonical::{
    CanonicalError, Encoder, TAG_AUTH_LEAF, TAG_AUTHORIZATION, TAG_EXECUTION_REPORT, TAG_INTENT,
};
use crate::crypto::{address_word, amount_word};

/// A sequencer-side authorization of one executed debit.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencerAuthorization {
    pub channel_id: B256,
    #[serde_as(as = "DisplayFromStr")]
    pub seq: u64,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
    pub merchant_request_hash: B256,
    pub agent_address: Address,
    pub relayer_address: Address,
    #[serde_as(as = "DisplayFromStr")]
    pub deadline: u64,
}

/// The relayer's report of how a debit executed against the merchant.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub request_id: B256,
    pub channel_id: B256,
    #[serde_as(as = "DisplayFromStr")]
    pub seq: u64,
    pub merchant_status: u16,
    pub payout_reference: String,
    #[serde_as(as = "DisplayFromStr")]
    pub settled_at: u64,
}

/// Canonical digest of a debit intent (`lastDebitDigest`).
pub fn intent_digest(intent: &CreditDebitIntent) -> Result<B256, CanonicalError> {
    let mut enc = Encoder::new(TAG_INTENT)?;
    enc.push_word(&intent.channel_id);
    enc.push_word(&intent.request_id);
    enc.push_u64(intent.next_seq);
    enc.push_word(&amount_word(intent.amount));
    enc.push_word(&intent.merchant_request_hash);
    enc.push_word(&intent.prev_state_hash);
    enc.push_u64(intent.deadline);
    Ok(enc.digest())
}

/// Canonical digest of a sequencer authorization.
pub fn authorization_digest(auth: &SequencerAuthorization) -> Result<B256, CanonicalError> {
    let mut enc = Encoder::new(TAG_AUTHORIZATION)?;
    enc.push_word(&auth.channel_id);
    enc.push_u64(auth.seq);
    enc.push_word(&amount_word(auth.amount));
    enc.push_word(&auth.merchant_request_hash);
    enc.push_word(&address_word(auth.agent_address));
    enc.push_word(&address_word(auth.relayer_address));
    enc.push_u64(auth.deadline);
    Ok(enc.digest())
}

/// Leaf of the sequencer inclusion tree for one authorization.
pub fn authorization_leaf(auth: &SequencerAuthorization) -> Result<B256, CanonicalError> {
    let digest = authorization_digest(auth)?;
    let mut enc = Encoder::new(TAG_AUTH_LEAF)?;
    enc.push_word(&auth.channel_id);
    enc.push_u64(auth.seq);
    enc.push_word(&digest);
    Ok(enc.digest())
}

/// Canonical digest of an execution report.
pub fn execution_report_digest(report: &ExecutionReport) -> Result<B256, CanonicalError> {
    let mut enc = Encoder::new(TAG_EXECUTION_REPORT)?;
    enc.push_word(&report.request_id);
    enc.push_word(&report.channel_id);
    enc.push_u64(report.seq);
    enc.push_u64(u64::from(report.merchant_status));
    enc.push_str(&report.payout_reference)?;
    enc.push_u64(report.settled_at);
    Ok(enc.digest())
}
