//! Credit-channel state and debit intents.
//!
//! A credit channel is a strictly linear log of [`CreditState`]s signed by
//! both parties. The agent tops the channel up once with a shielded proof,
//! then authorizes many sub-second debits by signing [`CreditDebitIntent`]s;
//! the relayer validates each transition, counter-signs the next state, and
//! stores it as the durable channel head before replying.
//!
//! Numeric fields serialize as decimal strings (agents are JavaScript and
//! cannot hold u64/u128 in a Number).

use alloy_primitives::{Address, B256, Bytes};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

/// One accepted state of a credit channel.
///
/// Successive accepted states have contiguous `seq`, conserve value
/// (`available` decreases exactly by what `cumulative_spent` gains), and
/// chain through `last_debit_digest`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditState {
    pub channel_id: B256,
    #[serde_as(as = "DisplayFromStr")]
    pub seq: u64,
    #[serde_as(as = "DisplayFromStr")]
    pub available: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub cumulative_spent: u128,
    /// Digest of the debit intent that produced this state; on topup, the
    /// nullifier of the settled note.
    pub last_debit_digest: B256,
    #[serde_as(as = "DisplayFromStr")]
    pub updated_at: u64,
    pub agent_address: Address,
    pub relayer_address: Address,
}

/// A credit state carrying both parties' EIP-712 signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedCreditState {
    pub state: CreditState,
    pub agent_signature: Bytes,
    pub relayer_signature: Bytes,
}

/// The durable head of a channel as the relayer stores it.
///
/// Immediately after the relayer mints a state the agent has not yet
/// countersigned it, so the agent signature is optional here while both
/// signatures are mandatory on incoming [`SignedCreditState`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHead {
    pub state: CreditState,
    pub relayer_signature: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_signature: Option<Bytes>,
}

/// An agent-signed instruction to debit the channel for one merchant call.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditDebitIntent {
    pub channel_id: B256,
    pub request_id: B256,
    #[serde_as(as = "DisplayFromStr")]
    pub next_seq: u64,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
    /// Binding over the merchant request and the terms it executes under.
    pub merchant_request_hash: B256,
    /// Hash of the state this intent extends (head CAS).
    pub prev_state_hash: B256,
    #[serde_as(as = "DisplayFromStr")]
    pub deadline: u64,
}
