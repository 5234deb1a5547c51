//! EIP-712 signing payloads for the credit rail.
//!
//! Credit states and debit intents are signed as typed data under a fixed
//! domain `{name: "shielded-x402", version: "1", chainId, verifyingContract}`.
//! The signing hash of a [`CreditState`] doubles as the state hash used for
//! head CAS and `prevStateHash` chaining, so both parties derive it from the
//! same struct encoding.

use alloy_primitives::{Address, B256};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain, sol};

use crate::credit;

/// EIP-712 domain name shared by both rails.
pub const EIP712_NAME: &str = "shielded-x402";
/// EIP-712 domain version.
pub const EIP712_VERSION: &str = "1";

sol! {
    /// Typed-data mirror of [`credit::CreditState`].
    struct CreditState {
        bytes32 channelId;
        uint64 seq;
        uint128 available;
        uint128 cumulativeSpent;
        bytes32 lastDebitDigest;
        uint64 updatedAt;
        address agentAddress;
        address relayerAddress;
    }

    /// Typed-data mirror of [`credit::CreditDebitIntent`].
    struct CreditDebitIntent {
        bytes32 channelId;
        bytes32 requestId;
        uint64 nextSeq;
        uint128 amount;
        bytes32 merchantRequestHash;
        bytes32 prevStateHash;
        uint64 deadline;
    }
}

/// The signing domain for a given chain and settlement contract.
pub fn credit_domain(chain_id: u64, verifying_contract: Address) -> Eip712Domain {
    eip712_domain! {
        name: EIP712_NAME,
        version: EIP712_VERSION,
        chain_id: chain_id,
        verifying_contract: verifying_contract,
    }
}

/// EIP-712 signing hash of a credit state; also its canonical state hash.
pub fn credit_state_signing_hash(state: &credit::CreditState, domain: &Eip712Domain) -> B256 {
    let typed = CreditState {
        channelId: state.channel_id,
        seq: state.seq,
        available: state.available,
        cumulativeSpent: state.cumulative_spent,
        lastDebitDigest: state.last_debit_digest,
        updatedAt: state.updated_at,
        agentAddress: state.agent_address,
        relayerAddress: state.relayer_address,
    };
    typed.eip712_signing_hash(domain)
}

/// EIP-712 signing hash of a debit intent.
pub fn debit_intent_signing_hash(
    intent: &credit::CreditDebitIntent,
    domain: &Eip712Domain,
) -> B256 {
    let typed = CreditDebitIntent {
        channelId: intent.channel_id,
        requestId: intent.request_id,
        nextSeq: intent.next_seq,
        amount: intent.amount,
        merchantRequestHash: intent.merchant_request_hash,
        prevStateHash: intent.prev_state_hash,
        deadline: intent.deadline,
    };
    typed.eip712_signing_hash(domain)
}
