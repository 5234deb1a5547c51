//! Stable error kinds for the payment-processing engine.
//!
//! Every per-request failure is classified into one of the kinds below and
//! carries a stable, human-readable reason string. Processors catch these at
//! their boundary and convert them into `{status: FAILED, failureReason}`
//! responses; the HTTP layer maps the kind to a status code and preserves
//! the reason verbatim for the agent.

use serde::{Deserialize, Serialize};

use crate::crypto::SignatureRecoveryError;
use crate::crypto::canonical::CanonicalError;
use crate::proto::ProtocolError;

/// Classification of a relayer failure.
///
/// Only [`ErrorKind::Settlement`] is retryable with the same request id;
/// every other kind is terminal for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed envelope, invalid hex, unsupported rail, wrong version.
    Protocol,
    /// Challenge expired, nonce unknown, challenge-hash or amount mismatch.
    Challenge,
    /// Bad ECDSA recovery, bad typed-data signer, mismatched agent address.
    Signature,
    /// Stale `latestState`, non-contiguous seq, insufficient available,
    /// intent deadline passed.
    State,
    /// Nullifier already used.
    Nullifier,
    /// Proof verification returned false or the contract rejected the spend.
    Proof,
    /// On-chain RPC failure.
    Settlement,
    /// Merchant returned >= 400 or a network error; never rolled back.
    Payout,
    /// Unexpected invariant violation.
    Internal,
}

/// A classified relayer failure with its stable reason string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct RelayerError {
    kind: ErrorKind,
    reason: String,
}

impl RelayerError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, reason)
    }

    pub fn challenge(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Challenge, reason)
    }

    pub fn signature(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Signature, reason)
    }

    pub fn state(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, reason)
    }

    pub fn nullifier(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Nullifier, reason)
    }

    pub fn proof(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Proof, reason)
    }

    pub fn settlement(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Settlement, reason)
    }

    pub fn payout(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Payout, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, reason)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The stable reason string surfaced to the agent.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether the agent may retry with the same request id.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Settlement
    }
}

impl From<ProtocolError> for RelayerError {
    fn from(value: ProtocolError) -> Self {
        Self::protocol(value.to_string())
    }
}

impl From<SignatureRecoveryError> for RelayerError {
    fn from(value: SignatureRecoveryError) -> Self {
        Self::signature(value.to_string())
    }
}

impl From<CanonicalError> for RelayerError {
    fn from(value: CanonicalError) -> Self {
        Self::internal(value.to_string())
    }
}
