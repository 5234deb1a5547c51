//! Wire format types for the shielded x402 protocol.
//!
//! Two header envelopes travel between agent, relayer, and merchant:
//!
//! - `PAYMENT-REQUIRED` - base64 JSON `{x402Version: 2, accepts: [...], error?}`
//!   carrying [`PaymentRequirement`]s, returned with HTTP 402.
//! - `PAYMENT-SIGNATURE` - base64 JSON `{x402Version: 2, accepted, payload,
//!   challengeNonce, signature}`, the agent's signed retry.
//!
//! Decoding is strict: invalid base64, non-object JSON, missing fields, or a
//! wrong `x402Version` fail with a [`ProtocolError`]. Wire shapes stay typed
//! past this boundary; untyped maps never leak into the processors.
//!
//! # Modules
//!
//! - [`adapter`] - Upstream-compat remapping (legacy `requirements`, network labels)
//! - [`headers`] - Canonical header names and upstream aliases
//! - [`relay`] - Request/response bodies of the relay endpoints

use alloy_primitives::{Address, B256, Bytes};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DisplayFromStr, serde_as};
use std::fmt;
use std::fmt::{Display, Formatter};

use crate::util::b64;

pub mod adapter;
pub mod headers;
pub mod relay;

/// Largest accepted proof blob (128 KiB).
pub const MAX_PROOF_BYTES: usize = 128 * 1024;

/// The rail tag carried by shielded payment requirements.
pub const RAIL_SHIELDED_USDC: &str = "shielded-usdc";

/// The payment scheme the shielded rail supports.
pub const SCHEME_EXACT: &str = "exact";

/// Errors raised while decoding or validating wire envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("invalid envelope json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("envelope must be a json object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("wrong x402Version: expected 2")]
    WrongVersion,
    #[error("unsupported rail `{0}`")]
    UnsupportedRail(String),
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("publicInputs must contain exactly 6 words, got {0}")]
    PublicInputsArity(usize),
    #[error("public input {0} does not match its named field")]
    PublicInputMismatch(&'static str),
    #[error("proof of {0} bytes exceeds the {MAX_PROOF_BYTES}-byte limit")]
    ProofTooLarge(usize),
    #[error("proof must not be empty")]
    EmptyProof,
}

/// Version marker that serializes as the integer `2`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version2;

impl X402Version2 {
    pub const VALUE: u8 = 2;
}

impl From<X402Version2> for u8 {
    fn from(_: X402Version2) -> Self {
        X402Version2::VALUE
    }
}

impl Serialize for X402Version2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version2 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version2)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {num}",
                Self::VALUE
            )))
        }
    }
}

impl Display for X402Version2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

/// Payment terms for the shielded rail, as issued by the challenge bridge.
///
/// `extra` carries the upstream hashes and original rail so the agent and
/// the relayer can both re-derive the binding to the merchant's unaltered
/// terms.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: String,
    /// CAIP-2 chain id (`eip155:84532`).
    pub network: String,
    pub asset: String,
    pub pay_to: Address,
    pub rail: String,
    /// Micro-unit amount, serialized as a decimal string.
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
    pub challenge_nonce: B256,
    /// Unix seconds after which the challenge is dead.
    pub challenge_expiry: u64,
    pub merchant_pub_key: B256,
    pub verifying_contract: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl PaymentRequirement {
    /// Rejects requirements that did not travel the shielded rail.
    pub fn ensure_shielded(&self) -> Result<(), ProtocolError> {
        if self.rail != RAIL_SHIELDED_USDC {
            return Err(ProtocolError::UnsupportedRail(self.rail.clone()));
        }
        Ok(())
    }

    /// Lower-cases hex-carrying strings and trims lexical noise in place.
    pub fn normalize(&mut self) {
        self.scheme = self.scheme.trim().to_string();
        self.network = self.network.trim().to_string();
        self.rail = self.rail.trim().to_string();
        let asset = self.asset.trim();
        self.asset = if asset.starts_with("0x") || asset.starts_with("0X") {
            asset.to_lowercase()
        } else {
            asset.to_string()
        };
    }
}

/// A zero-knowledge spend bound to one challenge.
///
/// The named fields mirror `publicInputs` positions 0..=4; position 5 is
/// the amount word. [`Self::validate_shape`] enforces the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShieldedPaymentPayload {
    pub proof: Bytes,
    pub public_inputs: Vec<B256>,
    pub nullifier: B256,
    pub root: B256,
    pub merchant_commitment: B256,
    pub change_commitment: B256,
    pub challenge_hash: B256,
    pub encrypted_receipt: Bytes,
}

impl ShieldedPaymentPayload {
    /// Structural validation: arity, proof size, and named-field mirroring.
    /// No cryptography happens here.
    pub fn validate_shape(&self) -> Result<(), ProtocolError> {
        if self.proof.is_empty() {
            return Err(ProtocolError::EmptyProof);
        }
        if self.proof.len() > MAX_PROOF_BYTES {
            return Err(ProtocolError::ProofTooLarge(self.proof.len()));
        }
        if self.public_inputs.len() != 6 {
            return Err(ProtocolError::PublicInputsArity(self.public_inputs.len()));
        }
        let mirrors: [(&'static str, &B256, &B256); 5] = [
            ("nullifier", &self.nullifier, &self.public_inputs[0]),
            ("root", &self.root, &self.public_inputs[1]),
            (
                "merchantCommitment",
                &self.merchant_commitment,
                &self.public_inputs[2],
            ),
            (
                "changeCommitment",
                &self.change_commitment,
                &self.public_inputs[3],
            ),
            ("challengeHash", &self.challenge_hash, &self.public_inputs[4]),
        ];
        for (name, named, public) in mirrors {
            if named != public {
                return Err(ProtocolError::PublicInputMismatch(name));
            }
        }
        Ok(())
    }

    /// The amount word at `publicInputs[5]`.
    pub fn amount_word(&self) -> &B256 {
        &self.public_inputs[5]
    }
}

/// Body of the `PAYMENT-REQUIRED` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredEnvelope {
    pub x402_version: X402Version2,
    pub accepts: Vec<PaymentRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of the `PAYMENT-SIGNATURE` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSignatureEnvelope {
    pub x402_version: X402Version2,
    pub accepted: PaymentRequirement,
    pub payload: ShieldedPaymentPayload,
    pub challenge_nonce: B256,
    pub signature: Bytes,
}

impl PaymentSignatureEnvelope {
    /// The exact bytes the payer signed: the canonical JSON serialization of
    /// the payload.
    pub fn signed_payload_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

fn decode_envelope_value(header: &str) -> Result<serde_json::Value, ProtocolError> {
    let raw = b64::decode(header)?;
    let value: serde_json::Value = serde_json::from_slice(&raw)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    Ok(value)
}

fn require_version_2(value: &serde_json::Value) -> Result<(), ProtocolError> {
    match value.get("x402Version") {
        None => Err(ProtocolError::MissingField("x402Version")),
        Some(v) if v.as_u64() == Some(u64::from(X402Version2::VALUE)) => Ok(()),
        Some(_) => Err(ProtocolError::WrongVersion),
    }
}

/// Decodes a `PAYMENT-REQUIRED` header into its envelope.
///
/// Legacy bodies carrying `requirements` instead of `accepts` are remapped
/// transparently; non-`exact` scheme entries are filtered out.
pub fn decode_payment_required(header: &str) -> Result<PaymentRequiredEnvelope, ProtocolError> {
    let mut value = decode_envelope_value(header)?;
    require_version_2(&value)?;
    adapter::remap_legacy_accepts(&mut value);
    adapter::filter_exact_accepts(&mut value);
    if value.get("accepts").is_none() {
        return Err(ProtocolError::MissingField("accepts"));
    }
    Ok(serde_json::from_value(value)?)
}

/// Encodes a `PAYMENT-REQUIRED` envelope into header form.
pub fn encode_payment_required(envelope: &PaymentRequiredEnvelope) -> String {
    let json = serde_json::to_string(envelope).expect("envelope serialization is infallible");
    b64::encode(json)
}

/// Decodes a `PAYMENT-SIGNATURE` header into its envelope.
pub fn decode_payment_signature(header: &str) -> Result<PaymentSignatureEnvelope, ProtocolError> {
    let value = decode_envelope_value(header)?;
    require_version_2(&value)?;
    for field in ["accepted", "payload", "challengeNonce", "signature"] {
        if value.get(field).is_none() {
            return Err(ProtocolError::MissingField(field));
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// Encodes a `PAYMENT-SIGNATURE` envelope into header form.
pub fn encode_payment_signature(envelope: &PaymentSignatureEnvelope) -> String {
    let json = serde_json::to_string(envelope).expect("envelope serialization is infallible");
    b64::encode(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    fn requirement() -> PaymentRequirement {
        PaymentRequirement {
            scheme: SCHEME_EXACT.into(),
            network: "eip155:84532".into(),
            asset: "0xAAAA000000000000000000000000000000000001".into(),
            pay_to: address!("0x00000000000000000000000000000000000000aa"),
            rail: RAIL_SHIELDED_USDC.into(),
            amount: 40,
            challenge_nonce: B256::repeat_byte(0x99),
            challenge_expiry: 1_700_000_300,
            merchant_pub_key: B256::repeat_byte(0x11),
            verifying_contract: address!("0x0000000000000000000000000000000000000002"),
            description: None,
            mime_type: None,
            extra: None,
        }
    }

    fn payload() -> ShieldedPaymentPayload {
        let nullifier = B256::repeat_byte(1);
        let root = B256::repeat_byte(2);
        let merchant = B256::repeat_byte(3);
        let change = B256::repeat_byte(4);
        let challenge = B256::repeat_byte(5);
        let amount = crate::crypto::amount_word(40);
        ShieldedPaymentPayload {
            proof: Bytes::from(vec![7u8; 64]),
            public_inputs: vec![nullifier, root, merchant, change, challenge, amount],
            nullifier,
            root,
            merchant_commitment: merchant,
            change_commitment: change,
            challenge_hash: challenge,
            encrypted_receipt: Bytes::new(),
        }
    }

    #[test]
    fn test_payment_required_round_trip() {
        let envelope = PaymentRequiredEnvelope {
            x402_version: X402Version2,
            accepts: vec![requirement()],
            error: None,
        };
        let header = encode_payment_required(&envelope);
        let back = decode_payment_required(&header).unwrap();
        assert_eq!(back.accepts, envelope.accepts);
    }

    #[test]
    fn test_payment_signature_round_trip() {
        let envelope = PaymentSignatureEnvelope {
            x402_version: X402Version2,
            accepted: requirement(),
            payload: payload(),
            challenge_nonce: B256::repeat_byte(0x99),
            signature: Bytes::from(vec![9u8; 65]),
        };
        let header = encode_payment_signature(&envelope);
        let back = decode_payment_signature(&header).unwrap();
        assert_eq!(back.accepted, envelope.accepted);
        assert_eq!(back.payload, envelope.payload);
        assert_eq!(back.signature, envelope.signature);
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(
            decode_payment_required("!!!"),
            Err(ProtocolError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let header = b64::encode("[1,2,3]");
        assert!(matches!(
            decode_payment_required(&header),
            Err(ProtocolError::NotAnObject)
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let header = b64::encode(r#"{"x402Version":1,"accepts":[]}"#);
        assert!(matches!(
            decode_payment_required(&header),
            Err(ProtocolError::WrongVersion)
        ));
    }

    #[test]
    fn test_decode_remaps_legacy_requirements() {
        let envelope = PaymentRequiredEnvelope {
            x402_version: X402Version2,
            accepts: vec![requirement()],
            error: None,
        };
        let json = serde_json::to_string(&envelope)
            .unwrap()
            .replace("\"accepts\"", "\"requirements\"");
        let back = decode_payment_required(&b64::encode(json)).unwrap();
        assert_eq!(back.accepts.len(), 1);
    }

    #[test]
    fn test_decode_filters_non_exact_schemes() {
        let mut upto = requirement();
        upto.scheme = "upto".into();
        let envelope = PaymentRequiredEnvelope {
            x402_version: X402Version2,
            accepts: vec![upto, requirement()],
            error: None,
        };
        let back = decode_payment_required(&encode_payment_required(&envelope)).unwrap();
        assert_eq!(back.accepts.len(), 1);
        assert_eq!(back.accepts[0].scheme, SCHEME_EXACT);
    }

    #[test]
    fn test_amount_serializes_as_decimal_string() {
        let json = serde_json::to_value(requirement()).unwrap();
        assert_eq!(json["amount"], "40");
    }

    #[test]
    fn test_payload_shape_checks() {
        assert!(payload().validate_shape().is_ok());

        let mut arity = payload();
        arity.public_inputs.pop();
        assert!(matches!(
            arity.validate_shape(),
            Err(ProtocolError::PublicInputsArity(5))
        ));

        let mut mismatch = payload();
        mismatch.nullifier = B256::repeat_byte(0xff);
        assert!(matches!(
            mismatch.validate_shape(),
            Err(ProtocolError::PublicInputMismatch("nullifier"))
        ));

        let mut oversize = payload();
        oversize.proof = Bytes::from(vec![0u8; MAX_PROOF_BYTES + 1]);
        assert!(matches!(
            oversize.validate_shape(),
            Err(ProtocolError::ProofTooLarge(_))
        ));

        let mut empty = payload();
        empty.proof = Bytes::new();
        assert!(matches!(empty.validate_shape(), Err(ProtocolError::EmptyProof)));
    }

    #[test]
    fn test_normalize_lowercases_hex_asset() {
        let mut req = requirement();
        req.normalize();
        assert_eq!(req.asset, "0xaaaa000000000000000000000000000000000001");
    }

    #[test]
    fn test_ensure_shielded() {
        let mut req = requirement();
        assert!(req.ensure_shielded().is_ok());
        req.rail = "eip3009".into();
        assert!(matches!(
            req.ensure_shielded(),
            Err(ProtocolError::UnsupportedRail(_))
        ));
    }
}
