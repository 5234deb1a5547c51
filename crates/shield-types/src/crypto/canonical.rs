//! Canonical byte encodings for the credit/sequencer rail.
//!
//! Hashed records on the credit rail (debit intents, sequencer
//! authorizations, inclusion leaves, execution reports) are serialized into
//! a tag-prefixed byte string with fixed-width fields: `u8` as a single
//! byte, strings and byte blobs as `u16`-BE length prefix plus contents,
//! integers as `u64`-BE, and 32-byte words verbatim. Any field that does not
//! fit its width aborts the encoding; a canonical record is either exact or
//! absent.

use alloy_primitives::{B256, keccak256};

/// Tag for debit-intent digests (`lastDebitDigest`).
pub const TAG_INTENT: &str = "x402:intent:v1";
/// Tag for sequencer authorization records.
pub const TAG_AUTHORIZATION: &str = "x402:authorization:v1";
/// Tag for authorization leaves in the sequencer inclusion tree.
pub const TAG_AUTH_LEAF: &str = "x402:authleaf:v1";
/// Tag for execution reports.
pub const TAG_EXECUTION_REPORT: &str = "x402:execution-report:v1";
/// Tag for the canonical merchant-request form hashed by the challenge bridge.
pub const TAG_MERCHANT_REQUEST: &str = "x402:merchant-request:v1";
/// Tag for the merchant-request-plus-terms binding hashed into debit intents.
pub const TAG_MERCHANT_BINDING: &str = "x402:merchant-binding:v1";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CanonicalError {
    #[error("canonical field of {0} bytes exceeds u16 length prefix")]
    Oversize(usize),
}

/// Incremental canonical encoder.
///
/// ```
/// use shield_types::crypto::canonical::Encoder;
///
/// let mut enc = Encoder::new("x402:intent:v1").unwrap();
/// enc.push_u64(7);
/// enc.push_str("GET").unwrap();
/// let bytes = enc.finish();
/// assert!(bytes.len() > 8);
/// ```
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Starts a record under the given domain tag.
    pub fn new(tag: &str) -> Result<Self, CanonicalError> {
        let mut encoder = Encoder { buf: Vec::new() };
        encoder.push_str(tag)?;
        Ok(encoder)
    }

    pub fn push_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn push_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn push_word(&mut self, word: &B256) {
        self.buf.extend_from_slice(word.as_slice());
    }

    pub fn push_str(&mut self, value: &str) -> Result<(), CanonicalError> {
        self.push_bytes(value.as_bytes())
    }

    pub fn push_bytes(&mut self, value: &[u8]) -> Result<(), CanonicalError> {
        let len: u16 = value
            .len()
            .try_into()
            .map_err(|_| CanonicalError::Oversize(value.len()))?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(value);
        Ok(())
    }

    /// Returns the finished byte string.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Keccak-256 of the finished byte string.
    pub fn digest(self) -> B256 {
        keccak256(self.buf)
    }
}

/// Canonical digest of a merchant request as seen by the challenge bridge:
/// `H(canonical({url, METHOD, challengeUrl}))` with the method upper-cased
/// and the challenge URL defaulting to the request URL.
pub fn merchant_request_digest(
    url: &str,
    method: &str,
    challenge_url: Option<&str>,
) -> Result<B256, CanonicalError> {
    let mut enc = Encoder::new(TAG_MERCHANT_REQUEST)?;
    enc.push_str(url)?;
    enc.push_str(&method.to_uppercase())?;
    enc.push_str(challenge_url.unwrap_or(url))?;
    Ok(enc.digest())
}

/// Canonical digest binding a merchant request to the payment terms it will
/// be executed under. Debit intents carry this digest so a signed debit can
/// only ever pay the call and terms the agent saw.
#[allow(clippy::too_many_arguments)]
pub fn merchant_binding_digest(
    url: &str,
    method: &str,
    challenge_url: Option<&str>,
    scheme: &str,
    network: &str,
    asset: &str,
    pay_to: &str,
    amount: u128,
) -> Result<B256, CanonicalError> {
    let mut enc = Encoder::new(TAG_MERCHANT_BINDING)?;
    enc.push_str(url)?;
    enc.push_str(&method.to_uppercase())?;
    enc.push_str(challenge_url.unwrap_or(url))?;
    enc.push_str(scheme)?;
    enc.push_str(network)?;
    enc.push_str(&asset.to_lowercase())?;
    enc.push_str(&pay_to.to_lowercase())?;
    enc.push_word(&super::amount_word(amount));
    Ok(enc.digest())
}
