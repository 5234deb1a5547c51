//! Canonical header names and their upstream-compat aliases.
//!
//! Upstream x402 providers use `X-PAYMENT` / `X-PAYMENT-RESPONSE`; the
//! shielded rail uses `PAYMENT-SIGNATURE` / `PAYMENT-REQUIRED`. Both
//! spellings are accepted on ingress and mirrored on egress.

/// Challenge envelope, returned with HTTP 402.
pub const PAYMENT_REQUIRED: &str = "payment-required";
/// Signed payment envelope on the retry.
pub const PAYMENT_SIGNATURE: &str = "payment-signature";
/// Bare challenge nonce echo for agent-side correlation.
pub const CHALLENGE_NONCE: &str = "x-challenge-nonce";
/// Settlement id the relayer assigns to a processed payment.
pub const RELAYER_SETTLEMENT_ID: &str = "x-relayer-settlement-id";
/// Idempotency key injected into merchant forwards.
pub const IDEMPOTENCY_KEY: &str = "x-idempotency-key";
/// Request id injected into merchant forwards.
pub const RELAYER_REQUEST_ID: &str = "x-relayer-request-id";
/// Upstream alias of [`PAYMENT_SIGNATURE`].
pub const X_PAYMENT: &str = "x-payment";
/// Upstream alias of the settlement response header.
pub const X_PAYMENT_RESPONSE: &str = "x-payment-response";

/// Every payment-bearing header, canonical and alias; the payout adapter
/// strips all of these before forwarding to the merchant.
pub const PAYMENT_HEADER_NAMES: [&str; 5] = [
    PAYMENT_REQUIRED,
    PAYMENT_SIGNATURE,
    CHALLENGE_NONCE,
    X_PAYMENT,
    X_PAYMENT_RESPONSE,
];

/// The alias that mirrors a canonical payment header, if any.
pub fn compat_alias(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        PAYMENT_SIGNATURE => Some(X_PAYMENT),
        X_PAYMENT => Some(PAYMENT_SIGNATURE),
        X_PAYMENT_RESPONSE => Some(PAYMENT_REQUIRED),
        PAYMENT_REQUIRED => Some(X_PAYMENT_RESPONSE),
        _ => None,
    }
}

/// Whether a header carries payment material and must never be echoed to a
/// merchant.
pub fn is_payment_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    PAYMENT_HEADER_NAMES.contains(&lower.as_str())
}
