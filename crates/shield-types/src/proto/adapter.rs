//! Upstream-provider adapters for heterogeneous 402 shapes.
//!
//! Merchants sit behind different x402 stacks: the canonical shape carries
//! `accepts[]`, older providers carry `requirements[]`, and network fields
//! may be CAIP-2 ids or provider labels. Each adapter here is a small pure
//! transformation applied at the parse boundary, composed by the codec and
//! the challenge bridge.

use serde_json::Value;

use crate::crypto::upstream_terms_hash;
use crate::networks;
use crate::proto::{ProtocolError, SCHEME_EXACT};
use alloy_primitives::B256;

/// Remaps a legacy `requirements` array onto the canonical `accepts` key.
pub fn remap_legacy_accepts(value: &mut Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    if !object.contains_key("accepts")
        && let Some(requirements) = object.remove("requirements")
    {
        object.insert("accepts".to_string(), requirements);
    }
}

/// Drops non-`exact` scheme entries from the `accepts` array.
pub fn filter_exact_accepts(value: &mut Value) {
    let Some(accepts) = value.get_mut("accepts").and_then(Value::as_array_mut) else {
        return;
    };
    accepts.retain(|entry| {
        entry
            .get("scheme")
            .and_then(Value::as_str)
            .map(|scheme| scheme == SCHEME_EXACT)
            .unwrap_or(false)
    });
}

/// The first `accepts` entry of an upstream merchant challenge, reduced to
/// the fields the challenge bridge binds to.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamTerms {
    pub scheme: String,
    pub network: String,
    pub asset: String,
    pub pay_to: String,
    /// Decimal amount string exactly as the merchant quoted it.
    pub amount: String,
    pub rail: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub output_schema: Option<Value>,
}

impl UpstreamTerms {
    /// Hash of these terms, compared against agent-supplied headers to
    /// detect drift.
    pub fn terms_hash(&self) -> B256 {
        upstream_terms_hash(
            &self.scheme,
            &self.network,
            &self.asset,
            &self.pay_to,
            &self.amount,
        )
    }
}

fn required_str(entry: &Value, field: &'static str) -> Result<String, ProtocolError> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(ProtocolError::MissingField(field))
}

fn optional_str(entry: &Value, field: &str) -> Option<String> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn is_hex_address(s: &str) -> bool {
    let Some(body) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) else {
        return false;
    };
    body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parses an upstream `PAYMENT-REQUIRED` header down to its first usable
/// `accepts` entry.
///
/// Upstream envelopes may be protocol version 1 or 2 and may use the legacy
/// `requirements` key; amounts may appear as `amount` or the older
/// `maxAmountRequired`. Missing mandatory fields or a non-address `payTo`
/// reject the challenge.
pub fn parse_upstream_payment_required(header: &str) -> Result<UpstreamTerms, ProtocolError> {
    let raw = crate::util::b64::decode(header)?;
    let mut value: Value = serde_json::from_slice(&raw)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    remap_legacy_accepts(&mut value);
    filter_exact_accepts(&mut value);
    let entry = value
        .get("accepts")
        .and_then(Value::as_array)
        .and_then(|accepts| accepts.first())
        .ok_or(ProtocolError::MissingField("accepts"))?;

    let scheme = required_str(entry, "scheme")?;
    let network_raw = required_str(entry, "network")?;
    let network = networks::to_chain_id(&network_raw).unwrap_or(network_raw);
    let asset = required_str(entry, "asset")?;
    let pay_to = required_str(entry, "payTo")?;
    if !is_hex_address(&pay_to) {
        return Err(ProtocolError::InvalidAddress(pay_to));
    }
    let amount = match required_str(entry, "amount") {
        Ok(amount) => amount,
        Err(_) => required_str(entry, "maxAmountRequired")
            .map_err(|_| ProtocolError::MissingField("amount"))?,
    };

    Ok(UpstreamTerms {
        scheme,
        network,
        asset,
        pay_to,
        amount,
        rail: optional_str(entry, "rail"),
        description: optional_str(entry, "description"),
        mime_type: optional_str(entry, "mimeType"),
        output_schema: entry.get("outputSchema").cloned(),
    })
}

/// Rewrites the network of an outgoing signature header to the label the
/// upstream provider expects, when it has one.
pub fn outgoing_network_label(caip2: &str) -> String {
    networks::label_by_chain_id(caip2)
        .map(|label| label.to_string())
        .unwrap_or_else(|| caip2.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::b64;
    use serde_json::json;

    fn upstream_body(network: &str, amount_key: &str, accepts_key: &str) -> String {
        b64::encode(
            json!({
                "x402Version": 1,
                accepts_key: [{
                    "scheme": "exact",
                    "network": network,
                    "asset": "0xAAAA000000000000000000000000000000000001",
                    "payTo": "0x00000000000000000000000000000000000000aa",
                    amount_key: "40",
                }],
            })
            .to_string(),
        )
    }

    #[test]
    fn test_parses_canonical_shape() {
        let terms =
            parse_upstream_payment_required(&upstream_body("eip155:84532", "amount", "accepts"))
                .unwrap();
        assert_eq!(terms.network, "eip155:84532");
        assert_eq!(terms.amount, "40");
    }

    #[test]
    fn test_parses_legacy_requirements_and_label() {
        let terms = parse_upstream_payment_required(&upstream_body(
            "base-sepolia",
            "maxAmountRequired",
            "requirements",
        ))
        .unwrap();
        assert_eq!(terms.network, "eip155:84532");
        assert_eq!(terms.amount, "40");
    }

    #[test]
    fn test_rejects_missing_pay_to() {
        let header = b64::encode(
            json!({
                "x402Version": 1,
                "accepts": [{"scheme": "exact", "network": "base", "asset": "0xa", "amount": "1"}],
            })
            .to_string(),
        );
        assert!(matches!(
            parse_upstream_payment_required(&header),
            Err(ProtocolError::MissingField("payTo"))
        ));
    }

    #[test]
    fn test_rejects_short_pay_to() {
        let header = b64::encode(
            json!({
                "x402Version": 1,
                "accepts": [{
                    "scheme": "exact",
                    "network": "base",
                    "asset": "0xAAAA000000000000000000000000000000000001",
                    "payTo": "0x1234",
                    "amount": "1",
                }],
            })
            .to_string(),
        );
        assert!(matches!(
            parse_upstream_payment_required(&header),
            Err(ProtocolError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_terms_hash_tracks_amount() {
        let a =
            parse_upstream_payment_required(&upstream_body("eip155:84532", "amount", "accepts"))
                .unwrap();
        let mut b = a.clone();
        b.amount = "41".into();
        assert_ne!(a.terms_hash(), b.terms_hash());
    }

    #[test]
    fn test_outgoing_network_label() {
        assert_eq!(outgoing_network_label("eip155:8453"), "base");
        assert_eq!(outgoing_network_label("eip155:31337"), "eip155:31337");
    }
}
