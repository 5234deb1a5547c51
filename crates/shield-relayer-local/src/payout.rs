//! Merchant payout adapter.
//!
//! After settlement the relayer replays the agent's original HTTP request
//! against the merchant. Three modes exist: `forward` performs the call,
//! `noop` synthesizes a 200 for merchants settled out-of-band, and
//! `upstream-x402` answers the merchant's own x402 challenge with a payment
//! voucher funded by the relayer. In every mode incoming payment headers are
//! stripped before anything leaves the relayer; only the relayer's own
//! request id and idempotency key are injected.

use alloy_primitives::B256;
use reqwest::Method;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use shield_types::error::RelayerError;
use shield_types::proto::headers;
use shield_types::proto::relay::{MerchantRequest, MerchantResult};
use shield_types::proto::{PaymentRequirement, adapter};
use shield_types::util::b64;

use crate::signer::RelayerSigner;

/// How the relayer executes the merchant side of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutMode {
    /// Replay the agent's request over HTTP.
    Forward,
    /// Synthesize a 200 without calling anyone.
    Noop,
    /// Pay the merchant's own x402 challenge from relayer funds.
    UpstreamX402,
}

impl PayoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMode::Forward => "forward",
            PayoutMode::Noop => "noop",
            PayoutMode::UpstreamX402 => "upstream-x402",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "forward" => Some(PayoutMode::Forward),
            "noop" => Some(PayoutMode::Noop),
            "upstream-x402" => Some(PayoutMode::UpstreamX402),
            _ => None,
        }
    }
}

/// One payout instruction from a processor.
pub struct PayoutCall<'a> {
    pub settlement_id: &'a str,
    pub merchant_request: &'a MerchantRequest,
    pub requirement: &'a PaymentRequirement,
    pub nullifier: B256,
}

pub struct PayoutAdapter {
    mode: PayoutMode,
    http: reqwest::Client,
    timeout: Duration,
    /// Needed by `upstream-x402` to authenticate relayer-funded payments.
    signer: Option<Arc<RelayerSigner>>,
}

impl PayoutAdapter {
    pub fn new(mode: PayoutMode, timeout: Duration, signer: Option<Arc<RelayerSigner>>) -> Self {
        Self {
            mode,
            http: reqwest::Client::new(),
            timeout,
            signer,
        }
    }

    pub fn mode(&self) -> PayoutMode {
        self.mode
    }

    /// Executes the merchant side of a settled payment.
    ///
    /// Network failures and timeouts are [`RelayerError::payout`]; an HTTP
    /// error status is NOT an error here, the processors decide what a
    /// non-2xx means for their record.
    #[instrument(skip_all, fields(settlement_id = %call.settlement_id, mode = %self.mode.as_str()))]
    pub async fn pay_merchant(&self, call: PayoutCall<'_>) -> Result<MerchantResult, RelayerError> {
        match self.mode {
            PayoutMode::Noop => Ok(MerchantResult {
                status: 200,
                headers: BTreeMap::new(),
                body_base64: String::new(),
                payout_reference: Some(format!("noop:{}", call.settlement_id)),
            }),
            PayoutMode::Forward => {
                let mut result = self.forward(&call, &[]).await?;
                result.payout_reference = Some(format!("fwd:{}", call.settlement_id));
                Ok(result)
            }
            PayoutMode::UpstreamX402 => self.pay_upstream(&call).await,
        }
    }

    async fn forward(
        &self,
        call: &PayoutCall<'_>,
        extra_headers: &[(String, String)],
    ) -> Result<MerchantResult, RelayerError> {
        let request = call.merchant_request;
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| RelayerError::protocol(format!("invalid method `{}`", request.method)))?;
        let mut builder = self
            .http
            .request(method, &request.url)
            .timeout(self.timeout)
            .header(headers::RELAYER_REQUEST_ID, call.settlement_id)
            .header(headers::IDEMPOTENCY_KEY, call.settlement_id);
        for (name, value) in &request.headers {
            // Never echo payment material back at the merchant.
            if headers::is_payment_header(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        for (name, value) in extra_headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body_base64 {
            let bytes = b64::decode(body)
                .map_err(|_| RelayerError::protocol("merchant request body is not base64"))?;
            builder = builder.body(bytes);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayerError::payout(format!("merchant call failed: {e}")))?;

        let status = response.status().as_u16();
        let mut response_headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.to_string(), value.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayerError::payout(format!("merchant body read failed: {e}")))?;

        Ok(MerchantResult {
            status,
            headers: response_headers,
            body_base64: b64::encode(&body),
            payout_reference: None,
        })
    }

    /// Forward once; on 402, answer the merchant's challenge with a
    /// relayer-funded voucher and retry.
    async fn pay_upstream(&self, call: &PayoutCall<'_>) -> Result<MerchantResult, RelayerError> {
        let first = self.forward(call, &[]).await?;
        if first.status != 402 {
            let mut result = first;
            result.payout_reference = Some(format!("upstream:{}", call.settlement_id));
            return Ok(result);
        }

        let challenge_header = first
            .headers
            .get(headers::PAYMENT_REQUIRED)
            .or_else(|| first.headers.get(headers::X_PAYMENT_RESPONSE))
            .cloned()
            .or_else(|| {
                // Some providers put the challenge in the body instead.
                let body = b64::decode(&first.body_base64).ok()?;
                (!body.is_empty()).then(|| b64::encode(&body))
            })
            .ok_or_else(|| RelayerError::payout("merchant 402 carried no challenge"))?;
        let terms = adapter::parse_upstream_payment_required(&challenge_header)
            .map_err(|e| RelayerError::payout(format!("merchant challenge unusable: {e}")))?;

        let voucher = self.build_voucher(call, &terms)?;
        let retry_headers = vec![
            (headers::PAYMENT_SIGNATURE.to_string(), voucher.clone()),
            (headers::X_PAYMENT.to_string(), voucher),
        ];
        let mut result = self.forward(call, &retry_headers).await?;
        result.payout_reference = Some(format!("upstream:{}", call.settlement_id));
        Ok(result)
    }

    /// A relayer-signed settlement voucher over the merchant's quoted terms.
    /// Merchants running in this mode accept the relayer as a payer of
    /// record and invoice it out-of-band.
    fn build_voucher(
        &self,
        call: &PayoutCall<'_>,
        terms: &adapter::UpstreamTerms,
    ) -> Result<String, RelayerError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| RelayerError::payout("upstream-x402 payout requires a relayer key"))?;
        let terms_hash = terms.terms_hash();
        let signature = signer.sign_hash(&terms_hash)?;
        let network = adapter::outgoing_network_label(&terms.network);
        let body = serde_json::json!({
            "x402Version": 2,
            "rail": "relayer-voucher",
            "settlementId": call.settlement_id,
            "nullifier": call.nullifier,
            "network": network,
            "upstreamTermsHash": terms_hash,
            "payer": signer.address(),
            "signature": signature,
        });
        Ok(b64::encode(body.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use shield_types::proto::{RAIL_SHIELDED_USDC, SCHEME_EXACT};

    fn requirement() -> PaymentRequirement {
        PaymentRequirement {
            scheme: SCHEME_EXACT.into(),
            network: "eip155:84532".into(),
            asset: "0xaaaa000000000000000000000000000000000001".into(),
            pay_to: address!("0x00000000000000000000000000000000000000aa"),
            rail: RAIL_SHIELDED_USDC.into(),
            amount: 40,
            challenge_nonce: B256::repeat_byte(0x99),
            challenge_expiry: u64::MAX,
            merchant_pub_key: B256::repeat_byte(0x11),
            verifying_contract: address!("0x0000000000000000000000000000000000000002"),
            description: None,
            mime_type: None,
            extra: None,
        }
    }

    #[tokio::test]
    async fn test_noop_synthesizes_200() {
        let adapter = PayoutAdapter::new(PayoutMode::Noop, Duration::from_secs(30), None);
        let request = MerchantRequest {
            url: "https://merchant.example/data".into(),
            method: "GET".into(),
            headers: BTreeMap::new(),
            body_base64: None,
            challenge_url: None,
        };
        let requirement = requirement();
        let result = adapter
            .pay_merchant(PayoutCall {
                settlement_id: "stl_7",
                merchant_request: &request,
                requirement: &requirement,
                nullifier: B256::repeat_byte(1),
            })
            .await
            .unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.payout_reference.as_deref(), Some("noop:stl_7"));
    }

    #[test]
    fn test_mode_parse_round_trip() {
        for mode in [PayoutMode::Forward, PayoutMode::Noop, PayoutMode::UpstreamX402] {
            assert_eq!(PayoutMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(PayoutMode::parse("direct"), None);
    }
}
