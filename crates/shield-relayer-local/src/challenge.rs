//! Shielded challenge bridge.
//!
//! The bridge turns an upstream merchant's x402 challenge into a shielded
//! one. It refetches the merchant's terms directly (never trusting the
//! agent's copy), binds them into an `upstreamTermsHash`, mints a fresh
//! challenge nonce with a TTL, and emits a `PAYMENT-REQUIRED` envelope whose
//! requirement rides the shielded rail while `extra` still carries the
//! merchant's unaltered terms.
//!
//! Issued challenges are indexed by their expected challenge hash so both
//! processors can check, at acceptance time, that a payload answers a nonce
//! this relayer issued and that the nonce is still live.

use alloy_primitives::{Address, B256};
use dashmap::DashMap;
use std::time::Duration;
use tracing::instrument;

use shield_types::error::RelayerError;
use shield_types::proto::relay::{ChallengeResponse, MerchantRequest};
use shield_types::proto::{
    PaymentRequiredEnvelope, PaymentRequirement, RAIL_SHIELDED_USDC, SCHEME_EXACT, X402Version2,
    adapter, encode_payment_required, headers,
};
use shield_types::crypto::{canonical, challenge_hash};
use shield_types::timestamp::UnixTimestamp;
use shield_types::util::b64;

/// Relayer-side identity baked into every issued requirement.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub chain_id: u64,
    pub verifying_contract: Address,
    pub merchant_pub_key: B256,
    /// Challenge lifetime in seconds.
    pub challenge_ttl_secs: u64,
    /// Per-call timeout for merchant refetches.
    pub refetch_timeout: Duration,
}

/// One live challenge and everything it was bound to at issuance.
#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub nonce: B256,
    pub amount: u128,
    pub pay_to: Address,
    pub expiry: UnixTimestamp,
    pub upstream_terms_hash: B256,
    pub merchant_request_hash: B256,
}

pub struct ChallengeBridge {
    config: BridgeConfig,
    http: reqwest::Client,
    /// Live challenges keyed by their expected challenge hash.
    issued: DashMap<B256, IssuedChallenge>,
}

impl ChallengeBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            issued: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Fetches the merchant's authoritative challenge: one unpaid call to
    /// the challenge URL, expecting a 402 with a `PAYMENT-REQUIRED` header
    /// (or a challenge body for providers that skip the header).
    #[instrument(skip_all, fields(url = %request.url))]
    pub async fn refetch_terms(
        &self,
        request: &MerchantRequest,
    ) -> Result<adapter::UpstreamTerms, RelayerError> {
        let url = request.challenge_url.as_deref().unwrap_or(&request.url);
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| RelayerError::protocol(format!("invalid method `{}`", request.method)))?;
        let response = self
            .http
            .request(method, url)
            .timeout(self.config.refetch_timeout)
            .send()
            .await
            .map_err(|e| RelayerError::challenge(format!("merchant challenge fetch failed: {e}")))?;
        if response.status().as_u16() != 402 {
            return Err(RelayerError::challenge(format!(
                "merchant did not return a payment challenge (status {})",
                response.status().as_u16()
            )));
        }
        let header = response
            .headers()
            .get(headers::PAYMENT_REQUIRED)
            .or_else(|| response.headers().get(headers::X_PAYMENT_RESPONSE))
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let header = match header {
            Some(header) => header,
            None => {
                let body = response.bytes().await.map_err(|e| {
                    RelayerError::challenge(format!("merchant challenge read failed: {e}"))
                })?;
                if body.is_empty() {
                    return Err(RelayerError::challenge("merchant 402 carried no challenge"));
                }
                b64::encode(&body)
            }
        };
        adapter::parse_upstream_payment_required(&header)
            .map_err(|e| RelayerError::challenge(format!("merchant challenge unusable: {e}")))
    }

    /// Issues a shielded challenge for a merchant request.
    ///
    /// When the agent supplies the merchant's own `PAYMENT-REQUIRED` header
    /// the refetched terms must hash identically, otherwise the agent and
    /// the merchant have drifted and the challenge is refused.
    #[instrument(skip_all, fields(url = %request.url))]
    pub async fn issue(
        &self,
        request: &MerchantRequest,
        agent_header: Option<&str>,
    ) -> Result<ChallengeResponse, RelayerError> {
        let terms = self.refetch_terms(request).await?;
        let upstream_terms_hash = terms.terms_hash();

        if let Some(header) = agent_header {
            let agent_terms = adapter::parse_upstream_payment_required(header)
                .map_err(|e| RelayerError::challenge(format!("agent challenge unusable: {e}")))?;
            if agent_terms.terms_hash() != upstream_terms_hash {
                return Err(RelayerError::challenge("upstream terms drift"));
            }
        }

        let amount: u128 = terms.amount.parse().map_err(|_| {
            RelayerError::challenge(format!(
                "upstream amount `{}` is not an integer micro amount",
                terms.amount
            ))
        })?;
        let pay_to: Address = terms
            .pay_to
            .parse()
            .map_err(|_| RelayerError::challenge("upstream payTo is not an address"))?;
        let merchant_request_hash = canonical::merchant_request_digest(
            &request.url,
            &request.method,
            request.challenge_url.as_deref(),
        )?;

        let nonce = B256::random();
        let expiry = UnixTimestamp::now() + self.config.challenge_ttl_secs;
        let issued = IssuedChallenge {
            nonce,
            amount,
            pay_to,
            expiry,
            upstream_terms_hash,
            merchant_request_hash,
        };
        self.register(issued);

        let requirement = PaymentRequirement {
            scheme: SCHEME_EXACT.into(),
            network: format!("eip155:{}", self.config.chain_id),
            asset: terms.asset.to_lowercase(),
            pay_to,
            rail: RAIL_SHIELDED_USDC.into(),
            amount,
            challenge_nonce: nonce,
            challenge_expiry: expiry.as_secs(),
            merchant_pub_key: self.config.merchant_pub_key,
            verifying_contract: self.config.verifying_contract,
            description: terms.description.clone(),
            mime_type: terms.mime_type.clone(),
            extra: Some(serde_json::json!({
                "upstreamTermsHash": upstream_terms_hash,
                "upstreamNetwork": terms.network,
                "upstreamRail": terms.rail,
                "merchantRequestHash": merchant_request_hash,
            })),
        };
        let envelope = PaymentRequiredEnvelope {
            x402_version: X402Version2,
            accepts: vec![requirement.clone()],
            error: None,
        };
        Ok(ChallengeResponse {
            requirement,
            payment_required_header: encode_payment_required(&envelope),
        })
    }

    /// Registers a challenge under its expected challenge hash. The hash
    /// binds the nonce, the amount, and this relayer's verifying contract.
    pub fn register(&self, challenge: IssuedChallenge) {
        let expected = challenge_hash(
            &challenge.nonce,
            challenge.amount,
            self.config.verifying_contract,
        );
        self.issued.insert(expected, challenge);
    }

    /// Looks up a live challenge by the challenge hash a payload claims.
    pub fn assert_live(
        &self,
        claimed_hash: &B256,
        amount: u128,
    ) -> Result<IssuedChallenge, RelayerError> {
        let entry = self
            .issued
            .get(claimed_hash)
            .map(|e| e.value().clone())
            .ok_or_else(|| RelayerError::challenge("unknown challenge nonce"))?;
        if entry.expiry < UnixTimestamp::now() {
            self.issued.remove(claimed_hash);
            return Err(RelayerError::challenge("challenge expired"));
        }
        if entry.amount != amount {
            return Err(RelayerError::challenge("challenge amount mismatch"));
        }
        Ok(entry)
    }

    /// Drops expired challenges; wired to a periodic task by the server.
    pub fn purge_expired(&self) {
        let now = UnixTimestamp::now();
        self.issued.retain(|_, challenge| challenge.expiry >= now);
    }

    /// Number of live challenges; test observability.
    pub fn live_challenges(&self) -> usize {
        self.issued.len()
    }
}
