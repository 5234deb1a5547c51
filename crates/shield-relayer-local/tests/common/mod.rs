//! Shared harness for processor integration tests: an in-memory pool, a
//! file store under a unique temp dir, a challenge bridge with hand-issued
//! challenges, and small axum merchants to play the upstream side.

#![allow(dead_code)] // not every test binary exercises every helper

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, B256, Bytes, address, keccak256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use axum::Router;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use shield_relayer_local::challenge::{BridgeConfig, ChallengeBridge, IssuedChallenge};
use shield_relayer_local::credit::{CreditConfig, CreditProcessor};
use shield_relayer_local::direct::{DirectConfig, DirectProcessor};
use shield_relayer_local::payout::{PayoutAdapter, PayoutMode};
use shield_relayer_local::pool::StubPool;
use shield_relayer_local::signer::RelayerSigner;
use shield_relayer_local::store::FsStore;
use shield_types::credit::{CreditDebitIntent, CreditState, SignedCreditState};
use shield_types::crypto::{challenge_hash, upstream_terms_hash};
use shield_types::proto::relay::MerchantRequest;
use shield_types::proto::{
    PaymentRequirement, PaymentSignatureEnvelope, RAIL_SHIELDED_USDC, SCHEME_EXACT,
    ShieldedPaymentPayload, X402Version2, encode_payment_signature,
};
use shield_types::timestamp::UnixTimestamp;
use shield_types::typed_data;

pub const CHAIN_ID: u64 = 84532;
pub const VERIFYING_CONTRACT: Address = address!("0x0000000000000000000000000000000000000002");
pub const MERCHANT_PAY_TO: Address = address!("0x00000000000000000000000000000000000000aa");
pub const MERCHANT_ASSET: &str = "0xaaaa000000000000000000000000000000000001";

pub struct Harness {
    pub pool: Arc<StubPool>,
    pub bridge: Arc<ChallengeBridge>,
    pub store: Arc<FsStore>,
    pub relayer: Arc<RelayerSigner>,
    pub agent: PrivateKeySigner,
    store_root: PathBuf,
}

impl Harness {
    pub async fn new(tag: &str) -> Self {
        let store_root = std::env::temp_dir().join(format!(
            "shield-relayer-test-{tag}-{}-{:x}",
            std::process::id(),
            B256::random()
        ));
        let store = Arc::new(FsStore::open(&store_root).await.expect("store opens"));
        let bridge = Arc::new(ChallengeBridge::new(BridgeConfig {
            chain_id: CHAIN_ID,
            verifying_contract: VERIFYING_CONTRACT,
            merchant_pub_key: B256::repeat_byte(0x11),
            challenge_ttl_secs: 300,
            refetch_timeout: Duration::from_secs(5),
        }));
        Self {
            pool: Arc::new(StubPool::new()),
            bridge,
            store,
            relayer: Arc::new(RelayerSigner::random()),
            agent: PrivateKeySigner::random(),
            store_root,
        }
    }

    /// A second process over the same durable state: fresh pool counters
    /// keep their values, caches start empty.
    pub async fn reopen_store(&self) -> Arc<FsStore> {
        Arc::new(FsStore::open(&self.store_root).await.expect("store reopens"))
    }

    pub fn direct(&self, payout_mode: PayoutMode, refetch: bool) -> DirectProcessor {
        DirectProcessor::new(
            self.pool.clone(),
            self.pool.clone(),
            Arc::new(PayoutAdapter::new(
                payout_mode,
                Duration::from_secs(5),
                Some(self.relayer.clone()),
            )),
            self.store.clone(),
            self.bridge.clone(),
            DirectConfig {
                refetch_challenge: refetch,
            },
        )
    }

    pub fn credit(&self, payout_mode: PayoutMode) -> CreditProcessor {
        self.credit_with_store(payout_mode, self.store.clone())
    }

    pub fn credit_with_store(&self, payout_mode: PayoutMode, store: Arc<FsStore>) -> CreditProcessor {
        CreditProcessor::new(
            self.pool.clone(),
            self.pool.clone(),
            Arc::new(PayoutAdapter::new(
                payout_mode,
                Duration::from_secs(5),
                Some(self.relayer.clone()),
            )),
            store,
            self.bridge.clone(),
            self.relayer.clone(),
            Some(self.pool.clone()),
            CreditConfig {
                chain_id: CHAIN_ID,
                verifying_contract: VERIFYING_CONTRACT,
            },
        )
    }

    /// Registers a live challenge for `amount` whose upstream terms quote
    /// `upstream_amount`, returning the requirement an agent would hold.
    pub fn issue_challenge(&self, amount: u128, upstream_amount: &str) -> PaymentRequirement {
        let nonce = B256::random();
        let expiry = UnixTimestamp::now() + 300;
        self.bridge.register(IssuedChallenge {
            nonce,
            amount,
            pay_to: MERCHANT_PAY_TO,
            expiry,
            upstream_terms_hash: upstream_terms_hash(
                SCHEME_EXACT,
                "eip155:84532",
                MERCHANT_ASSET,
                &format!("{MERCHANT_PAY_TO:#x}"),
                upstream_amount,
            ),
            merchant_request_hash: B256::ZERO,
        });
        PaymentRequirement {
            scheme: SCHEME_EXACT.into(),
            network: format!("eip155:{CHAIN_ID}"),
            asset: MERCHANT_ASSET.into(),
            pay_to: MERCHANT_PAY_TO,
            rail: RAIL_SHIELDED_USDC.into(),
            amount,
            challenge_nonce: nonce,
            challenge_expiry: expiry.as_secs(),
            merchant_pub_key: B256::repeat_byte(0x11),
            verifying_contract: VERIFYING_CONTRACT,
            description: None,
            mime_type: None,
            extra: None,
        }
    }

    /// A structurally valid payload answering `requirement`'s challenge.
    pub fn build_payload(&self, requirement: &PaymentRequirement) -> ShieldedPaymentPayload {
        let nullifier = B256::random();
        let root = B256::random();
        let merchant_commitment = B256::random();
        let change_commitment = B256::random();
        let challenge = challenge_hash(
            &requirement.challenge_nonce,
            requirement.amount,
            requirement.verifying_contract,
        );
        let amount = shield_types::crypto::amount_word(requirement.amount);
        ShieldedPaymentPayload {
            proof: Bytes::from(vec![0x7au8; 192]),
            public_inputs: vec![
                nullifier,
                root,
                merchant_commitment,
                change_commitment,
                challenge,
                amount,
            ],
            nullifier,
            root,
            merchant_commitment,
            change_commitment,
            challenge_hash: challenge,
            encrypted_receipt: Bytes::from(vec![0x0fu8; 48]),
        }
    }

    /// EIP-191 signature by the agent over the canonical payload JSON.
    pub fn sign_payload(&self, payload: &ShieldedPaymentPayload) -> Bytes {
        let json = serde_json::to_string(payload).expect("payload serializes");
        let signature = self
            .agent
            .sign_message_sync(json.as_bytes())
            .expect("agent signs");
        Bytes::from(signature.as_bytes().to_vec())
    }

    /// The agent's `PAYMENT-SIGNATURE` header for a payload.
    pub fn signature_header(
        &self,
        requirement: &PaymentRequirement,
        payload: ShieldedPaymentPayload,
    ) -> String {
        let signature = self.sign_payload(&payload);
        encode_payment_signature(&PaymentSignatureEnvelope {
            x402_version: X402Version2,
            accepted: requirement.clone(),
            payload,
            challenge_nonce: requirement.challenge_nonce,
            signature,
        })
    }

    pub fn channel_id(&self) -> B256 {
        shield_types::crypto::channel_id(
            CHAIN_ID,
            VERIFYING_CONTRACT,
            self.agent.address(),
            self.relayer.address(),
        )
    }

    /// Counter-signs a relayer-minted state so it can travel back as
    /// `latestState`.
    pub fn countersign(&self, state: &CreditState, relayer_signature: &Bytes) -> SignedCreditState {
        let domain = typed_data::credit_domain(CHAIN_ID, VERIFYING_CONTRACT);
        let hash = typed_data::credit_state_signing_hash(state, &domain);
        let agent_signature = self.agent.sign_hash_sync(&hash).expect("agent signs state");
        SignedCreditState {
            state: state.clone(),
            agent_signature: Bytes::from(agent_signature.as_bytes().to_vec()),
            relayer_signature: relayer_signature.clone(),
        }
    }

    /// An agent-signed debit intent extending `state` by `amount` for the
    /// given merchant request and requirement.
    pub fn debit_intent(
        &self,
        state: &CreditState,
        request_id: B256,
        amount: u128,
        merchant_request: &MerchantRequest,
        requirement: &PaymentRequirement,
        deadline: u64,
    ) -> (CreditDebitIntent, Bytes) {
        let domain = typed_data::credit_domain(CHAIN_ID, VERIFYING_CONTRACT);
        let merchant_request_hash = shield_types::crypto::canonical::merchant_binding_digest(
            &merchant_request.url,
            &merchant_request.method,
            merchant_request.challenge_url.as_deref(),
            &requirement.scheme,
            &requirement.network,
            &requirement.asset,
            &format!("{:#x}", requirement.pay_to),
            requirement.amount,
        )
        .expect("binding digest");
        let intent = CreditDebitIntent {
            channel_id: state.channel_id,
            request_id,
            next_seq: state.seq + 1,
            amount,
            merchant_request_hash,
            prev_state_hash: typed_data::credit_state_signing_hash(state, &domain),
            deadline,
        };
        let hash = typed_data::debit_intent_signing_hash(&intent, &domain);
        let signature = self.agent.sign_hash_sync(&hash).expect("agent signs intent");
        (intent, Bytes::from(signature.as_bytes().to_vec()))
    }
}

pub fn merchant_request(url: &str) -> MerchantRequest {
    MerchantRequest {
        url: url.to_string(),
        method: "GET".into(),
        headers: BTreeMap::new(),
        body_base64: None,
        challenge_url: None,
    }
}

/// Deterministic request ids for retry tests.
pub fn request_id(tag: &str) -> B256 {
    keccak256(tag.as_bytes())
}

/// Serves a fixed status with optional headers on every path; returns the
/// base URL and a hit counter.
pub async fn spawn_merchant(
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: &'static str,
) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = hits.clone();
    let handler = move || {
        let hits = handler_hits.clone();
        let headers = headers.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            let mut map = HeaderMap::new();
            for (name, value) in &headers {
                map.insert(
                    HeaderName::from_static(name),
                    HeaderValue::from_str(value).expect("header value"),
                );
            }
            (status, map, body)
        }
    };
    let app = Router::new().fallback(handler);
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("merchant binds");
    let addr = listener.local_addr().expect("merchant addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("merchant serves");
    });
    (format!("http://{addr}"), hits)
}

/// An upstream 402 challenge header quoting `amount`.
pub fn upstream_challenge_header(amount: &str) -> String {
    shield_types::util::b64::encode(
        serde_json::json!({
            "x402Version": 1,
            "accepts": [{
                "scheme": "exact",
                "network": "base-sepolia",
                "asset": MERCHANT_ASSET,
                "payTo": format!("{MERCHANT_PAY_TO:#x}"),
                "amount": amount,
            }],
        })
        .to_string(),
    )
}
