//! End-to-end scenarios for the shielded challenge bridge.

mod common;

use axum::http::StatusCode;

use shield_types::crypto::challenge_hash;
use shield_types::proto::{RAIL_SHIELDED_USDC, SCHEME_EXACT, decode_payment_required};

use common::{Harness, merchant_request, spawn_merchant, upstream_challenge_header};

#[tokio::test]
async fn test_issue_rewrites_merchant_challenge() {
    let harness = Harness::new("bridge-issue").await;
    let (merchant_url, hits) = spawn_merchant(
        StatusCode::PAYMENT_REQUIRED,
        vec![("payment-required", upstream_challenge_header("40"))],
        "",
    )
    .await;

    let response = harness
        .bridge
        .issue(&merchant_request(&merchant_url), None)
        .await
        .unwrap();

    // Exactly one unpaid refetch hit the merchant.
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);

    let requirement = &response.requirement;
    assert_eq!(requirement.rail, RAIL_SHIELDED_USDC);
    assert_eq!(requirement.scheme, SCHEME_EXACT);
    assert_eq!(requirement.amount, 40);
    assert_eq!(requirement.network, format!("eip155:{}", common::CHAIN_ID));
    assert_eq!(requirement.verifying_contract, common::VERIFYING_CONTRACT);
    assert_eq!(requirement.pay_to, common::MERCHANT_PAY_TO);
    let extra = requirement.extra.as_ref().unwrap();
    assert!(extra.get("upstreamTermsHash").is_some());
    assert_eq!(extra["upstreamNetwork"], "eip155:84532");

    // The emitted header decodes back to the same requirement.
    let envelope = decode_payment_required(&response.payment_required_header).unwrap();
    assert_eq!(envelope.accepts.len(), 1);
    assert_eq!(&envelope.accepts[0], requirement);

    // The nonce is live under its expected challenge hash.
    let expected = challenge_hash(
        &requirement.challenge_nonce,
        requirement.amount,
        requirement.verifying_contract,
    );
    assert!(harness.bridge.assert_live(&expected, 40).is_ok());
}

#[tokio::test]
async fn test_issue_detects_agent_merchant_drift() {
    let harness = Harness::new("bridge-drift").await;
    let (merchant_url, _) = spawn_merchant(
        StatusCode::PAYMENT_REQUIRED,
        vec![("payment-required", upstream_challenge_header("40"))],
        "",
    )
    .await;

    // The agent holds a stale challenge quoting a different amount.
    let stale_header = upstream_challenge_header("41");
    let error = harness
        .bridge
        .issue(&merchant_request(&merchant_url), Some(&stale_header))
        .await
        .unwrap_err();
    assert_eq!(error.reason(), "upstream terms drift");

    // A matching header passes.
    let fresh_header = upstream_challenge_header("40");
    assert!(
        harness
            .bridge
            .issue(&merchant_request(&merchant_url), Some(&fresh_header))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_issue_refuses_non_402_merchants() {
    let harness = Harness::new("bridge-not-402").await;
    let (merchant_url, _) = spawn_merchant(StatusCode::OK, vec![], "free content").await;

    let error = harness
        .bridge
        .issue(&merchant_request(&merchant_url), None)
        .await
        .unwrap_err();
    assert!(error.reason().contains("did not return a payment challenge"));
}

#[tokio::test]
async fn test_challenge_body_fallback() {
    let harness = Harness::new("bridge-body").await;
    // A provider that returns the challenge JSON in the body with no header.
    let body: &'static str = Box::leak(
        serde_json::json!({
            "x402Version": 1,
            "requirements": [{
                "scheme": "exact",
                "network": "base-sepolia",
                "asset": common::MERCHANT_ASSET,
                "payTo": format!("{:#x}", common::MERCHANT_PAY_TO),
                "maxAmountRequired": "25",
            }],
        })
        .to_string()
        .into_boxed_str(),
    );
    let (merchant_url, _) = spawn_merchant(StatusCode::PAYMENT_REQUIRED, vec![], body).await;

    let response = harness
        .bridge
        .issue(&merchant_request(&merchant_url), None)
        .await
        .unwrap();
    assert_eq!(response.requirement.amount, 25);
}
