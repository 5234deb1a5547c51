//! End-to-end scenarios for the credit-channel processor.

mod common;

use axum::http::StatusCode;
use std::sync::atomic::Ordering;

use shield_relayer_local::credit::STALE_STATE_REASON;
use shield_relayer_local::payout::PayoutMode;
use shield_types::credit::SignedCreditState;
use shield_types::proto::relay::{
    CloseFinalizeRequest, CloseStartRequest, CreditPayRequest, RelayStatus, TopupRequest,
};
use shield_types::timestamp::UnixTimestamp;

use common::{Harness, merchant_request, request_id, spawn_merchant};

/// A successful topup of `amount`, returning the countersigned head.
async fn seed_channel(
    harness: &Harness,
    processor: &shield_relayer_local::credit::CreditProcessor,
    amount: u128,
    tag: &str,
) -> SignedCreditState {
    let requirement = harness.issue_challenge(amount, &amount.to_string());
    let payload = harness.build_payload(&requirement);
    let signature = harness.sign_payload(&payload);
    let response = processor
        .topup(TopupRequest {
            request_id: request_id(tag),
            channel_id: harness.channel_id(),
            payment_payload: payload,
            payment_payload_signature: signature,
            latest_state: None,
        })
        .await;
    assert_eq!(response.status, RelayStatus::Done, "{:?}", response.failure_reason);
    let state = response.next_state.unwrap();
    assert_eq!(state.seq, 0);
    assert_eq!(state.available, amount);
    harness.countersign(&state, &response.next_state_relayer_signature.unwrap())
}

#[tokio::test]
async fn test_topup_seeds_channel() {
    let harness = Harness::new("credit-topup").await;
    let processor = harness.credit(PayoutMode::Noop);
    let signed = seed_channel(&harness, &processor, 100, "topup-1").await;

    assert_eq!(signed.state.cumulative_spent, 0);
    let status = processor.status(&harness.channel_id()).await.unwrap();
    assert!(status.exists);
    assert!(!status.closing);
    assert_eq!(status.seq, Some(0));
    assert_eq!(status.available, Some(100));
}

#[tokio::test]
async fn test_topup_replay_returns_cached_response() {
    let harness = Harness::new("credit-topup-replay").await;
    let processor = harness.credit(PayoutMode::Noop);
    let requirement = harness.issue_challenge(100, "100");
    let payload = harness.build_payload(&requirement);
    let signature = harness.sign_payload(&payload);
    let request = TopupRequest {
        request_id: request_id("topup-replay"),
        channel_id: harness.channel_id(),
        payment_payload: payload,
        payment_payload_signature: signature,
        latest_state: None,
    };

    let first = processor.topup(request.clone()).await;
    let second = processor.topup(request).await;
    assert_eq!(first.status, RelayStatus::Done);
    assert_eq!(first, second);
    assert_eq!(harness.pool.settle_calls(), 1);
}

#[tokio::test]
async fn test_second_topup_requires_matching_latest_state() {
    let harness = Harness::new("credit-topup-cas").await;
    let processor = harness.credit(PayoutMode::Noop);
    let signed = seed_channel(&harness, &processor, 100, "topup-first").await;

    // Correct latest state: balance accrues, seq advances.
    let requirement = harness.issue_challenge(50, "50");
    let payload = harness.build_payload(&requirement);
    let signature = harness.sign_payload(&payload);
    let response = processor
        .topup(TopupRequest {
            request_id: request_id("topup-second"),
            channel_id: harness.channel_id(),
            payment_payload: payload,
            payment_payload_signature: signature,
            latest_state: Some(signed.clone()),
        })
        .await;
    assert_eq!(response.status, RelayStatus::Done, "{:?}", response.failure_reason);
    let state = response.next_state.unwrap();
    assert_eq!(state.seq, 1);
    assert_eq!(state.available, 150);

    // A topup without latestState while a head exists is a hard fail.
    let requirement = harness.issue_challenge(25, "25");
    let payload = harness.build_payload(&requirement);
    let signature = harness.sign_payload(&payload);
    let rejected = processor
        .topup(TopupRequest {
            request_id: request_id("topup-third"),
            channel_id: harness.channel_id(),
            payment_payload: payload,
            payment_payload_signature: signature,
            latest_state: None,
        })
        .await;
    assert_eq!(rejected.status, RelayStatus::Failed);
    assert_eq!(
        rejected.failure_reason.as_deref(),
        Some("latestState required: channel head exists")
    );
}

#[tokio::test]
async fn test_topup_then_two_debits() {
    let harness = Harness::new("credit-two-debits").await;
    let (merchant_url, hits) = spawn_merchant(StatusCode::OK, vec![], "ok").await;
    let processor = harness.credit(PayoutMode::Forward);
    let signed0 = seed_channel(&harness, &processor, 100, "debits-topup").await;

    let requirement = harness.issue_challenge(10, "10");
    let request = merchant_request(&merchant_url);

    // First debit extends seq 0.
    let (intent1, intent1_sig) = harness.debit_intent(
        &signed0.state,
        request_id("debit-1"),
        10,
        &request,
        &requirement,
        UnixTimestamp::now().as_secs() + 300,
    );
    let pay1 = processor
        .pay(CreditPayRequest {
            request_id: request_id("debit-1"),
            latest_state: signed0.clone(),
            debit_intent: intent1,
            debit_intent_signature: intent1_sig,
            merchant_request: request.clone(),
            requirement: requirement.clone(),
        })
        .await;
    assert_eq!(pay1.status, RelayStatus::Done, "{:?}", pay1.failure_reason);
    let state1 = pay1.next_state.unwrap();
    assert_eq!(state1.seq, 1);
    assert_eq!(state1.available, 90);
    assert_eq!(state1.cumulative_spent, 10);

    // Second debit extends seq 1.
    let signed1 = harness.countersign(&state1, &pay1.next_state_relayer_signature.unwrap());
    let (intent2, intent2_sig) = harness.debit_intent(
        &signed1.state,
        request_id("debit-2"),
        10,
        &request,
        &requirement,
        UnixTimestamp::now().as_secs() + 300,
    );
    let pay2 = processor
        .pay(CreditPayRequest {
            request_id: request_id("debit-2"),
            latest_state: signed1,
            debit_intent: intent2,
            debit_intent_signature: intent2_sig,
            merchant_request: request.clone(),
            requirement: requirement.clone(),
        })
        .await;
    assert_eq!(pay2.status, RelayStatus::Done, "{:?}", pay2.failure_reason);
    let state2 = pay2.next_state.unwrap();
    assert_eq!(state2.seq, 2);
    assert_eq!(state2.available, 80);
    assert_eq!(state2.cumulative_spent, 20);

    let status = processor.status(&harness.channel_id()).await.unwrap();
    assert_eq!(status.seq, Some(2));
    assert_eq!(status.available, Some(80));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stale_latest_state_is_rejected() {
    let harness = Harness::new("credit-stale").await;
    let (merchant_url, hits) = spawn_merchant(StatusCode::OK, vec![], "ok").await;
    let processor = harness.credit(PayoutMode::Forward);
    let signed0 = seed_channel(&harness, &processor, 100, "stale-topup").await;

    let requirement = harness.issue_challenge(10, "10");
    let request = merchant_request(&merchant_url);
    let (intent1, intent1_sig) = harness.debit_intent(
        &signed0.state,
        request_id("stale-1"),
        10,
        &request,
        &requirement,
        UnixTimestamp::now().as_secs() + 300,
    );
    let pay1 = processor
        .pay(CreditPayRequest {
            request_id: request_id("stale-1"),
            latest_state: signed0.clone(),
            debit_intent: intent1,
            debit_intent_signature: intent1_sig,
            merchant_request: request.clone(),
            requirement: requirement.clone(),
        })
        .await;
    assert_eq!(pay1.status, RelayStatus::Done);

    // Replaying the seq-0 state after the head moved to seq 1 is stale.
    let (intent_stale, intent_stale_sig) = harness.debit_intent(
        &signed0.state,
        request_id("stale-2"),
        10,
        &request,
        &requirement,
        UnixTimestamp::now().as_secs() + 300,
    );
    let stale = processor
        .pay(CreditPayRequest {
            request_id: request_id("stale-2"),
            latest_state: signed0,
            debit_intent: intent_stale,
            debit_intent_signature: intent_stale_sig,
            merchant_request: request,
            requirement,
        })
        .await;
    assert_eq!(stale.status, RelayStatus::Failed);
    assert_eq!(stale.failure_reason.as_deref(), Some(STALE_STATE_REASON));

    // Head did not advance and the merchant saw only the first debit.
    let status = processor.status(&harness.channel_id()).await.unwrap();
    assert_eq!(status.seq, Some(1));
    assert_eq!(status.available, Some(90));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pay_replay_survives_restart_without_reforwarding() {
    let harness = Harness::new("credit-restart").await;
    let (merchant_url, hits) = spawn_merchant(StatusCode::OK, vec![], "ok").await;
    let processor = harness.credit(PayoutMode::Forward);
    let signed0 = seed_channel(&harness, &processor, 100, "restart-topup").await;

    let requirement = harness.issue_challenge(10, "10");
    let request = merchant_request(&merchant_url);
    let (intent, intent_sig) = harness.debit_intent(
        &signed0.state,
        request_id("restart-1"),
        10,
        &request,
        &requirement,
        UnixTimestamp::now().as_secs() + 300,
    );
    let pay_request = CreditPayRequest {
        request_id: request_id("restart-1"),
        latest_state: signed0,
        debit_intent: intent,
        debit_intent_signature: intent_sig,
        merchant_request: request,
        requirement,
    };

    let first = processor.pay(pay_request.clone()).await;
    assert_eq!(first.status, RelayStatus::Done);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // A fresh processor over the same durable store: empty caches, same
    // request id. The durable response must replay; the merchant must not
    // see a second forward.
    let reopened = harness.reopen_store().await;
    let restarted = harness.credit_with_store(PayoutMode::Forward, reopened);
    let replay = restarted.pay(pay_request).await;
    assert_eq!(replay, first);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_overdraft_and_deadline_rejections() {
    let harness = Harness::new("credit-overdraft").await;
    let processor = harness.credit(PayoutMode::Noop);
    let signed0 = seed_channel(&harness, &processor, 20, "overdraft-topup").await;
    let request = merchant_request("https://merchant.example/data");

    // More than the channel holds.
    let requirement = harness.issue_challenge(50, "50");
    let (intent, intent_sig) = harness.debit_intent(
        &signed0.state,
        request_id("overdraft-1"),
        50,
        &request,
        &requirement,
        UnixTimestamp::now().as_secs() + 300,
    );
    let overdraft = processor
        .pay(CreditPayRequest {
            request_id: request_id("overdraft-1"),
            latest_state: signed0.clone(),
            debit_intent: intent,
            debit_intent_signature: intent_sig,
            merchant_request: request.clone(),
            requirement,
        })
        .await;
    assert_eq!(overdraft.status, RelayStatus::Failed);
    assert_eq!(
        overdraft.failure_reason.as_deref(),
        Some("insufficient channel balance")
    );

    // An expired intent.
    let requirement = harness.issue_challenge(5, "5");
    let (intent, intent_sig) = harness.debit_intent(
        &signed0.state,
        request_id("deadline-1"),
        5,
        &request,
        &requirement,
        UnixTimestamp::now().as_secs() - 10,
    );
    let expired = processor
        .pay(CreditPayRequest {
            request_id: request_id("deadline-1"),
            latest_state: signed0,
            debit_intent: intent,
            debit_intent_signature: intent_sig,
            merchant_request: request,
            requirement,
        })
        .await;
    assert_eq!(expired.status, RelayStatus::Failed);
    assert_eq!(
        expired.failure_reason.as_deref(),
        Some("debit intent deadline passed")
    );

    // Neither attempt advanced the head.
    let status = processor.status(&harness.channel_id()).await.unwrap();
    assert_eq!(status.seq, Some(0));
    assert_eq!(status.available, Some(20));
}

#[tokio::test]
async fn test_foreign_intent_signer_is_rejected() {
    let harness = Harness::new("credit-foreign-signer").await;
    let processor = harness.credit(PayoutMode::Noop);
    let signed0 = seed_channel(&harness, &processor, 100, "foreign-topup").await;
    let request = merchant_request("https://merchant.example/data");
    let requirement = harness.issue_challenge(10, "10");

    let (intent, _) = harness.debit_intent(
        &signed0.state,
        request_id("foreign-1"),
        10,
        &request,
        &requirement,
        UnixTimestamp::now().as_secs() + 300,
    );
    // Signed by someone who is not the channel's agent.
    let stranger = alloy_signer_local::PrivateKeySigner::random();
    let domain = shield_types::typed_data::credit_domain(
        common::CHAIN_ID,
        common::VERIFYING_CONTRACT,
    );
    let hash = shield_types::typed_data::debit_intent_signing_hash(&intent, &domain);
    let foreign_sig = alloy_signer::SignerSync::sign_hash_sync(&stranger, &hash).unwrap();

    let response = processor
        .pay(CreditPayRequest {
            request_id: request_id("foreign-1"),
            latest_state: signed0,
            debit_intent: intent,
            debit_intent_signature: alloy_primitives::Bytes::from(foreign_sig.as_bytes().to_vec()),
            merchant_request: request,
            requirement,
        })
        .await;
    assert_eq!(response.status, RelayStatus::Failed);
    assert_eq!(
        response.failure_reason.as_deref(),
        Some("debit intent signer mismatch")
    );
}

#[tokio::test]
async fn test_close_lifecycle() {
    let harness = Harness::new("credit-close").await;
    let processor = harness.credit(PayoutMode::Noop);
    let signed0 = seed_channel(&harness, &processor, 100, "close-topup").await;
    let channel_id = harness.channel_id();

    let started = processor
        .close_start(CloseStartRequest {
            latest_state: signed0.clone(),
        })
        .await;
    assert_eq!(started.status, RelayStatus::Done, "{:?}", started.failure_reason);
    assert!(started.tx_hash.is_some());

    let status = processor.status(&channel_id).await.unwrap();
    assert!(status.closing);

    // Debits are refused while the channel is closing.
    let requirement = harness.issue_challenge(10, "10");
    let request = merchant_request("https://merchant.example/data");
    let (intent, intent_sig) = harness.debit_intent(
        &signed0.state,
        request_id("close-pay"),
        10,
        &request,
        &requirement,
        UnixTimestamp::now().as_secs() + 300,
    );
    let refused = processor
        .pay(CreditPayRequest {
            request_id: request_id("close-pay"),
            latest_state: signed0,
            debit_intent: intent,
            debit_intent_signature: intent_sig,
            merchant_request: request,
            requirement,
        })
        .await;
    assert_eq!(refused.status, RelayStatus::Failed);
    assert_eq!(refused.failure_reason.as_deref(), Some("channel is closing"));

    let finalized = processor
        .close_finalize(CloseFinalizeRequest { channel_id })
        .await;
    assert_eq!(finalized.status, RelayStatus::Done);

    let status = processor.status(&channel_id).await.unwrap();
    assert!(!status.exists);
    assert!(!status.closing);
}

#[tokio::test]
async fn test_finalize_without_close_start_is_rejected() {
    let harness = Harness::new("credit-finalize-early").await;
    let processor = harness.credit(PayoutMode::Noop);
    seed_channel(&harness, &processor, 100, "finalize-topup").await;

    let response = processor
        .close_finalize(CloseFinalizeRequest {
            channel_id: harness.channel_id(),
        })
        .await;
    assert_eq!(response.status, RelayStatus::Failed);
    assert_eq!(response.failure_reason.as_deref(), Some("channel is not closing"));
}
