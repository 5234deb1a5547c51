//! HTTP endpoints implemented by the shielded relayer.
//!
//! These are the server-side handlers agents call to pay merchants under the
//! x402 retry protocol. Processor outcomes are bodies of
//! `{status: DONE | FAILED, ...}`; the HTTP status is 200 on `DONE` and the
//! error-kind mapping of the failure otherwise, with the failure reason
//! preserved verbatim for the agent.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

use alloy_primitives::B256;
use shield_types::error::{ErrorKind, RelayerError};
use shield_types::proto::headers;
use shield_types::proto::relay::{
    ChallengeRequest, CloseChallengeRequest, CloseFinalizeRequest, CloseStartRequest,
    CreditPayRequest, PayRequest, RelayStatus, TopupRequest,
};
use shield_relayer_local::store::SettlementStore;

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/v1/relay/pay", get(get_pay_info))
        .route("/v1/relay/pay", post(post_pay))
        .route("/v1/relay/challenge", get(get_challenge_info))
        .route("/v1/relay/challenge", post(post_challenge))
        .route("/v1/relay/credit/topup", post(post_credit_topup))
        .route("/v1/relay/credit/pay", post(post_credit_pay))
        .route("/v1/relay/credit/close/start", post(post_close_start))
        .route("/v1/relay/credit/close/challenge", post(post_close_challenge))
        .route("/v1/relay/credit/close/finalize", post(post_close_finalize))
        .route("/v1/relay/credit/close/{channel_id}", get(get_channel_status))
        .route("/v1/relay/settlement/{settlement_id}", get(get_settlement))
}

/// HTTP status for a failed processor outcome.
fn failure_status(kind: Option<ErrorKind>) -> StatusCode {
    match kind {
        Some(ErrorKind::Protocol) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::Nullifier) => StatusCode::CONFLICT,
        Some(ErrorKind::Settlement) | Some(ErrorKind::Payout) => StatusCode::BAD_GATEWAY,
        Some(ErrorKind::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        Some(ErrorKind::Challenge)
        | Some(ErrorKind::Signature)
        | Some(ErrorKind::State)
        | Some(ErrorKind::Proof)
        | None => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn error_response(error: RelayerError) -> Response {
    let status = failure_status(Some(error.kind()));
    let body = json!({
        "status": "FAILED",
        "failureReason": error.reason(),
        "failureKind": error.kind(),
    });
    (status, Json(body)).into_response()
}

/// `GET /`: greeting from the relayer.
#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /health`: liveness and operating mode.
#[instrument(skip_all)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health.clone())
}

/// `GET /v1/relay/pay`: machine-readable description of the pay endpoint.
#[instrument(skip_all)]
pub async fn get_pay_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/v1/relay/pay",
        "description": "POST to execute a direct shielded payment",
        "body": {
            "merchantRequest": "MerchantRequest",
            "requirement": "PaymentRequirement",
            "paymentSignatureHeader": "base64 PAYMENT-SIGNATURE envelope",
            "idempotencyKey": "optional string",
        }
    }))
}

/// `GET /v1/relay/challenge`: machine-readable description of the challenge
/// endpoint.
#[instrument(skip_all)]
pub async fn get_challenge_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/v1/relay/challenge",
        "description": "POST to rewrite a merchant challenge onto the shielded rail",
        "body": {
            "merchantRequest": "MerchantRequest",
            "merchantPaymentRequiredHeader": "optional base64 PAYMENT-REQUIRED envelope",
        }
    }))
}

/// `POST /v1/relay/pay`: direct shielded payment.
#[instrument(skip_all)]
pub async fn post_pay(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PayRequest>,
) -> Response {
    let response = state.direct.handle_pay(body).await;
    let status = match response.status {
        RelayStatus::Done => StatusCode::OK,
        RelayStatus::Failed => failure_status(response.failure_kind),
    };
    let settlement_header = [(headers::RELAYER_SETTLEMENT_ID, response.settlement_id.clone())];
    (status, settlement_header, Json(response)).into_response()
}

/// `POST /v1/relay/challenge`: shielded challenge issuance.
#[instrument(skip_all)]
pub async fn post_challenge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChallengeRequest>,
) -> Response {
    match state
        .bridge
        .issue(
            &body.merchant_request,
            body.merchant_payment_required_header.as_deref(),
        )
        .await
    {
        Ok(response) => {
            let nonce_header = [(
                headers::CHALLENGE_NONCE,
                format!("{:#x}", response.requirement.challenge_nonce),
            )];
            (StatusCode::OK, nonce_header, Json(response)).into_response()
        }
        Err(error) => error_response(error),
    }
}

/// `POST /v1/relay/credit/topup`: credit a channel from a shielded note.
#[instrument(skip_all)]
pub async fn post_credit_topup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TopupRequest>,
) -> Response {
    let response = state.credit.topup(body).await;
    let status = match response.status {
        RelayStatus::Done => StatusCode::OK,
        RelayStatus::Failed => failure_status(response.failure_kind),
    };
    (status, Json(response)).into_response()
}

/// `POST /v1/relay/credit/pay`: execute one signed debit.
#[instrument(skip_all)]
pub async fn post_credit_pay(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreditPayRequest>,
) -> Response {
    let response = state.credit.pay(body).await;
    let status = match response.status {
        RelayStatus::Done => StatusCode::OK,
        RelayStatus::Failed => failure_status(response.failure_kind),
    };
    (status, Json(response)).into_response()
}

/// `POST /v1/relay/credit/close/start`.
#[instrument(skip_all)]
pub async fn post_close_start(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CloseStartRequest>,
) -> Response {
    let response = state.credit.close_start(body).await;
    let status = match response.status {
        RelayStatus::Done => StatusCode::OK,
        RelayStatus::Failed => failure_status(response.failure_kind),
    };
    (status, Json(response)).into_response()
}

/// `POST /v1/relay/credit/close/challenge`.
#[instrument(skip_all)]
pub async fn post_close_challenge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CloseChallengeRequest>,
) -> Response {
    let response = state.credit.close_challenge(body).await;
    let status = match response.status {
        RelayStatus::Done => StatusCode::OK,
        RelayStatus::Failed => failure_status(response.failure_kind),
    };
    (status, Json(response)).into_response()
}

/// `POST /v1/relay/credit/close/finalize`.
#[instrument(skip_all)]
pub async fn post_close_finalize(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CloseFinalizeRequest>,
) -> Response {
    let response = state.credit.close_finalize(body).await;
    let status = match response.status {
        RelayStatus::Done => StatusCode::OK,
        RelayStatus::Failed => failure_status(response.failure_kind),
    };
    (status, Json(response)).into_response()
}

/// `GET /v1/relay/credit/close/{channelId}`: channel status.
#[instrument(skip_all)]
pub async fn get_channel_status(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Response {
    let Ok(channel_id) = B256::from_str(&channel_id) else {
        return error_response(RelayerError::protocol("invalid channel id"));
    };
    match state.credit.status(&channel_id).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => error_response(error),
    }
}

/// `GET /v1/relay/settlement/{settlementId}`: settlement record lookup for
/// agent-side reconciliation.
#[instrument(skip_all)]
pub async fn get_settlement(
    State(state): State<Arc<AppState>>,
    Path(settlement_id): Path<String>,
) -> Response {
    match state.store.get_by_settlement_id(&settlement_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown settlement id"})),
        )
            .into_response(),
        Err(error) => error_response(RelayerError::internal(error.to_string())),
    }
}
