//! Shared server state handed to the HTTP handlers.

use alloy_primitives::Address;
use serde::Serialize;
use std::sync::Arc;

use shield_relayer_local::challenge::ChallengeBridge;
use shield_relayer_local::credit::CreditProcessor;
use shield_relayer_local::direct::DirectProcessor;
use shield_relayer_local::store::FsStore;

/// Everything a request handler can reach.
pub struct AppState {
    pub direct: DirectProcessor,
    pub credit: CreditProcessor,
    pub bridge: Arc<ChallengeBridge>,
    pub store: Arc<FsStore>,
    pub health: HealthInfo,
}

/// Liveness and mode report for `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    pub status: &'static str,
    pub onchain_verifier_enabled: bool,
    pub payout_mode: &'static str,
    pub store_path: String,
    pub chain_id: u64,
    pub relayer_address: Address,
}
