//! Shielded x402 relayer HTTP entrypoint.
//!
//! This binary launches an Axum-based HTTP server exposing the relayer's
//! payment-processing engine: direct shielded payments, credit channels, and
//! the shielded challenge bridge.
//!
//! Endpoints:
//! - `POST /v1/relay/pay` – direct shielded payment
//! - `POST /v1/relay/challenge` – rewrite a merchant challenge onto the shielded rail
//! - `POST /v1/relay/credit/topup | /pay | /close/start | /close/challenge | /close/finalize`
//! - `GET /v1/relay/credit/close/{channelId}` – channel status
//! - `GET /v1/relay/settlement/{settlementId}` – settlement record lookup
//! - `GET /health` – liveness and mode
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the binding address
//! - `RELAYER_PRIVATE_KEY` supplies the signing key when the config omits it
//! - `RUST_LOG` controls tracing verbosity

mod config;
mod handlers;
mod run;
mod state;

use std::process;

use crate::run::run;

#[tokio::main]
async fn main() {
    let result = run().await;
    if let Err(e) = result {
        println!("{e}");
        process::exit(1)
    }
}
