//! Relayer server assembly and lifecycle.
//!
//! - Loads `.env` values and the JSON config.
//! - Initializes tracing from `RUST_LOG`.
//! - Wires the pool adapters (live RPC or allow-all stub), the payout
//!   adapter, the challenge bridge, and both processors over the durable
//!   store.
//! - Starts an Axum HTTP server with CORS and request tracing, a periodic
//!   challenge purge task, and graceful shutdown on SIGTERM/SIGINT.

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use alloy_primitives::keccak256;
use shield_relayer_local::challenge::{BridgeConfig, ChallengeBridge};
use shield_relayer_local::credit::{CreditConfig, CreditProcessor};
use shield_relayer_local::direct::{DirectConfig, DirectProcessor};
use shield_relayer_local::payout::PayoutAdapter;
use shield_relayer_local::pool::{
    CreditSettlement, OnchainPool, ProofVerifier, SettlementSubmitter, StubPool,
};
use shield_relayer_local::signer::RelayerSigner;
use shield_relayer_local::store::FsStore;

use crate::config::Config;
use crate::handlers;
use crate::state::{AppState, HealthInfo};

/// One token cancels everything: the HTTP server, the challenge purge task,
/// and anything else spawned off it. SIGTERM and SIGINT both trip it.
fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trip = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => trip.cancel(),
            _ = sigint.recv() => trip.cancel(),
        }
    });
    Ok(token)
}

/// Initializes and runs the relayer server.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize rustls crypto provider (ring)
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .expect("Failed to initialize rustls crypto provider");

    // Load .env variables
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load()?;
    let payout_mode = config.payout_mode()?;

    let signer = match config.relayer_private_key() {
        Some(key) => Arc::new(RelayerSigner::from_hex(key)?),
        None => {
            tracing::warn!(
                "no relayer key configured; using an ephemeral identity (credit heads will not survive restarts)"
            );
            Arc::new(RelayerSigner::random())
        }
    };
    tracing::info!(relayer = %signer.address(), "relayer identity");

    let store = Arc::new(FsStore::open(config.store_path()).await?);

    let (verifier, settlement, credit_settlement): (
        Arc<dyn ProofVerifier>,
        Arc<dyn SettlementSubmitter>,
        Option<Arc<dyn CreditSettlement>>,
    ) = if config.onchain_verifier_enabled() {
        let rpc_url = config.rpc_url().expect("checked by onchain_verifier_enabled");
        let pool_address = config
            .pool_address()
            .expect("checked by onchain_verifier_enabled");
        let key = config
            .relayer_private_key()
            .ok_or("onchain mode requires relayerPrivateKey or RELAYER_PRIVATE_KEY")?;
        let pool = Arc::new(OnchainPool::connect(
            rpc_url.clone(),
            key,
            pool_address,
            config.credit_settlement_address(),
        )?);
        tracing::info!(pool = %pool_address, rpc = %rpc_url, "onchain verifier enabled");
        let credit = config
            .credit_settlement_address()
            .map(|_| pool.clone() as Arc<dyn CreditSettlement>);
        (pool.clone(), pool, credit)
    } else {
        tracing::warn!("onchain verifier disabled; running with the allow-all stub pool");
        let pool = Arc::new(StubPool::new());
        (pool.clone(), pool.clone(), Some(pool))
    };

    let payout = Arc::new(PayoutAdapter::new(
        payout_mode,
        Duration::from_secs(config.merchant_timeout_secs()),
        Some(signer.clone()),
    ));
    let bridge = Arc::new(ChallengeBridge::new(BridgeConfig {
        chain_id: config.chain_id(),
        verifying_contract: config.verifying_contract(),
        merchant_pub_key: config
            .merchant_pub_key()
            .unwrap_or_else(|| keccak256(signer.address())),
        challenge_ttl_secs: config.challenge_ttl_secs(),
        refetch_timeout: Duration::from_secs(config.merchant_timeout_secs()),
    }));

    let direct = DirectProcessor::new(
        verifier.clone(),
        settlement.clone(),
        payout.clone(),
        store.clone(),
        bridge.clone(),
        DirectConfig {
            refetch_challenge: config.refetch_challenge(),
        },
    );
    let credit = CreditProcessor::new(
        verifier,
        settlement,
        payout,
        store.clone(),
        bridge.clone(),
        signer.clone(),
        credit_settlement,
        CreditConfig {
            chain_id: config.chain_id(),
            verifying_contract: config.verifying_contract(),
        },
    );

    let state = Arc::new(AppState {
        direct,
        credit,
        bridge: bridge.clone(),
        store,
        health: HealthInfo {
            status: "ok",
            onchain_verifier_enabled: config.onchain_verifier_enabled(),
            payout_mode: payout_mode.as_str(),
            store_path: config.store_path().display().to_string(),
            chain_id: config.chain_id(),
            relayer_address: signer.address(),
        },
    });

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(state))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e))?;

    let shutdown = shutdown_token()?;

    // Expired challenges are purged in the background until shutdown.
    let purge_token = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => bridge.purge_expired(),
                _ = purge_token.cancelled() => break,
            }
        }
    });

    let axum_graceful_shutdown = async move { shutdown.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    Ok(())
}
