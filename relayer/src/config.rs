//! Configuration module for the relayer server.

use alloy_primitives::{Address, B256};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

use shield_relayer_local::payout::PayoutMode;

/// CLI arguments for the relayer server.
#[derive(Parser, Debug)]
#[command(name = "shield-relayer")]
#[command(about = "Shielded x402 relayer HTTP server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "relayer.json")]
    config: PathBuf,
}

/// Server configuration.
///
/// Fields use serde defaults that fall back to environment variables, then
/// to hardcoded defaults. A missing config file at the default location is
/// not an error; the defaults stand alone for stub-mode deployments.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    /// Numeric chain reference of the relayer's `eip155:<id>` chain.
    #[serde(default = "config_defaults::default_chain_id")]
    chain_id: u64,
    /// The pool contract the credit domain and challenges bind to.
    #[serde(default)]
    verifying_contract: Address,
    /// On-chain pool address; enables the live verifier when set with `rpcUrl`.
    #[serde(default)]
    pool_address: Option<Address>,
    #[serde(default)]
    credit_settlement_address: Option<Address>,
    #[serde(default)]
    rpc_url: Option<Url>,
    /// Hex private key; falls back to `RELAYER_PRIVATE_KEY`.
    #[serde(default = "config_defaults::default_relayer_private_key")]
    relayer_private_key: Option<String>,
    /// Public key hash advertised in issued requirements.
    #[serde(default)]
    merchant_pub_key: Option<B256>,
    #[serde(default = "config_defaults::default_payout_mode")]
    payout_mode: String,
    #[serde(default = "config_defaults::default_store_path")]
    store_path: PathBuf,
    #[serde(default = "config_defaults::default_challenge_ttl_secs")]
    challenge_ttl_secs: u64,
    #[serde(default = "config_defaults::default_merchant_timeout_secs")]
    merchant_timeout_secs: u64,
    #[serde(default = "config_defaults::default_refetch_challenge")]
    refetch_challenge: bool,
}

pub mod config_defaults {
    use std::env;
    use std::net::IpAddr;
    use std::path::PathBuf;

    pub const DEFAULT_PORT: u16 = 8402;
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_CHAIN_ID: u64 = 84532;
    pub const DEFAULT_STORE_PATH: &str = "./relayer-store";

    /// Port fallback: $PORT env var -> 8402
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Host fallback: $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().unwrap()))
    }

    pub fn default_chain_id() -> u64 {
        env::var("CHAIN_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CHAIN_ID)
    }

    pub fn default_relayer_private_key() -> Option<String> {
        env::var("RELAYER_PRIVATE_KEY").ok()
    }

    pub fn default_payout_mode() -> String {
        env::var("PAYOUT_MODE").unwrap_or_else(|_| "forward".to_string())
    }

    pub fn default_store_path() -> PathBuf {
        env::var("STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORE_PATH))
    }

    pub fn default_challenge_ttl_secs() -> u64 {
        300
    }

    pub fn default_merchant_timeout_secs() -> u64 {
        30
    }

    pub fn default_refetch_challenge() -> bool {
        true
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            chain_id: config_defaults::default_chain_id(),
            verifying_contract: Address::ZERO,
            pool_address: None,
            credit_settlement_address: None,
            rpc_url: None,
            relayer_private_key: config_defaults::default_relayer_private_key(),
            merchant_pub_key: None,
            payout_mode: config_defaults::default_payout_mode(),
            store_path: config_defaults::default_store_path(),
            challenge_ttl_secs: config_defaults::default_challenge_ttl_secs(),
            merchant_timeout_secs: config_defaults::default_merchant_timeout_secs(),
            refetch_challenge: config_defaults::default_refetch_challenge(),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Unknown payout mode `{0}` (expected forward | noop | upstream-x402)")]
    UnknownPayoutMode(String),
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn verifying_contract(&self) -> Address {
        self.verifying_contract
    }

    pub fn pool_address(&self) -> Option<Address> {
        self.pool_address
    }

    pub fn credit_settlement_address(&self) -> Option<Address> {
        self.credit_settlement_address
    }

    pub fn rpc_url(&self) -> Option<&Url> {
        self.rpc_url.as_ref()
    }

    pub fn relayer_private_key(&self) -> Option<&str> {
        self.relayer_private_key.as_deref()
    }

    pub fn merchant_pub_key(&self) -> Option<B256> {
        self.merchant_pub_key
    }

    pub fn payout_mode(&self) -> Result<PayoutMode, ConfigError> {
        PayoutMode::parse(&self.payout_mode)
            .ok_or_else(|| ConfigError::UnknownPayoutMode(self.payout_mode.clone()))
    }

    pub fn store_path(&self) -> &PathBuf {
        &self.store_path
    }

    pub fn challenge_ttl_secs(&self) -> u64 {
        self.challenge_ttl_secs
    }

    pub fn merchant_timeout_secs(&self) -> u64 {
        self.merchant_timeout_secs
    }

    pub fn refetch_challenge(&self) -> bool {
        self.refetch_challenge
    }

    /// Whether the live on-chain verifier is in play (vs the allow-all stub).
    pub fn onchain_verifier_enabled(&self) -> bool {
        self.rpc_url.is_some() && self.pool_address.is_some()
    }

    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path is determined by the `--config` CLI argument
    /// (default `./relayer.json`). A missing file yields the defaults;
    /// an unreadable or unparsable file is an error.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        Self::load_from_path(cli_args.config)
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}
