//! Payment-processing engine for the shielded x402 relayer.
//!
//! This crate implements the relayer core: the direct shielded-payment
//! processor, the credit-channel processor, and the challenge bridge that
//! rewrites upstream merchant challenges into shielded ones. External
//! collaborators (the on-chain pool, the settlement contract, the merchant)
//! are reached through narrow adapter traits so the engine runs identically
//! against live RPC endpoints or in-memory stubs.
//!
//! # Architecture
//!
//! 1. **Challenge bridge** ([`challenge`]): refetches the merchant's x402
//!    terms, issues a fresh challenge nonce, and binds the two together.
//! 2. **Direct processor** ([`direct`]): verify → settle → payout for
//!    proof-carrying payments, idempotent per request.
//! 3. **Credit processor** ([`credit`]): topup / debit / close state machine
//!    with per-channel serialization and a durable head store.
//! 4. **Adapters** ([`pool`], [`payout`]): proof verification, on-chain
//!    settlement, and merchant forwarding.
//! 5. **Durability** ([`store`]): crash-consistent settlement records,
//!    channel heads, and replayable responses.
//!
//! # Concurrency
//!
//! Work is serialized per `channelId` / idempotency key through the named
//! mutex registry in [`locks`]; distinct keys run fully parallel. A mutex is
//! released only after the durable write that concludes the transition, so
//! the durable order always matches the logical order.

pub mod challenge;
pub mod credit;
pub mod direct;
pub mod locks;
pub mod payout;
pub mod pool;
pub mod signer;
pub mod store;

pub use challenge::ChallengeBridge;
pub use credit::CreditProcessor;
pub use direct::DirectProcessor;
pub use payout::{PayoutAdapter, PayoutMode};
pub use pool::{CreditSettlement, ProofVerifier, SettlementOutcome, SettlementSubmitter};
pub use signer::RelayerSigner;
pub use store::{FsStore, SettlementRecord, SettlementStatus, SettlementStore};
