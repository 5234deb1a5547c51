//! Core types for the shielded x402 payment rails.
//!
//! This crate provides the foundational types used by the shielded payment
//! relayer for implementing HTTP 402 Payment Required flows over two rails:
//! a direct shielded rail (zero-knowledge spend proofs against an on-chain
//! commitment tree) and a credit rail (long-lived signed credit channels).
//!
//! # Overview
//!
//! When a client requests a paid resource, the merchant responds with payment
//! requirements. The relayer rewrites those requirements into a shielded
//! challenge, the agent answers with a proof-carrying payment envelope, and
//! the relayer verifies, settles, and forwards the merchant call. All wire
//! shapes, hash derivations, and signing payloads involved in that exchange
//! live here; the processing engine itself lives in `shield-relayer-local`.
//!
//! # Modules
//!
//! - [`crypto`] - Domain-tagged keccak derivations, canonical encoders, Merkle trees
//! - [`credit`] - Credit-channel state, signed states, and debit intents
//! - [`error`] - Stable relayer error kinds and failure reasons
//! - [`networks`] - Registry of upstream network labels and CAIP-2 chain IDs
//! - [`proto`] - Wire format types for protocol envelopes and relay endpoints
//! - [`sequencer`] - Canonical records for the credit-sequencer wire contract
//! - [`timestamp`] - Unix timestamp utilities for challenge and intent windows
//! - [`typed_data`] - EIP-712 payload builders for credit-channel signing
//! - [`util`] - Helper types (base64 header material)

pub mod credit;
pub mod crypto;
pub mod error;
pub mod networks;
pub mod proto;
pub mod sequencer;
pub mod timestamp;
pub mod typed_data;
pub mod util;
