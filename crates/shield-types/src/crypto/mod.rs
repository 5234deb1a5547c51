//! Domain-tagged keccak-256 derivations for the shielded rails.
//!
//! Every hash the relayer checks or produces is a keccak-256 over a
//! string-tagged preimage. The tags partition the hash space so a value
//! derived for one purpose can never collide with another (a commitment can
//! never be mistaken for a nullifier, a challenge hash for a channel id).
//!
//! Words are 32 bytes ([`B256`]); amounts are micro-units encoded as
//! big-endian 256-bit words; addresses are left-padded to 32 bytes inside
//! preimages.

use alloy_primitives::utils::eip191_hash_message;
use alloy_primitives::{Address, B256, Keccak256, Signature, U256, keccak256};

pub mod canonical;
pub mod merkle;

/// Tag for challenge hashes binding a nonce, amount, and merchant.
pub const DOMAIN_CHALLENGE: &str = "shielded-x402:v1:challenge";
/// Tag for note commitments.
pub const DOMAIN_COMMITMENT: &str = "shielded-x402:v1:commitment";
/// Tag for spend nullifiers.
pub const DOMAIN_NULLIFIER: &str = "shielded-x402:v1:nullifier";
/// Tag for output-note derivations.
pub const DOMAIN_OUTPUT: &str = "shielded-x402:v1:output";
/// Tag for credit-channel identifiers.
pub const DOMAIN_CHANNEL: &str = "shielded-x402:v1:channel";

/// Encodes a micro-unit amount as a big-endian 256-bit word.
pub fn amount_word(amount: u128) -> B256 {
    B256::from(U256::from(amount))
}

/// Left-pads a 20-byte address to a 32-byte word.
pub fn address_word(address: Address) -> B256 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    B256::from(word)
}

/// `commitment = H(DOMAIN_COMMITMENT || word(amount) || rho || pkHash)`.
///
/// The commitment is the Merkle-tree leaf hiding a note's amount and owner.
pub fn commitment(amount: u128, rho: &B256, pk_hash: &B256) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(DOMAIN_COMMITMENT.as_bytes());
    hasher.update(amount_word(amount));
    hasher.update(rho);
    hasher.update(pk_hash);
    hasher.finalize()
}

/// `nullifier = H(DOMAIN_NULLIFIER || secret || commitment)`.
///
/// One-time value that invalidates a note after spend.
pub fn nullifier(secret: &B256, commitment: &B256) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(DOMAIN_NULLIFIER.as_bytes());
    hasher.update(secret);
    hasher.update(commitment);
    hasher.finalize()
}

/// `challengeHash = H(DOMAIN_CHALLENGE || nonce || word(amount) || pad(merchant))`.
///
/// Binds a proof's public inputs to one issued challenge: the nonce is fresh
/// per issuance, the amount is the requirement's micro-amount, and the
/// merchant argument is the verifying contract the spend settles against.
pub fn challenge_hash(nonce: &B256, amount: u128, merchant: Address) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(DOMAIN_CHALLENGE.as_bytes());
    hasher.update(nonce);
    hasher.update(amount_word(amount));
    hasher.update(address_word(merchant));
    hasher.finalize()
}

/// Derives a credit-channel identifier.
///
/// `channelId = H(DOMAIN_CHANNEL || word(chainId) || pad(verifyingContract) ||
/// pad(agent) || pad(relayer))`. The id is stable for the lifetime of the
/// channel and recomputable by both parties.
pub fn channel_id(
    chain_id: u64,
    verifying_contract: Address,
    agent: Address,
    relayer: Address,
) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(DOMAIN_CHANNEL.as_bytes());
    hasher.update(B256::from(U256::from(chain_id)));
    hasher.update(address_word(verifying_contract));
    hasher.update(address_word(agent));
    hasher.update(address_word(relayer));
    hasher.finalize()
}

/// Hash of an upstream merchant's x402 terms.
///
/// `H(scheme || '|' || network || '|' || lower(asset) || '|' || lower(payTo) || '|' || amount)`.
/// Used by the challenge bridge to detect drift between the terms the agent
/// saw and the terms the merchant currently quotes.
pub fn upstream_terms_hash(
    scheme: &str,
    network: &str,
    asset: &str,
    pay_to: &str,
    amount: &str,
) -> B256 {
    let preimage = format!(
        "{}|{}|{}|{}|{}",
        scheme,
        network,
        asset.to_lowercase(),
        pay_to.to_lowercase(),
        amount
    );
    keccak256(preimage.as_bytes())
}

/// Errors produced while parsing or recovering an ECDSA signature.
#[derive(Debug, thiserror::Error)]
pub enum SignatureRecoveryError {
    #[error("signature must be 65 bytes, got {0}")]
    InvalidLength(usize),
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error("could not recover signer: {0}")]
    Recovery(String),
}

/// Recovers the signer of an EIP-191 personal-sign over arbitrary bytes.
///
/// Payload signatures on both rails sign the canonical JSON serialization of
/// the payload, hashed with the `"\x19Ethereum Signed Message:\n"` prefix.
pub fn recover_message_signer(
    message: &[u8],
    signature: &[u8],
) -> Result<Address, SignatureRecoveryError> {
    let prehash = eip191_hash_message(message);
    recover_prehash_signer(&prehash, signature)
}

/// Recovers the signer of a 65-byte ECDSA signature over a 32-byte digest.
///
/// Used for EIP-712 typed-data signatures, where the digest is the signing
/// hash produced by [`crate::typed_data`].
pub fn recover_prehash_signer(
    prehash: &B256,
    signature: &[u8],
) -> Result<Address, SignatureRecoveryError> {
    if signature.len() != 65 {
        return Err(SignatureRecoveryError::InvalidLength(signature.len()));
    }
    let signature = Signature::from_raw(signature)
        .map_err(|e| SignatureRecoveryError::Malformed(e.to_string()))?;
    signature
        .recover_address_from_prehash(prehash)
        .map_err(|e| SignatureRecoveryError::Recovery(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    #[test]
    fn test_challenge_hash_composition() {
        let nonce =
            b256!("0x1111111111111111111111111111111111111111111111111111111111111111");
        let merchant = address!("0x00000000000000000000000000000000000000aa");
        let expected = {
            let mut preimage = Vec::new();
            preimage.extend_from_slice(DOMAIN_CHALLENGE.as_bytes());
            preimage.extend_from_slice(nonce.as_slice());
            preimage.extend_from_slice(amount_word(40).as_slice());
            preimage.extend_from_slice(address_word(merchant).as_slice());
            keccak256(&preimage)
        };
        assert_eq!(challenge_hash(&nonce, 40, merchant), expected);
    }

    #[test]
    fn test_derivations_are_domain_separated() {
        let a = b256!("0x2222222222222222222222222222222222222222222222222222222222222222");
        let b = b256!("0x3333333333333333333333333333333333333333333333333333333333333333");
        // Same raw material under different tags must never collide.
        assert_ne!(commitment(7, &a, &b), nullifier(&a, &b));
    }

    #[test]
    fn test_commitment_binds_every_field() {
        let rho = b256!("0x4444444444444444444444444444444444444444444444444444444444444444");
        let pk = b256!("0x5555555555555555555555555555555555555555555555555555555555555555");
        let base = commitment(100, &rho, &pk);
        assert_ne!(base, commitment(101, &rho, &pk));
        assert_ne!(base, commitment(100, &pk, &rho));
    }

    #[test]
    fn test_channel_id_is_stable_and_party_sensitive() {
        let vc = address!("0x0000000000000000000000000000000000000002");
        let agent = address!("0x00000000000000000000000000000000000000a1");
        let relayer = address!("0x00000000000000000000000000000000000000b2");
        let id = channel_id(84532, vc, agent, relayer);
        assert_eq!(id, channel_id(84532, vc, agent, relayer));
        assert_ne!(id, channel_id(8453, vc, agent, relayer));
        assert_ne!(id, channel_id(84532, vc, relayer, agent));
    }

    #[test]
    fn test_upstream_terms_hash_normalizes_case() {
        let a = upstream_terms_hash(
            "exact",
            "base-sepolia",
            "0xAAAA000000000000000000000000000000000001",
            "0xBBBB000000000000000000000000000000000002",
            "40",
        );
        let b = upstream_terms_hash(
            "exact",
            "base-sepolia",
            "0xaaaa000000000000000000000000000000000001",
            "0xbbbb000000000000000000000000000000000002",
            "40",
        );
        assert_eq!(a, b);
        let c = upstream_terms_hash(
            "exact",
            "base-sepolia",
            "0xaaaa000000000000000000000000000000000001",
            "0xbbbb000000000000000000000000000000000002",
            "41",
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_recover_rejects_bad_length() {
        let err = recover_message_signer(b"{}", &[0u8; 64]).unwrap_err();
        assert!(matches!(err, SignatureRecoveryError::InvalidLength(64)));
    }

    #[test]
    fn test_message_signer_round_trip() {
        use alloy_signer::SignerSync;
        let signer = alloy_signer_local::PrivateKeySigner::random();
        let message = br#"{"nullifier":"0x01"}"#;
        let signature = signer.sign_message_sync(message).unwrap();
        let recovered = recover_message_signer(message, &signature.as_bytes()).unwrap();
        assert_eq!(recovered, signer.address());
        // A different message recovers a different address.
        let other = recover_message_signer(b"{}", &signature.as_bytes()).unwrap();
        assert_ne!(other, signer.address());
    }
}
