//! The relayer's signing identity.
//!
//! One ECDSA key counter-signs credit states and authenticates upstream
//! payouts. Signing is local and synchronous; the key never leaves the
//! process.

use alloy_primitives::{Address, B256, Bytes};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::Eip712Domain;
use shield_types::credit::CreditState;
use shield_types::error::RelayerError;
use shield_types::typed_data;

pub struct RelayerSigner {
    inner: PrivateKeySigner,
}

impl RelayerSigner {
    /// Parses a 32-byte hex private key (`0x`-prefixed or bare).
    pub fn from_hex(key: &str) -> Result<Self, RelayerError> {
        let inner: PrivateKeySigner = key
            .trim()
            .parse()
            .map_err(|_| RelayerError::internal("invalid relayer private key"))?;
        Ok(Self { inner })
    }

    /// Fresh random identity; tests and throwaway deployments.
    pub fn random() -> Self {
        Self {
            inner: PrivateKeySigner::random(),
        }
    }

    pub fn address(&self) -> Address {
        self.inner.address()
    }

    /// Signs a 32-byte digest, returning the 65-byte r || s || v form.
    pub fn sign_hash(&self, hash: &B256) -> Result<Bytes, RelayerError> {
        let signature = self
            .inner
            .sign_hash_sync(hash)
            .map_err(|e| RelayerError::internal(format!("relayer signing failed: {e}")))?;
        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }

    /// Counter-signs a credit state under the channel's EIP-712 domain.
    pub fn sign_credit_state(
        &self,
        state: &CreditState,
        domain: &Eip712Domain,
    ) -> Result<Bytes, RelayerError> {
        let hash = typed_data::credit_state_signing_hash(state, domain);
        self.sign_hash(&hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use shield_types::crypto::recover_prehash_signer;

    #[test]
    fn test_sign_and_recover() {
        let signer = RelayerSigner::random();
        let hash = B256::repeat_byte(0x42);
        let signature = signer.sign_hash(&hash).unwrap();
        let recovered = recover_prehash_signer(&hash, &signature).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_credit_state_signature_recovers() {
        let signer = RelayerSigner::random();
        let domain = typed_data::credit_domain(
            84532,
            address!("0x0000000000000000000000000000000000000002"),
        );
        let state = CreditState {
            channel_id: B256::repeat_byte(1),
            seq: 0,
            available: 100,
            cumulative_spent: 0,
            last_debit_digest: B256::ZERO,
            updated_at: 1_700_000_000,
            agent_address: address!("0x00000000000000000000000000000000000000a1"),
            relayer_address: signer.address(),
        };
        let signature = signer.sign_credit_state(&state, &domain).unwrap();
        let hash = typed_data::credit_state_signing_hash(&state, &domain);
        assert_eq!(
            recover_prehash_signer(&hash, &signature).unwrap(),
            signer.address()
        );
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(RelayerSigner::from_hex("not-a-key").is_err());
    }
}
