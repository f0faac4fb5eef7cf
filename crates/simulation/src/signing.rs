//! Keyed-hash signing backend for simulation.
//!
//! Signatures are `sha256(tag || secret || message)` and aggregates fold the
//! individual signatures into one digest. The backend holds every secret, so
//! verification recomputes rather than using public-key cryptography. This
//! satisfies the signer/verifier contracts deterministically; it is not a
//! cryptographic scheme.

use granite_gpbft::HostError;
use granite_types::PubKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const SECRET_TAG: &[u8] = b"granite-sim/secret";
const PUBKEY_TAG: &[u8] = b"granite-sim/pubkey";
const SIG_TAG: &[u8] = b"granite-sim/sig";
const AGG_TAG: &[u8] = b"granite-sim/agg";

/// Holds the key material for every simulated participant.
#[derive(Default)]
pub struct SigningBackend {
    secrets: HashMap<PubKey, [u8; 32]>,
}

impl SigningBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a keypair from a seed and registers it.
    pub fn generate_key(&mut self, seed: u64) -> PubKey {
        let secret: [u8; 32] = Sha256::new()
            .chain_update(SECRET_TAG)
            .chain_update(seed.to_be_bytes())
            .finalize()
            .into();
        let pub_key = PubKey::new(
            Sha256::new()
                .chain_update(PUBKEY_TAG)
                .chain_update(secret)
                .finalize()
                .to_vec(),
        );
        self.secrets.insert(pub_key.clone(), secret);
        pub_key
    }

    fn raw_sign(secret: &[u8; 32], msg: &[u8]) -> Vec<u8> {
        Sha256::new()
            .chain_update(SIG_TAG)
            .chain_update(secret)
            .chain_update(msg)
            .finalize()
            .to_vec()
    }

    pub fn sign(&self, pub_key: &PubKey, msg: &[u8]) -> Result<Vec<u8>, HostError> {
        let secret = self
            .secrets
            .get(pub_key)
            .ok_or_else(|| HostError("unknown public key".into()))?;
        Ok(Self::raw_sign(secret, msg))
    }

    pub fn verify(&self, pub_key: &PubKey, msg: &[u8], sig: &[u8]) -> Result<(), HostError> {
        let expected = self.sign(pub_key, msg)?;
        if expected == sig {
            Ok(())
        } else {
            Err(HostError("signature mismatch".into()))
        }
    }

    pub fn aggregate(
        &self,
        pub_keys: &[PubKey],
        sigs: &[Vec<u8>],
    ) -> Result<Vec<u8>, HostError> {
        if pub_keys.len() != sigs.len() {
            return Err(HostError(format!(
                "aggregating {} keys with {} signatures",
                pub_keys.len(),
                sigs.len()
            )));
        }
        let mut hasher = Sha256::new().chain_update(AGG_TAG);
        for (pub_key, sig) in pub_keys.iter().zip(sigs) {
            hasher.update((pub_key.0.len() as u32).to_be_bytes());
            hasher.update(&pub_key.0);
            hasher.update((sig.len() as u32).to_be_bytes());
            hasher.update(sig);
        }
        Ok(hasher.finalize().to_vec())
    }

    pub fn verify_aggregate(
        &self,
        payload: &[u8],
        agg_sig: &[u8],
        signers: &[PubKey],
    ) -> Result<(), HostError> {
        let sigs = signers
            .iter()
            .map(|pk| self.sign(pk, payload))
            .collect::<Result<Vec<_>, _>>()?;
        let expected = self.aggregate(signers, &sigs)?;
        if expected == agg_sig {
            Ok(())
        } else {
            Err(HostError("aggregate signature mismatch".into()))
        }
    }
}

impl granite_gpbft::Signer for SigningBackend {
    fn sign(&self, pub_key: &PubKey, msg: &[u8]) -> Result<Vec<u8>, HostError> {
        SigningBackend::sign(self, pub_key, msg)
    }
}

impl granite_gpbft::Verifier for SigningBackend {
    fn verify(&self, pub_key: &PubKey, msg: &[u8], sig: &[u8]) -> Result<(), HostError> {
        SigningBackend::verify(self, pub_key, msg, sig)
    }

    fn aggregate(&self, pub_keys: &[PubKey], sigs: &[Vec<u8>]) -> Result<Vec<u8>, HostError> {
        SigningBackend::aggregate(self, pub_keys, sigs)
    }

    fn verify_aggregate(
        &self,
        payload: &[u8],
        agg_sig: &[u8],
        signers: &[PubKey],
    ) -> Result<(), HostError> {
        SigningBackend::verify_aggregate(self, payload, agg_sig, signers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let mut backend = SigningBackend::new();
        let key = backend.generate_key(1);
        let sig = backend.sign(&key, b"hello").unwrap();
        backend.verify(&key, b"hello", &sig).unwrap();
        assert!(backend.verify(&key, b"other", &sig).is_err());
    }

    #[test]
    fn keys_are_deterministic_and_distinct() {
        let mut a = SigningBackend::new();
        let mut b = SigningBackend::new();
        assert_eq!(a.generate_key(7), b.generate_key(7));
        assert_ne!(a.generate_key(1), a.generate_key(2));
    }

    #[test]
    fn aggregate_verifies_over_all_signers() {
        let mut backend = SigningBackend::new();
        let keys: Vec<PubKey> = (0..3).map(|i| backend.generate_key(i)).collect();
        let sigs: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| backend.sign(k, b"payload").unwrap())
            .collect();
        let agg = backend.aggregate(&keys, &sigs).unwrap();
        backend.verify_aggregate(b"payload", &agg, &keys).unwrap();
        assert!(backend
            .verify_aggregate(b"payload", &agg, &keys[..2])
            .is_err());
        assert!(backend.verify_aggregate(b"other", &agg, &keys).is_err());
    }
}
