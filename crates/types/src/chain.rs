//! Tipsets and EC chains: the values Granite instances vote on.
//!
//! An EC chain is a bounded, epoch-ordered sequence of tipsets rooted at a
//! *base* tipset finalised by the previous instance. The empty chain is the
//! protocol's bottom (⊥) value, signalling "no proposal".

use fvm_ipld_encoding::strict_bytes;
use fvm_ipld_encoding::tuple::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length of a chain value, in tipsets.
pub const CHAIN_MAX_LEN: usize = 100;

/// Maximum length of any opaque byte field carried on the wire.
pub const MAX_BYTES_LEN: usize = 2 << 20;

/// Length of the per-tipset commitments root.
const COMMITMENTS_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain longer than {CHAIN_MAX_LEN} tipsets")]
    TooLong,
    #[error("chain epochs not strictly increasing at position {0}")]
    EpochsNotIncreasing(usize),
    #[error("tipset has negative epoch {0}")]
    NegativeEpoch(i64),
    #[error("tipset key is empty")]
    EmptyTipsetKey,
    #[error("tipset field exceeds {MAX_BYTES_LEN} bytes")]
    FieldTooLong,
}

/// An epoch-tagged opaque identifier referring to a set of blocks at one
/// height of the underlying EC protocol.
#[derive(Clone, PartialEq, Eq, Hash, Serialize_tuple, Deserialize_tuple)]
pub struct Tipset {
    /// EC epoch of the tipset.
    pub epoch: i64,
    /// Opaque canonical tipset key, uniquely identifying it within an EC
    /// view.
    #[serde(with = "strict_bytes")]
    pub key: Vec<u8>,
    /// Commitment to the power table used to validate the next instance.
    #[serde(with = "strict_bytes")]
    pub power_table: Vec<u8>,
    /// Merkle root of instance-specific commitments.
    #[serde(with = "commitments_bytes")]
    pub commitments: [u8; COMMITMENTS_LEN],
}

/// CBOR byte-string encoding for the fixed-size commitments root.
mod commitments_bytes {
    use super::COMMITMENTS_LEN;
    use fvm_ipld_encoding::strict_bytes;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8; COMMITMENTS_LEN],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        strict_bytes::serialize(bytes.as_slice(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; COMMITMENTS_LEN], D::Error> {
        let bytes: Vec<u8> = strict_bytes::deserialize(deserializer)?;
        bytes.try_into().map_err(|v: Vec<u8>| {
            serde::de::Error::invalid_length(v.len(), &"32 bytes")
        })
    }
}

impl Tipset {
    pub fn new(epoch: i64, key: Vec<u8>) -> Self {
        Self {
            epoch,
            key,
            power_table: Vec::new(),
            commitments: [0u8; COMMITMENTS_LEN],
        }
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.epoch < 0 {
            return Err(ChainError::NegativeEpoch(self.epoch));
        }
        if self.key.is_empty() {
            return Err(ChainError::EmptyTipsetKey);
        }
        if self.key.len() > MAX_BYTES_LEN || self.power_table.len() > MAX_BYTES_LEN {
            return Err(ChainError::FieldTooLong);
        }
        Ok(())
    }
}

impl fmt::Debug for Tipset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tipset(@{}", self.epoch)?;
        for b in self.key.iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Stable fingerprint of a chain, usable as a map key.
///
/// The concatenation of length-prefixed tipset keys is deterministic and
/// collision-free for well-formed chains.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChainKey(Vec<u8>);

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainKey(")?;
        for b in self.0.iter().take(8) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A chain of tipsets comprising a base (the last finalised tipset from
/// which the chain extends) and (possibly empty) suffix.
///
/// The zero-length chain is the bottom (⊥) value.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ECChain(Vec<Tipset>);

impl ECChain {
    pub fn new(tipsets: Vec<Tipset>) -> Self {
        Self(tipsets)
    }

    /// The bottom (⊥) chain value.
    pub fn bottom() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the bottom (empty) chain.
    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tipsets(&self) -> &[Tipset] {
        &self.0
    }

    /// The base tipset. Panics on bottom; callers check `is_zero` first.
    pub fn base(&self) -> &Tipset {
        &self.0[0]
    }

    /// The head (last) tipset. Panics on bottom.
    pub fn head(&self) -> &Tipset {
        self.0.last().expect("head of bottom chain")
    }

    /// All tipsets after the base.
    pub fn suffix(&self) -> &[Tipset] {
        if self.is_zero() {
            &[]
        } else {
            &self.0[1..]
        }
    }

    /// The first `to + 1` tipsets (the prefix ending at index `to`).
    pub fn prefix(&self, to: usize) -> ECChain {
        let end = (to + 1).min(self.0.len());
        ECChain(self.0[..end].to_vec())
    }

    /// A chain of only this chain's base tipset.
    pub fn base_chain(&self) -> ECChain {
        ECChain(vec![self.0[0].clone()])
    }

    /// Whether `other` is a (non-bottom) prefix of this chain, including
    /// equality.
    pub fn has_prefix(&self, other: &ECChain) -> bool {
        if self.is_zero() || other.is_zero() {
            return false;
        }
        if other.len() > self.len() {
            return false;
        }
        self.0[..other.len()] == other.0
    }

    /// Whether the chain has a specific base tipset.
    pub fn has_base(&self, t: &Tipset) -> bool {
        !self.is_zero() && self.base() == t
    }

    /// Checks the chain is well-formed: within the length bound, tipsets
    /// individually valid, and epochs strictly increasing. The bottom chain
    /// is valid.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.is_zero() {
            return Ok(());
        }
        if self.len() > CHAIN_MAX_LEN {
            return Err(ChainError::TooLong);
        }
        let mut last_epoch = -1;
        for (i, ts) in self.0.iter().enumerate() {
            ts.validate()?;
            if ts.epoch <= last_epoch {
                return Err(ChainError::EpochsNotIncreasing(i));
            }
            last_epoch = ts.epoch;
        }
        Ok(())
    }

    /// Returns an identifier for the chain suitable for use as a map key.
    pub fn key(&self) -> ChainKey {
        let cap: usize = self.0.iter().map(|ts| ts.key.len() + 4).sum();
        let mut buf = Vec::with_capacity(cap);
        for ts in &self.0 {
            buf.extend_from_slice(&(ts.key.len() as u32).to_be_bytes());
            buf.extend_from_slice(&ts.key);
        }
        ChainKey(buf)
    }
}

impl fmt::Display for ECChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("⊥");
        }
        write!(f, "[{:?}", self.base())?;
        if self.len() > 1 {
            write!(f, " + {} tipsets to @{}", self.len() - 1, self.head().epoch)?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for ECChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_chain, test_tipset};

    #[test]
    fn bottom_chain() {
        let bottom = ECChain::bottom();
        assert!(bottom.is_zero());
        assert_eq!(bottom.len(), 0);
        assert!(bottom.validate().is_ok());
        assert_eq!(bottom.key(), ECChain::bottom().key());
        assert!(!bottom.has_prefix(&bottom));
    }

    #[test]
    fn prefix_and_base() {
        let chain = test_chain(&[(0, 1), (1, 2), (2, 3)]);
        assert_eq!(chain.prefix(0), chain.base_chain());
        assert_eq!(chain.prefix(1).len(), 2);
        assert_eq!(chain.prefix(9).len(), 3);
        assert!(chain.has_prefix(&chain.prefix(1)));
        assert!(chain.has_prefix(&chain));
        assert!(!chain.prefix(1).has_prefix(&chain));
        assert!(chain.has_base(&test_tipset(0, 1)));
        assert!(!chain.has_base(&test_tipset(1, 2)));
    }

    #[test]
    fn validate_rejects_unordered_epochs() {
        let chain = test_chain(&[(5, 1), (5, 2)]);
        assert_eq!(chain.validate(), Err(ChainError::EpochsNotIncreasing(1)));
        let chain = test_chain(&[(5, 1), (4, 2)]);
        assert_eq!(chain.validate(), Err(ChainError::EpochsNotIncreasing(1)));
    }

    #[test]
    fn validate_rejects_empty_key() {
        let chain = ECChain::new(vec![Tipset::new(0, vec![])]);
        assert_eq!(chain.validate(), Err(ChainError::EmptyTipsetKey));
    }

    #[test]
    fn validate_rejects_too_long() {
        let tipsets = (0..=CHAIN_MAX_LEN as i64)
            .map(|e| test_tipset(e, e as u8))
            .collect();
        assert_eq!(ECChain::new(tipsets).validate(), Err(ChainError::TooLong));
    }

    #[test]
    fn keys_distinguish_chains() {
        let a = test_chain(&[(0, 1), (1, 2)]);
        let b = test_chain(&[(0, 1), (1, 3)]);
        let a_prefix = a.prefix(0);
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), a_prefix.key());
        assert_eq!(a.key(), test_chain(&[(0, 1), (1, 2)]).key());
    }

    #[test]
    fn tipset_cbor_round_trip() {
        let ts = Tipset {
            epoch: 7,
            key: vec![1, 2, 3],
            power_table: vec![9; 8],
            commitments: [4u8; 32],
        };
        let bytes = fvm_ipld_encoding::to_vec(&ts).unwrap();
        let back: Tipset = fvm_ipld_encoding::from_slice(&bytes).unwrap();
        assert_eq!(ts, back);
    }

    #[test]
    fn chain_cbor_round_trip() {
        let chain = test_chain(&[(0, 1), (3, 2), (5, 9)]);
        let bytes = fvm_ipld_encoding::to_vec(&chain).unwrap();
        let back: ECChain = fvm_ipld_encoding::from_slice(&bytes).unwrap();
        assert_eq!(chain, back);
    }
}
