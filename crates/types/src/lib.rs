//! Core types for the Granite finality gadget.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: actor ids, storage power, public keys, VRF tickets
//! - **Chain types**: [`Tipset`] and [`ECChain`], the values voted on
//! - **Power table**: [`PowerTable`], the weighted participant set
//! - **Wire types**: [`Payload`], [`GMessage`], [`Justification`] with
//!   tuple-CBOR encoding matching the network format
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod chain;
mod payload;
mod powertable;

pub use chain::{ChainError, ChainKey, ECChain, Tipset, CHAIN_MAX_LEN, MAX_BYTES_LEN};
pub use payload::{
    GMessage, Justification, Payload, Phase, DOMAIN_SEPARATION_TAG,
};
pub use powertable::{
    is_strong_quorum, is_weak_quorum, PowerEntry, PowerTable, PowerTableError,
};

// Re-exports used pervasively by consumers of the wire types.
pub use fvm_ipld_bitfield::BitField;
pub use num_bigint::BigInt;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant identifier (a miner actor id).
pub type ActorId = u64;

/// Voting weight of a participant. Arbitrary-precision: all quorum
/// arithmetic is exact, never floating point.
pub type StoragePower = num_bigint::BigInt;

/// Opaque public key bytes. The signature scheme is an external collaborator;
/// keys are carried around but never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PubKey(pub Vec<u8>);

impl PubKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A VRF ticket: a signature over a common payload, used as a weighted
/// random coin in the CONVERGE phase. Empty for all other phases.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(#[serde(with = "fvm_ipld_encoding::strict_bytes")] pub Vec<u8>);

impl Ticket {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Name of the network this protocol instance runs on, used for signature
/// domain separation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NetworkName(pub String);

impl NetworkName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NetworkName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Create a tipset at the given epoch with a key derived from a seed
    /// byte.
    pub fn test_tipset(epoch: i64, seed: u8) -> Tipset {
        Tipset::new(epoch, vec![seed; 4])
    }

    /// Create a chain from (epoch, seed) pairs.
    pub fn test_chain(tipsets: &[(i64, u8)]) -> ECChain {
        ECChain::new(tipsets.iter().map(|&(e, s)| test_tipset(e, s)).collect())
    }
}
