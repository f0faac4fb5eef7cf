//! Protocol phases, signed vote payloads, messages, and justifications.
//!
//! The same message structure is used for all rounds and phases. Messages are
//! self-attesting: the signature fixes the sender id via the implied public
//! key, the signature payload covers every field a sender can freely choose,
//! and the VRF ticket is a signature under the same key.

use crate::chain::ECChain;
use crate::{ActorId, NetworkName, Ticket};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::strict_bytes;
use fvm_ipld_encoding::tuple::*;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Domain separation tag for vote signature payloads.
pub const DOMAIN_SEPARATION_TAG: &str = "GPBFT";

/// Position within a round of one consensus instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Instance constructed but not yet started.
    Initial = 0,
    /// Amplification of the input proposal's prefixes (round 0 only).
    Quality = 1,
    /// Ticket-weighted proposal convergence (rounds ≥ 1).
    Converge = 2,
    /// Preparation vote for the proposal, or bottom.
    Prepare = 3,
    /// Commitment vote for a prepared value, or bottom.
    Commit = 4,
    /// Decision broadcast; collects matching DECIDE votes.
    Decide = 5,
    /// Terminal state: the decision has been reached.
    Terminated = 6,
}

impl Phase {
    pub fn from_u8(v: u8) -> Option<Phase> {
        match v {
            0 => Some(Phase::Initial),
            1 => Some(Phase::Quality),
            2 => Some(Phase::Converge),
            3 => Some(Phase::Prepare),
            4 => Some(Phase::Commit),
            5 => Some(Phase::Decide),
            6 => Some(Phase::Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Initial => "INITIAL",
            Phase::Quality => "QUALITY",
            Phase::Converge => "CONVERGE",
            Phase::Prepare => "PREPARE",
            Phase::Commit => "COMMIT",
            Phase::Decide => "DECIDE",
            Phase::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        Phase::from_u8(v).ok_or_else(|| D::Error::custom(format!("unknown phase {v}")))
    }
}

/// Fields of a message that make up the signature payload.
#[derive(Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct Payload {
    /// Consensus instance number.
    pub instance: u64,
    /// Round number within the instance.
    pub round: u64,
    /// Phase the vote belongs to.
    pub phase: Phase,
    /// Chain of tipsets voted for finalisation. Bottom signals "no
    /// proposal"; otherwise the first entry is the base tipset finalised in
    /// the previous instance.
    pub value: ECChain,
}

impl Payload {
    pub fn new(instance: u64, round: u64, phase: Phase, value: ECChain) -> Self {
        Self {
            instance,
            round,
            phase,
            value,
        }
    }

    /// The deterministic byte encoding that vote signatures cover:
    /// `"GPBFT" ":" network ":" instance(8B BE) round(8B BE) phase(1B)`
    /// followed by each tipset key, 4-byte big-endian length-prefixed.
    pub fn marshal_for_signing(&self, nn: &NetworkName) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(DOMAIN_SEPARATION_TAG.as_bytes());
        buf.push(b':');
        buf.extend_from_slice(nn.as_str().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(&self.instance.to_be_bytes());
        buf.extend_from_slice(&self.round.to_be_bytes());
        buf.push(self.phase as u8);
        for ts in self.value.tipsets() {
            buf.extend_from_slice(&(ts.key.len() as u32).to_be_bytes());
            buf.extend_from_slice(&ts.key);
        }
        buf
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{{{}}}({} {})",
            self.phase, self.instance, self.round, self.value
        )
    }
}

/// Proof that a strong quorum of participants signed a payload: the payload,
/// a bitfield of signer indices into the instance power table, and a BLS
/// aggregate of their signatures.
#[derive(Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Justification {
    /// The payload signed by the aggregate.
    pub vote: Payload,
    /// Indices of the signers in the instance's power table.
    pub signers: BitField,
    /// Aggregate signature over the vote's signing payload.
    #[serde(with = "strict_bytes")]
    pub signature: Vec<u8>,
}

impl fmt::Debug for Justification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Justification({:?})", self.vote)
    }
}

/// A Granite protocol message.
#[derive(Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct GMessage {
    /// Id of the sender/signer of this message.
    pub sender: ActorId,
    /// The payload that the signature covers.
    pub vote: Payload,
    /// Signature by the sender's public key over the vote's signing payload.
    #[serde(with = "strict_bytes")]
    pub signature: Vec<u8>,
    /// VRF ticket for CONVERGE messages (otherwise empty).
    pub ticket: Ticket,
    /// Justification for this message, where the phase requires one.
    pub justification: Option<Justification>,
}

impl fmt::Debug for GMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{} ↗ {:?}", self.sender, self.vote)
    }
}

impl fmt::Display for GMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_chain;

    fn nn() -> NetworkName {
        NetworkName::from("granite-test")
    }

    #[test]
    fn phase_round_trips_as_u8() {
        for v in 0u8..=6 {
            let phase = Phase::from_u8(v).unwrap();
            assert_eq!(phase as u8, v);
        }
        assert!(Phase::from_u8(7).is_none());
    }

    #[test]
    fn signing_payload_is_deterministic_and_phase_sensitive() {
        let chain = test_chain(&[(0, 1), (1, 2)]);
        let prepare = Payload::new(3, 1, Phase::Prepare, chain.clone());
        let commit = Payload::new(3, 1, Phase::Commit, chain.clone());

        assert_eq!(
            prepare.marshal_for_signing(&nn()),
            prepare.marshal_for_signing(&nn())
        );
        assert_ne!(
            prepare.marshal_for_signing(&nn()),
            commit.marshal_for_signing(&nn())
        );
        assert_ne!(
            prepare.marshal_for_signing(&nn()),
            prepare.marshal_for_signing(&NetworkName::from("other"))
        );

        let expected_prefix = b"GPBFT:granite-test:";
        assert!(prepare.marshal_for_signing(&nn()).starts_with(expected_prefix));
    }

    #[test]
    fn signing_payload_covers_value_keys() {
        let a = Payload::new(0, 0, Phase::Quality, test_chain(&[(0, 1), (1, 2)]));
        let b = Payload::new(0, 0, Phase::Quality, test_chain(&[(0, 1), (1, 3)]));
        assert_ne!(a.marshal_for_signing(&nn()), b.marshal_for_signing(&nn()));
    }

    #[test]
    fn message_cbor_round_trip() {
        let justification = Justification {
            vote: Payload::new(2, 0, Phase::Commit, test_chain(&[(0, 1), (1, 2)])),
            signers: BitField::try_from_bits([0u64, 2]).unwrap(),
            signature: vec![7; 16],
        };
        let msg = GMessage {
            sender: 5,
            vote: Payload::new(2, 1, Phase::Converge, test_chain(&[(0, 1), (1, 2)])),
            signature: vec![1; 8],
            ticket: Ticket::new(vec![9; 12]),
            justification: Some(justification),
        };

        let bytes = fvm_ipld_encoding::to_vec(&msg).unwrap();
        let back: GMessage = fvm_ipld_encoding::from_slice(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn message_without_justification_round_trips() {
        let msg = GMessage {
            sender: 0,
            vote: Payload::new(0, 0, Phase::Quality, test_chain(&[(0, 1)])),
            signature: vec![3; 8],
            ticket: Ticket::default(),
            justification: None,
        };
        let bytes = fvm_ipld_encoding::to_vec(&msg).unwrap();
        let back: GMessage = fvm_ipld_encoding::from_slice(&bytes).unwrap();
        assert_eq!(msg, back);
    }
}
