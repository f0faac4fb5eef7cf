//! Host capability traits and the outbound message builder.
//!
//! The core performs no I/O of its own. Everything it needs from the outside
//! world — the canonical chain, committees, signing, broadcast, the clock,
//! and the decision sink — is expressed as a narrow trait here and combined
//! into the [`Host`] bundle. One concrete implementation exists per
//! deployment; test harnesses swap it wholesale.

use crate::error::HostError;
use granite_types::{
    ActorId, ECChain, Justification, NetworkName, Payload, PowerTable, PubKey, GMessage, Ticket,
};
use std::time::Duration;

/// Supplies inputs for new consensus instances.
pub trait Chain {
    /// Returns the chain to propose for an instance. Its base must be the
    /// head of instance `i - 1`'s decision (or a bootstrap tipset for the
    /// initial instance). May fail; the participant retries at the alarm
    /// cadence.
    fn get_chain_for_instance(&mut self, instance: u64) -> Result<ECChain, HostError>;

    /// Returns the power table and beacon value for an instance. The power
    /// table is committed with a lookback policy; the beacon is drawn from
    /// the base tipset.
    fn get_committee_for_instance(
        &mut self,
        instance: u64,
    ) -> Result<(PowerTable, Vec<u8>), HostError>;
}

/// Endpoint through which the participant publishes messages.
pub trait Network {
    /// The network name, used for signature domain separation.
    fn network_name(&self) -> &NetworkName;

    /// Requests that a message described by the builder be signed and
    /// published, including local loopback delivery to this participant.
    /// Never fails synchronously on transport conditions.
    fn request_broadcast(&mut self, builder: MessageBuilder) -> Result<(), HostError>;
}

/// Monotonic network time and the single-alarm facility.
pub trait Clock {
    /// Returns the current network time.
    fn time(&self) -> Duration;

    /// Sets an alarm to fire at the given time. At most one alarm is
    /// outstanding; setting a new one replaces any prior alarm. The time may
    /// be in the past, in which case the alarm fires as soon as possible
    /// (but not synchronously).
    fn set_alarm(&mut self, at: Duration);
}

/// Signs messages with the secret key corresponding to a public key.
///
/// Safe for concurrent use.
pub trait Signer {
    fn sign(&self, pub_key: &PubKey, msg: &[u8]) -> Result<Vec<u8>, HostError>;
}

/// Verifies and aggregates signatures.
///
/// Safe for concurrent use.
pub trait Verifier {
    /// Verifies a signature for the given public key.
    fn verify(&self, pub_key: &PubKey, msg: &[u8], sig: &[u8]) -> Result<(), HostError>;

    /// Aggregates signatures from participants.
    fn aggregate(&self, pub_keys: &[PubKey], sigs: &[Vec<u8>]) -> Result<Vec<u8>, HostError>;

    /// Verifies an aggregate signature against the selected public keys.
    fn verify_aggregate(
        &self,
        payload: &[u8],
        agg_sig: &[u8],
        signers: &[PubKey],
    ) -> Result<(), HostError>;
}

/// Observes finality decisions.
pub trait DecisionReceiver {
    /// Receives a finality decision, with signatures from a strong quorum of
    /// participants justifying it. The decision payload always has round 0
    /// and phase DECIDE. Returns the time at which the next instance should
    /// begin (which may be in the past).
    fn receive_decision(&mut self, decision: &Justification) -> Duration;
}

/// The full bundle of capabilities the participant consumes.
pub trait Host:
    Chain + Network + Clock + Signer + Verifier + DecisionReceiver
{
}

impl<T> Host for T where T: Chain + Network + Clock + Signer + Verifier + DecisionReceiver {}

/// Template for an outbound message, handed to
/// [`Network::request_broadcast`]. The host prepares signing inputs, signs
/// them (possibly across an RPC boundary), and completes the message.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    /// The sending participant.
    pub sender: ActorId,
    /// The sender's public key in the instance power table.
    pub pub_key: PubKey,
    /// The vote to sign and send.
    pub payload: Payload,
    /// Beacon value to derive a VRF ticket from, for CONVERGE messages.
    pub beacon_for_ticket: Option<Vec<u8>>,
    /// Justification to attach, where the phase requires one.
    pub justification: Option<Justification>,
}

impl MessageBuilder {
    /// Computes the byte strings that need signing under the given network
    /// name.
    pub fn prepare_signing_inputs(&self, nn: &NetworkName) -> SignatureBuilder {
        SignatureBuilder {
            payload_to_sign: self.payload.marshal_for_signing(nn),
            vrf_to_sign: self.beacon_for_ticket.as_ref().map(|beacon| {
                crate::vrf::serialize_sig_input(
                    nn,
                    beacon,
                    self.payload.instance,
                    self.payload.round,
                )
            }),
        }
    }

    /// Assembles the final message from the produced signatures.
    pub fn build(self, payload_signature: Vec<u8>, vrf: Option<Vec<u8>>) -> GMessage {
        GMessage {
            sender: self.sender,
            vote: self.payload,
            signature: payload_signature,
            ticket: Ticket::new(vrf.unwrap_or_default()),
            justification: self.justification,
        }
    }
}

/// Signing inputs for one outbound message.
#[derive(Debug, Clone)]
pub struct SignatureBuilder {
    /// Bytes the payload signature must cover.
    pub payload_to_sign: Vec<u8>,
    /// Bytes the VRF ticket must cover, for CONVERGE messages.
    pub vrf_to_sign: Option<Vec<u8>>,
}

impl SignatureBuilder {
    /// Produces the payload signature and, when required, the VRF ticket.
    pub fn sign(
        &self,
        signer: &impl Signer,
        pub_key: &PubKey,
    ) -> Result<(Vec<u8>, Option<Vec<u8>>), HostError> {
        let payload_sig = signer.sign(pub_key, &self.payload_to_sign)?;
        let vrf = match &self.vrf_to_sign {
            Some(input) => Some(signer.sign(pub_key, input)?),
            None => None,
        };
        Ok((payload_sig, vrf))
    }
}
