//! VRF tickets for the CONVERGE phase tie-break.
//!
//! A ticket is a signature over (beacon, instance, round) under the
//! participant's instance public key, domain-separated from vote signatures.

use crate::error::HostError;
use crate::host::{Signer, Verifier};
use granite_types::{NetworkName, PubKey, Ticket};

const DOMAIN_SEPARATION_TAG_VRF: &str = "VRF";

/// Serializes the input to the VRF signature for the CONVERGE step.
pub fn serialize_sig_input(
    nn: &NetworkName,
    beacon: &[u8],
    instance: u64,
    round: u64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        DOMAIN_SEPARATION_TAG_VRF.len() + nn.as_str().len() + beacon.len() + 19,
    );
    buf.extend_from_slice(DOMAIN_SEPARATION_TAG_VRF.as_bytes());
    buf.push(b':');
    buf.extend_from_slice(nn.as_str().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(beacon);
    buf.push(b':');
    buf.extend_from_slice(&instance.to_be_bytes());
    buf.extend_from_slice(&round.to_be_bytes());
    buf
}

/// Creates a ticket by signing the serialized input with the source key.
pub fn make_ticket(
    nn: &NetworkName,
    beacon: &[u8],
    instance: u64,
    round: u64,
    source: &PubKey,
    signer: &impl Signer,
) -> Result<Ticket, HostError> {
    signer
        .sign(source, &serialize_sig_input(nn, beacon, instance, round))
        .map(Ticket::new)
}

/// Verifies a ticket against the source key.
pub fn verify_ticket(
    nn: &NetworkName,
    beacon: &[u8],
    instance: u64,
    round: u64,
    source: &PubKey,
    verifier: &impl Verifier,
    ticket: &Ticket,
) -> bool {
    verifier
        .verify(
            source,
            &serialize_sig_input(nn, beacon, instance, round),
            ticket.as_bytes(),
        )
        .is_ok()
}
