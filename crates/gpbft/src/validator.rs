//! Stateless message and justification validation.
//!
//! Validation reads only per-instance immutable inputs (power table, beacon)
//! and the verifier capability, so it is safe to run concurrently ahead of
//! the single-threaded core. An invalid message can never become valid and
//! may be dropped at the transport.
//!
//! The base-chain check is deliberately absent here: whether a value extends
//! the instance's input base is late-bound and enforced at `receive`, since
//! other instances may accept the same message.

use crate::host::Verifier;
use crate::vrf;
use crate::GpbftError;
use granite_types::{
    is_strong_quorum, ECChain, GMessage, NetworkName, Phase, PowerTable, PubKey, StoragePower,
};
use num_traits::Zero;

/// Round value in the justification table meaning "any round".
const ANY_ROUND: u64 = u64::MAX;

fn invalid(reason: impl Into<String>) -> GpbftError {
    GpbftError::ValidationInvalid(reason.into())
}

/// Checks message validity against an instance committee: sender
/// eligibility, chain structure, phase-specific constraints, the payload
/// signature, and the justification where one is required.
pub fn validate_message(
    power_table: &PowerTable,
    beacon: &[u8],
    verifier: &impl Verifier,
    nn: &NetworkName,
    msg: &GMessage,
) -> Result<(), GpbftError> {
    // Sender must hold positive power.
    let Some((sender_power, sender_pub_key)) = power_table.get(msg.sender) else {
        return Err(invalid(format!(
            "sender {} not in power table",
            msg.sender
        )));
    };
    if sender_power.is_zero() {
        return Err(invalid(format!("sender {} has zero power", msg.sender)));
    }

    // Vote value must be a well-formed chain.
    msg.vote
        .value
        .validate()
        .map_err(|e| invalid(format!("invalid vote value chain: {e}")))?;

    // Phase-specific constraints.
    match msg.vote.phase {
        Phase::Initial | Phase::Terminated => {
            return Err(invalid(format!("invalid vote phase {}", msg.vote.phase)));
        }
        Phase::Quality => {
            if msg.vote.round != 0 {
                return Err(invalid(format!(
                    "unexpected round {} for QUALITY",
                    msg.vote.round
                )));
            }
            if msg.vote.value.is_zero() {
                return Err(invalid("unexpected bottom value for QUALITY"));
            }
        }
        Phase::Converge => {
            if msg.vote.round == 0 {
                return Err(invalid("unexpected round 0 for CONVERGE"));
            }
            if msg.vote.value.is_zero() {
                return Err(invalid("unexpected bottom value for CONVERGE"));
            }
            if !vrf::verify_ticket(
                nn,
                beacon,
                msg.vote.instance,
                msg.vote.round,
                sender_pub_key,
                verifier,
                &msg.ticket,
            ) {
                return Err(invalid(format!(
                    "failed to verify ticket from {}",
                    msg.sender
                )));
            }
        }
        Phase::Decide => {
            if msg.vote.round != 0 {
                return Err(invalid(format!(
                    "unexpected non-zero round {} for DECIDE",
                    msg.vote.round
                )));
            }
            if msg.vote.value.is_zero() {
                return Err(invalid("unexpected bottom value for DECIDE"));
            }
        }
        // No additional constraints for PREPARE and COMMIT.
        Phase::Prepare | Phase::Commit => {}
    }

    // Vote signature.
    let sig_payload = msg.vote.marshal_for_signing(nn);
    verifier
        .verify(sender_pub_key, &sig_payload, &msg.signature)
        .map_err(|e| invalid(format!("invalid signature on {msg:?}: {e}")))?;

    // Justification, required for every phase except QUALITY, round-0
    // PREPARE, and COMMIT for bottom.
    let needs_justification = !(msg.vote.phase == Phase::Quality
        || (msg.vote.phase == Phase::Prepare && msg.vote.round == 0)
        || (msg.vote.phase == Phase::Commit && msg.vote.value.is_zero()));

    match (&msg.justification, needs_justification) {
        (None, false) => Ok(()),
        (None, true) => Err(invalid(format!(
            "message for phase {} round {} has no justification",
            msg.vote.phase, msg.vote.round
        ))),
        (Some(_), false) => Err(invalid("message has unexpected justification")),
        (Some(justification), true) => {
            validate_justification(power_table, verifier, nn, msg, justification)
        }
    }
}

/// The justification requirement table: maps a message phase to the allowed
/// justification phases, each with the required round and value. Anything
/// else is rejected.
fn expected_justification(
    msg: &GMessage,
    justification_phase: Phase,
) -> Option<(u64, ECChain)> {
    let vote = &msg.vote;
    match (vote.phase, justification_phase) {
        // CONVERGE is justified by a strong quorum of COMMIT for bottom, or
        // of PREPARE for the same value, from the previous round. PREPARE
        // (in rounds > 0) follows the same rules.
        (Phase::Converge | Phase::Prepare, Phase::Commit) => {
            Some((vote.round - 1, ECChain::bottom()))
        }
        (Phase::Converge | Phase::Prepare, Phase::Prepare) => {
            Some((vote.round - 1, vote.value.clone()))
        }
        // COMMIT is justified by a strong quorum of PREPARE from the same
        // round for the same value.
        (Phase::Commit, Phase::Prepare) => Some((vote.round, vote.value.clone())),
        // DECIDE is justified by a strong quorum of COMMIT for the same
        // value, from any round.
        (Phase::Decide, Phase::Commit) => Some((ANY_ROUND, vote.value.clone())),
        _ => None,
    }
}

fn validate_justification(
    power_table: &PowerTable,
    verifier: &impl Verifier,
    nn: &NetworkName,
    msg: &GMessage,
    justification: &granite_types::Justification,
) -> Result<(), GpbftError> {
    if justification.vote.instance != msg.vote.instance {
        return Err(invalid(format!(
            "message for instance {} has justification from instance {}",
            msg.vote.instance, justification.vote.instance
        )));
    }
    justification
        .vote
        .value
        .validate()
        .map_err(|e| invalid(format!("invalid justification value chain: {e}")))?;

    let Some((expected_round, expected_value)) =
        expected_justification(msg, justification.vote.phase)
    else {
        return Err(invalid(format!(
            "message {:?} has justification with unexpected phase {}",
            msg, justification.vote.phase
        )));
    };
    if expected_round != ANY_ROUND && justification.vote.round != expected_round {
        return Err(invalid(format!(
            "message {:?} has justification from wrong round {}",
            msg, justification.vote.round
        )));
    }
    if justification.vote.value != expected_value {
        return Err(invalid(format!(
            "message {:?} has justification for a different value {}",
            msg, justification.vote.value
        )));
    }

    // Signer indices must be in range; their power must cross the strong
    // threshold.
    let mut justification_power = StoragePower::zero();
    let mut signers: Vec<PubKey> = Vec::new();
    for bit in justification.signers.iter() {
        let Some(entry) = power_table.entries().get(bit as usize) else {
            return Err(invalid(format!("invalid signer index {bit}")));
        };
        justification_power += &entry.power;
        signers.push(entry.pub_key.clone());
    }
    if !is_strong_quorum(&justification_power, power_table.total()) {
        return Err(invalid(format!(
            "justification with insufficient power {justification_power}"
        )));
    }

    let payload = justification.vote.marshal_for_signing(nn);
    verifier
        .verify_aggregate(&payload, &justification.signature, &signers)
        .map_err(|e| invalid(format!("invalid aggregate on {justification:?}: {e}")))?;
    Ok(())
}
