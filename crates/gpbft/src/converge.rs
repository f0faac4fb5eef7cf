//! CONVERGE phase state: proposals, justifications, and VRF tickets for one
//! round.

use crate::error::GpbftError;
use granite_types::{ActorId, BigInt, ECChain, Justification, PowerTable, Ticket};
use num_bigint::Sign;
use std::collections::BTreeSet;

/// Proposals received in one CONVERGE round.
///
/// The first value and justification received for a chain win; every
/// sender's ticket is retained for the weighted tie-break.
pub(crate) struct ConvergeState {
    /// Senders from which a proposal has been received.
    senders: BTreeSet<ActorId>,
    /// Distinct proposals, in first-observed order.
    values: Vec<ConvergeValue>,
}

/// A proposal value with its justification and supporting tickets.
#[derive(Clone)]
pub(crate) struct ConvergeValue {
    pub chain: ECChain,
    pub justification: Justification,
    tickets: Vec<ConvergeTicket>,
}

#[derive(Clone)]
struct ConvergeTicket {
    sender: ActorId,
    ticket: Ticket,
}

impl ConvergeState {
    pub(crate) fn new() -> Self {
        Self {
            senders: BTreeSet::new(),
            values: Vec::new(),
        }
    }

    /// Receives a CONVERGE proposal. Ignores any subsequent proposal from a
    /// sender already seen.
    pub(crate) fn receive(
        &mut self,
        sender: ActorId,
        value: &ECChain,
        ticket: &Ticket,
        justification: &Justification,
    ) -> Result<(), GpbftError> {
        if !self.senders.insert(sender) {
            return Ok(());
        }
        if value.is_zero() {
            return Err(GpbftError::ReceivedInternalError(
                "bottom cannot be justified for CONVERGE".into(),
            ));
        }

        let ticket = ConvergeTicket {
            sender,
            ticket: ticket.clone(),
        };
        match self.values.iter_mut().find(|v| v.chain == *value) {
            Some(existing) => existing.tickets.push(ticket),
            None => self.values.push(ConvergeValue {
                chain: value.clone(),
                justification: justification.clone(),
                tickets: vec![ticket],
            }),
        }
        Ok(())
    }

    /// Returns the proposal whose maximum power-weighted ticket is largest,
    /// or `None` if no proposals have been received.
    ///
    /// Non-determinism under equivocating tickets is tolerable: eventually
    /// some round's max ticket is held by a correct participant, who does
    /// not double-vote. Ties break to the first-observed proposal.
    pub(crate) fn find_max_ticket_proposal(&self, table: &PowerTable) -> Option<&ConvergeValue> {
        let mut max_weight: Option<BigInt> = None;
        let mut max_value = None;

        for value in &self.values {
            for ct in &value.tickets {
                let Some((power, _)) = table.get(ct.sender) else {
                    continue;
                };
                let ticket_int = BigInt::from_bytes_be(Sign::Plus, ct.ticket.as_bytes());
                let weighted = ticket_int * power;
                if max_weight.as_ref().map_or(true, |max| weighted > *max) {
                    max_weight = Some(weighted);
                    max_value = Some(value);
                }
            }
        }
        max_value
    }

    /// Finds some received proposal matching a specific chain.
    pub(crate) fn find_proposal_for(&self, chain: &ECChain) -> Option<&ConvergeValue> {
        self.values.iter().find(|v| v.chain == *chain)
    }
}
