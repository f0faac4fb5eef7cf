//! The participant: runs repeated Granite instances to finalise a growing
//! chain.
//!
//! The participant multiplexes between the active instance and messages
//! bound for future instances, caches committees, and bridges decisions to
//! the host. It is a single-threaded consumer of validated messages and
//! alarms; message validation itself may run concurrently upstream.

use crate::config::GraniteConfig;
use crate::error::GpbftError;
use crate::host::Host;
use crate::instance::Instance;
use crate::validator::validate_message;
use granite_types::{
    ActorId, GMessage, Justification, PowerTable, CHAIN_MAX_LEN,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A message that has passed [`validate_message`] against its target
/// instance's committee. Only validated messages can be received.
#[derive(Debug, Clone)]
pub struct ValidatedMessage(GMessage);

impl ValidatedMessage {
    pub fn message(&self) -> &GMessage {
        &self.0
    }

    fn into_message(self) -> GMessage {
        self.0
    }
}

/// A power table and beacon value: the committee inputs to an instance.
struct Committee {
    power_table: Arc<PowerTable>,
    beacon: Vec<u8>,
}

/// A Granite participant.
pub struct Participant<H: Host> {
    id: ActorId,
    config: GraniteConfig,
    host: H,
    /// Instance identifier for the current (or, if none, next to start)
    /// instance.
    current_instance: u64,
    /// The active instance, created lazily.
    instance: Option<Instance>,
    /// Committees cached for the current and future instances.
    committees: HashMap<u64, Committee>,
    /// Messages queued for future instances.
    mqueue: MessageQueue,
    /// Decision of the last terminated instance and the round during which
    /// it terminated. Informational; the round is the local one, not
    /// necessarily the round whose COMMIT quorum justified the decision.
    last_termination: Option<(Justification, u64)>,
}

impl<H: Host> Participant<H> {
    pub fn new(id: ActorId, host: H, config: GraniteConfig) -> Self {
        Self {
            id,
            current_instance: config.initial_instance,
            config,
            host,
            instance: None,
            committees: HashMap::new(),
            mqueue: MessageQueue::new(),
            last_termination: None,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn current_instance(&self) -> u64 {
        self.current_instance
    }

    /// Round of the active instance, or 0 when none is active.
    pub fn current_round(&self) -> u64 {
        self.instance.as_ref().map_or(0, |i| i.round())
    }

    /// The last decision, with the round during which the instance
    /// terminated.
    pub fn last_termination(&self) -> Option<&(Justification, u64)> {
        self.last_termination.as_ref()
    }

    /// Fetches the preferred EC chain for the current instance and begins
    /// the protocol.
    pub fn start(&mut self) -> Result<(), GpbftError> {
        self.begin_instance()
    }

    /// Validates a message received from another participant.
    ///
    /// Reads only immutable per-instance state and the verifier capability,
    /// apart from committee-cache population.
    pub fn validate_message(
        &mut self,
        msg: &GMessage,
    ) -> Result<ValidatedMessage, GpbftError> {
        // Reject messages for past instances.
        if msg.vote.instance < self.current_instance {
            return Err(GpbftError::ValidationTooOld {
                instance: msg.vote.instance,
                current: self.current_instance,
            });
        }

        // Fetch the committee to validate against; it may not exist yet for
        // far-future instances, in which case the caller may retry.
        let (power_table, beacon) = self.get_committee(msg.vote.instance)?;
        validate_message(
            &power_table,
            &beacon,
            &self.host,
            self.host.network_name(),
            msg,
        )?;
        Ok(ValidatedMessage(msg.clone()))
    }

    /// Receives a validated message from some other participant.
    pub fn receive_message(&mut self, vmsg: ValidatedMessage) -> Result<(), GpbftError> {
        let msg = vmsg.into_message();

        // Drop messages for past instances.
        if msg.vote.instance < self.current_instance {
            return Err(GpbftError::ValidationTooOld {
                instance: msg.vote.instance,
                current: self.current_instance,
            });
        }

        if msg.vote.instance == self.current_instance {
            if let Some(instance) = self.instance.as_mut() {
                instance.receive(&mut self.host, msg)?;
                self.handle_decision();
                return Ok(());
            }
        }
        // Queue for a future instance (or the current one not yet started).
        self.mqueue.add(msg, self.config.max_lookahead_rounds);
        Ok(())
    }

    /// Receives an alarm fire. With no active instance the alarm means
    /// "start the next instance now".
    pub fn receive_alarm(&mut self) -> Result<(), GpbftError> {
        match self.instance.as_mut() {
            None => self.begin_instance(),
            Some(instance) => {
                instance.receive_alarm(&mut self.host)?;
                self.handle_decision();
                Ok(())
            }
        }
    }

    fn begin_instance(&mut self) -> Result<(), GpbftError> {
        let chain = match self.host.get_chain_for_instance(self.current_instance) {
            Ok(chain) => chain,
            Err(e) => return self.retry_start_later("chain", e),
        };
        if chain.is_zero() {
            return Err(GpbftError::ReceivedInternalError(
                "canonical chain cannot be bottom".into(),
            ));
        }
        // Limit the length of the proposed chain.
        let chain = chain.prefix(CHAIN_MAX_LEN - 1);
        chain.validate().map_err(|e| {
            GpbftError::ReceivedInternalError(format!("invalid canonical chain: {e}"))
        })?;

        let (power_table, beacon) = match self.get_committee(self.current_instance) {
            Ok(committee) => committee,
            Err(GpbftError::ValidationNoCommittee { reason, .. }) => {
                return self.retry_start_later("committee", crate::HostError(reason));
            }
            Err(e) => return Err(e),
        };

        let mut instance = Instance::new(
            self.id,
            self.current_instance,
            chain,
            power_table,
            beacon,
            self.config.delta,
            self.config.delta_backoff_exponent,
        )?;
        instance.start(&mut self.host)?;
        let instance_id = instance.instance_id();
        self.instance = Some(instance);

        // Deliver any messages queued for the new instance.
        for msg in self.mqueue.drain(instance_id) {
            if self.terminated() {
                break;
            }
            debug!(participant = self.id, instance = instance_id, ?msg, "delivering queued message");
            match self
                .instance
                .as_mut()
                .expect("instance active while draining queue")
                .receive(&mut self.host, msg)
            {
                Ok(()) => {}
                // The late-bound base check can only fail once the instance
                // exists; such messages are dropped silently.
                Err(GpbftError::ValidationWrongBase) => {}
                Err(e) => return Err(e),
            }
        }
        self.handle_decision();
        Ok(())
    }

    /// Host inputs for the next instance are unavailable; try again after a
    /// synchrony delay.
    fn retry_start_later(
        &mut self,
        what: &str,
        error: crate::HostError,
    ) -> Result<(), GpbftError> {
        warn!(
            participant = self.id,
            instance = self.current_instance,
            error = %error,
            "failed fetching {what} for next instance, retrying at alarm"
        );
        let retry_at = self.host.time() + self.config.delta;
        self.host.set_alarm(retry_at);
        Ok(())
    }

    fn get_committee(
        &mut self,
        instance: u64,
    ) -> Result<(Arc<PowerTable>, Vec<u8>), GpbftError> {
        if let Some(committee) = self.committees.get(&instance) {
            return Ok((committee.power_table.clone(), committee.beacon.clone()));
        }
        let (power_table, beacon) = self
            .host
            .get_committee_for_instance(instance)
            .map_err(|e| GpbftError::ValidationNoCommittee {
                instance,
                reason: e.to_string(),
            })?;
        power_table
            .validate()
            .map_err(|e| GpbftError::ValidationNoCommittee {
                instance,
                reason: format!("invalid power table: {e}"),
            })?;
        let power_table = Arc::new(power_table);
        self.committees.insert(
            instance,
            Committee {
                power_table: power_table.clone(),
                beacon: beacon.clone(),
            },
        );
        Ok((power_table, beacon))
    }

    fn handle_decision(&mut self) {
        if !self.terminated() {
            return;
        }
        let instance = self.instance.take().expect("terminated without instance");
        let decision = instance
            .termination_value()
            .cloned()
            .expect("terminated instance without termination value");
        info!(
            participant = self.id,
            instance = instance.instance_id(),
            round = instance.round(),
            value = %decision.vote.value,
            "reached decision"
        );
        self.committees.remove(&instance.instance_id());
        self.current_instance += 1;
        self.last_termination = Some((decision.clone(), instance.round()));

        let next_start = self.host.receive_decision(&decision);
        self.host.set_alarm(next_start);
    }

    fn terminated(&self) -> bool {
        self.instance.as_ref().is_some_and(|i| i.terminated())
    }
}

/// Messages queued for delivery to future instances.
///
/// The queue drops equivocations (same sender, round, and phase) and
/// unjustified messages beyond a round bound. The relative order of a
/// sender's messages is not preserved; draining sorts by (round, phase) so
/// messages are processed in a useful order.
struct MessageQueue {
    /// instance → sender → messages.
    messages: BTreeMap<u64, BTreeMap<ActorId, Vec<GMessage>>>,
}

impl MessageQueue {
    fn new() -> Self {
        Self {
            messages: BTreeMap::new(),
        }
    }

    fn add(&mut self, msg: GMessage, max_round: u64) {
        // Spam messages for far-future instances are assumed to be dropped
        // by the transport before reaching this queue.
        let instance_queue = self.messages.entry(msg.vote.instance).or_default();

        // Drop unjustified messages beyond the round bound.
        if msg.vote.round > max_round && is_spammable(&msg) {
            return;
        }
        // Drop equivocations and duplicates.
        let sender_queue = instance_queue.entry(msg.sender).or_default();
        if sender_queue
            .iter()
            .any(|m| m.vote.round == msg.vote.round && m.vote.phase == msg.vote.phase)
        {
            return;
        }
        sender_queue.push(msg);
    }

    fn drain(&mut self, instance: u64) -> Vec<GMessage> {
        let Some(instance_queue) = self.messages.remove(&instance) else {
            return Vec::new();
        };
        let mut msgs: Vec<GMessage> = instance_queue.into_values().flatten().collect();
        msgs.sort_by_key(|m| (m.vote.round, m.vote.phase));
        msgs
    }
}

/// Whether a message could be produced at no cost, so that an adversary
/// could spam the queue with it for arbitrary rounds.
fn is_spammable(msg: &GMessage) -> bool {
    msg.justification.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use granite_types::test_utils::test_chain;
    use granite_types::{BitField, ECChain, Payload, Phase, Ticket};

    fn message(
        sender: ActorId,
        instance: u64,
        round: u64,
        phase: Phase,
        justified: bool,
    ) -> GMessage {
        let chain = test_chain(&[(0, 1), (1, 2)]);
        let justification = justified.then(|| Justification {
            vote: Payload::new(instance, round, Phase::Prepare, chain.clone()),
            signers: BitField::try_from_bits([0u64]).unwrap(),
            signature: vec![1],
        });
        GMessage {
            sender,
            vote: Payload::new(instance, round, phase, chain),
            signature: vec![2],
            ticket: Ticket::default(),
            justification,
        }
    }

    #[test]
    fn queue_drops_duplicates() {
        let mut queue = MessageQueue::new();
        queue.add(message(1, 5, 0, Phase::Prepare, false), 10);
        queue.add(message(1, 5, 0, Phase::Prepare, false), 10);
        queue.add(message(1, 5, 0, Phase::Commit, true), 10);
        queue.add(message(2, 5, 0, Phase::Prepare, false), 10);
        assert_eq!(queue.drain(5).len(), 3);
        assert!(queue.drain(5).is_empty());
    }

    #[test]
    fn queue_drops_unjustified_beyond_lookahead() {
        let mut queue = MessageQueue::new();
        queue.add(message(1, 5, 11, Phase::Prepare, false), 10);
        queue.add(message(2, 5, 11, Phase::Prepare, true), 10);
        queue.add(message(3, 5, 10, Phase::Prepare, false), 10);
        let drained = queue.drain(5);
        let senders: Vec<ActorId> = drained.iter().map(|m| m.sender).collect();
        assert_eq!(senders, vec![3, 2]);
    }

    #[test]
    fn drain_sorts_by_round_then_phase() {
        let mut queue = MessageQueue::new();
        queue.add(message(1, 7, 1, Phase::Commit, true), 10);
        queue.add(message(2, 7, 0, Phase::Commit, true), 10);
        queue.add(message(3, 7, 0, Phase::Quality, false), 10);
        queue.add(message(4, 7, 1, Phase::Converge, true), 10);
        let order: Vec<(u64, Phase)> = queue
            .drain(7)
            .iter()
            .map(|m| (m.vote.round, m.vote.phase))
            .collect();
        assert_eq!(
            order,
            vec![
                (0, Phase::Quality),
                (0, Phase::Commit),
                (1, Phase::Converge),
                (1, Phase::Commit),
            ]
        );
        // Other instances unaffected.
        assert!(queue.drain(8).is_empty());
    }

    #[test]
    fn bottom_value_messages_are_queueable() {
        // A COMMIT for bottom carries no justification but is not spam
        // within the lookahead bound.
        let mut queue = MessageQueue::new();
        let mut msg = message(1, 5, 2, Phase::Commit, false);
        msg.vote.value = ECChain::bottom();
        queue.add(msg, 10);
        assert_eq!(queue.drain(5).len(), 1);
    }
}
