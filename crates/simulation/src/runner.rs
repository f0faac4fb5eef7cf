//! Deterministic simulation runner.
//!
//! Pops events (message deliveries and alarm fires) in time order and
//! dispatches them to participants. Given the same configuration and seed,
//! every run produces identical results.

use crate::host::SimHost;
use crate::network::{NetworkConfig, SimNet};
use granite_gpbft::{GpbftError, GraniteConfig, Participant};
use granite_types::{
    is_strong_quorum, ActorId, ECChain, Justification, NetworkName, Phase, PowerEntry,
    PowerTable, StoragePower,
};
use num_traits::Zero;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;
use tracing::{trace, warn};

/// Statistics collected during a run.
#[derive(Debug, Default, Clone)]
pub struct SimStats {
    /// Messages delivered to a participant.
    pub messages_delivered: u64,
    /// Messages rejected by validation or receive (stale instances, wrong
    /// base).
    pub messages_dropped: u64,
    /// Alarms fired.
    pub alarms_fired: u64,
}

/// Builder for a simulation.
pub struct SimBuilder {
    powers: Vec<StoragePower>,
    network: NetworkConfig,
    granite: GraniteConfig,
    /// (participant or all, instance) → proposal chain.
    chains: Vec<(Option<ActorId>, u64, ECChain)>,
}

impl SimBuilder {
    pub fn new() -> Self {
        Self {
            powers: Vec::new(),
            network: NetworkConfig::default(),
            granite: GraniteConfig {
                // Short synchrony bound: simulated latency is small.
                delta: Duration::from_millis(60),
                ..GraniteConfig::default()
            },
            chains: Vec::new(),
        }
    }

    /// Adds one participant per entry, with the given voting power.
    pub fn with_participants(mut self, powers: &[u64]) -> Self {
        self.powers = powers.iter().map(|&p| StoragePower::from(p)).collect();
        self
    }

    pub fn with_network(mut self, config: NetworkConfig) -> Self {
        self.network = config;
        self
    }

    pub fn with_granite_config(mut self, config: GraniteConfig) -> Self {
        self.granite = config;
        self
    }

    /// Registers the chain every participant proposes for an instance.
    pub fn with_chain(mut self, instance: u64, chain: ECChain) -> Self {
        self.chains.push((None, instance, chain));
        self
    }

    /// Registers the chain one participant proposes for an instance.
    pub fn with_chain_for(mut self, node: ActorId, instance: u64, chain: ECChain) -> Self {
        self.chains.push((Some(node), instance, chain));
        self
    }

    pub fn build(self) -> SimRunner {
        assert!(!self.powers.is_empty(), "no participants configured");

        let rng = ChaCha8Rng::seed_from_u64(self.network.seed);
        let mut net = SimNet::new(self.network, NetworkName::from("granite-sim"), rng);

        // Keys and the committee, one entry per participant.
        let mut entries = Vec::with_capacity(self.powers.len());
        for (i, power) in self.powers.iter().enumerate() {
            let id = i as ActorId;
            let pub_key = net.signing.generate_key(id);
            entries.push(PowerEntry::new(id, power.clone(), pub_key));
            net.members.push(id);
        }
        let power_table = PowerTable::from_entries(entries).expect("valid test power table");
        net.committee = Some((power_table, b"sim-beacon".to_vec()));

        for (node, instance, chain) in self.chains {
            match node {
                Some(node) => {
                    net.chains.insert((node, instance), chain);
                }
                None => {
                    for &member in &net.members {
                        net.chains.insert((member, instance), chain.clone());
                    }
                }
            }
        }

        let members = net.members.clone();
        let shared = Rc::new(RefCell::new(net));
        let participants = members
            .iter()
            .map(|&id| {
                let host = SimHost::new(id, shared.clone());
                (id, Participant::new(id, host, self.granite.clone()))
            })
            .collect();

        SimRunner {
            shared,
            participants,
            stats: SimStats::default(),
        }
    }
}

impl Default for SimBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum NextEvent {
    Message((Duration, u64)),
    Alarm(ActorId, Duration),
}

/// Drives a set of participants over the simulated network.
pub struct SimRunner {
    shared: Rc<RefCell<SimNet>>,
    participants: BTreeMap<ActorId, Participant<SimHost>>,
    pub stats: SimStats,
}

impl SimRunner {
    pub fn builder() -> SimBuilder {
        SimBuilder::new()
    }

    /// Starts every participant on its first instance.
    pub fn start(&mut self) {
        for participant in self.participants.values_mut() {
            participant.start().expect("participant failed to start");
        }
    }

    pub fn now(&self) -> Duration {
        self.shared.borrow().now
    }

    pub fn participant(&self, id: ActorId) -> &Participant<SimHost> {
        &self.participants[&id]
    }

    pub fn participant_ids(&self) -> Vec<ActorId> {
        self.participants.keys().copied().collect()
    }

    /// The decision a participant reached for an instance, if any.
    pub fn decision(&self, node: ActorId, instance: u64) -> Option<Justification> {
        self.shared
            .borrow()
            .decisions
            .get(&node)
            .and_then(|ds| ds.iter().find(|(i, _)| *i == instance))
            .map(|(_, j)| j.clone())
    }

    /// Whether every participant has decided the given instance.
    pub fn all_decided(&self, instance: u64) -> bool {
        let net = self.shared.borrow();
        net.members.iter().all(|id| {
            net.decisions
                .get(id)
                .is_some_and(|ds| ds.iter().any(|(i, _)| *i == instance))
        })
    }

    /// Runs until the predicate holds or the simulated clock passes
    /// `max_time`. Returns whether the predicate held.
    pub fn run_until(
        &mut self,
        max_time: Duration,
        pred: impl Fn(&SimRunner) -> bool,
    ) -> bool {
        loop {
            if pred(self) {
                return true;
            }
            if self.now() > max_time || !self.step() {
                return pred(self);
            }
        }
    }

    /// Processes the next event. Returns false when nothing is scheduled.
    pub fn step(&mut self) -> bool {
        let next = {
            let net = self.shared.borrow();
            let message = net.queue.keys().next().copied();
            let alarm = net
                .alarms
                .iter()
                .map(|(&id, &at)| (at, id))
                .min()
                .map(|(at, id)| (id, at));
            match (message, alarm) {
                (None, None) => return false,
                (Some(key), None) => NextEvent::Message(key),
                (None, Some((id, at))) => NextEvent::Alarm(id, at),
                (Some(key), Some((id, at))) => {
                    // Messages win ties so alarm handlers observe everything
                    // delivered up to the alarm time.
                    if key.0 <= at {
                        NextEvent::Message(key)
                    } else {
                        NextEvent::Alarm(id, at)
                    }
                }
            }
        };

        match next {
            NextEvent::Message(key) => {
                let envelope = {
                    let mut net = self.shared.borrow_mut();
                    net.now = net.now.max(key.0);
                    net.queue.remove(&key).expect("popped event vanished")
                };
                self.deliver(envelope.to, envelope.msg);
            }
            NextEvent::Alarm(id, at) => {
                {
                    let mut net = self.shared.borrow_mut();
                    net.now = net.now.max(at);
                    net.alarms.remove(&id);
                }
                self.stats.alarms_fired += 1;
                let participant = self.participants.get_mut(&id).expect("unknown participant");
                participant.receive_alarm().expect("alarm handling failed");
            }
        }
        true
    }

    fn deliver(&mut self, to: ActorId, msg: granite_types::GMessage) {
        let participant = self.participants.get_mut(&to).expect("unknown participant");
        let validated = match participant.validate_message(&msg) {
            Ok(validated) => validated,
            Err(GpbftError::ValidationTooOld { .. }) => {
                trace!(to, ?msg, "dropping message for past instance");
                self.stats.messages_dropped += 1;
                return;
            }
            Err(e) => {
                warn!(to, ?msg, error = %e, "transport rejected message");
                self.stats.messages_dropped += 1;
                return;
            }
        };
        match participant.receive_message(validated) {
            Ok(()) => self.stats.messages_delivered += 1,
            Err(GpbftError::ValidationTooOld { .. } | GpbftError::ValidationWrongBase) => {
                trace!(to, ?msg, "message dropped at receive");
                self.stats.messages_dropped += 1;
            }
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }

    /// Checks the soundness of a decision justification against the
    /// committee: DECIDE payload, unique in-range signers with power above
    /// the strong threshold, and a verifying aggregate signature.
    pub fn check_decision_soundness(&self, decision: &Justification) -> Result<(), String> {
        let net = self.shared.borrow();
        let (power_table, _) = net.committee.as_ref().expect("committee registered");

        if decision.vote.phase != Phase::Decide || decision.vote.round != 0 {
            return Err(format!("decision payload is {:?}", decision.vote));
        }
        if decision.vote.value.is_zero() {
            return Err("decision for bottom".into());
        }

        let mut power = StoragePower::zero();
        let mut signers = Vec::new();
        for bit in decision.signers.iter() {
            let entry = power_table
                .entries()
                .get(bit as usize)
                .ok_or_else(|| format!("signer index {bit} out of range"))?;
            power += &entry.power;
            signers.push(entry.pub_key.clone());
        }
        if !is_strong_quorum(&power, power_table.total()) {
            return Err(format!(
                "signer power {power} of {} is not a strong quorum",
                power_table.total()
            ));
        }

        let payload = decision.vote.marshal_for_signing(&net.network_name);
        net.signing
            .verify_aggregate(&payload, &decision.signature, &signers)
            .map_err(|e| format!("aggregate verification failed: {e}"))
    }
}
