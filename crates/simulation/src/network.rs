//! Shared simulated-network state: the event queue, alarms, latency model,
//! and the oracles (chains, committee) that hosts serve to participants.

use crate::signing::SigningBackend;
use granite_types::{ActorId, ECChain, GMessage, Justification, NetworkName, PowerTable};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base one-way message latency.
    pub latency_mean: Duration,
    /// Jitter as a fraction of the base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// RNG seed for latency sampling. Same seed, same run.
    pub seed: u64,
    /// Delay between a decision and the start of the next instance.
    pub ec_period: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency_mean: Duration::from_millis(10),
            jitter_fraction: 0.1,
            seed: 0,
            ec_period: Duration::from_millis(50),
        }
    }
}

/// A message in flight.
pub(crate) struct Envelope {
    pub to: ActorId,
    pub msg: GMessage,
}

/// State shared between the runner and every participant's host handle.
pub(crate) struct SimNet {
    pub config: NetworkConfig,
    pub now: Duration,
    /// Monotonic sequence breaking ties between events at the same time.
    seq: u64,
    /// Messages in flight, ordered by (delivery time, sequence).
    pub queue: BTreeMap<(Duration, u64), Envelope>,
    /// At most one pending alarm per participant.
    pub alarms: BTreeMap<ActorId, Duration>,
    rng: ChaCha8Rng,
    pub signing: SigningBackend,
    pub network_name: NetworkName,
    /// All participant ids, in id order.
    pub members: Vec<ActorId>,
    /// Chains each participant proposes, per instance.
    pub chains: BTreeMap<(ActorId, u64), ECChain>,
    /// The committee used for every instance.
    pub committee: Option<(PowerTable, Vec<u8>)>,
    /// Decisions observed per participant, in decision order.
    pub decisions: BTreeMap<ActorId, Vec<(u64, Justification)>>,
}

impl SimNet {
    pub fn new(config: NetworkConfig, network_name: NetworkName, rng: ChaCha8Rng) -> Self {
        Self {
            config,
            now: Duration::ZERO,
            seq: 0,
            queue: BTreeMap::new(),
            alarms: BTreeMap::new(),
            rng,
            signing: SigningBackend::new(),
            network_name,
            members: Vec::new(),
            chains: BTreeMap::new(),
            committee: None,
            decisions: BTreeMap::new(),
        }
    }

    /// Schedules delivery of a message to every member, including loopback
    /// to the sender at zero latency.
    pub fn broadcast(&mut self, from: ActorId, msg: GMessage) {
        for i in 0..self.members.len() {
            let to = self.members[i];
            let latency = if to == from {
                Duration::ZERO
            } else {
                self.sample_latency()
            };
            let at = self.now + latency;
            let seq = self.seq;
            self.seq += 1;
            self.queue.insert(
                (at, seq),
                Envelope {
                    to,
                    msg: msg.clone(),
                },
            );
        }
    }

    fn sample_latency(&mut self) -> Duration {
        let base = self.config.latency_mean.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            self.rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0001))
    }
}
