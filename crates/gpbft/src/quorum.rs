//! Incremental quorum-calculation helper.
//!
//! Accumulates values from a collection of senders and incrementally tracks
//! which values have reached a strong quorum of support. Supports receiving
//! multiple values from a sender at once (QUALITY prefixes), and hence
//! multiple strong-quorum values. Subsequent messages from a single sender
//! are dropped.

use crate::error::HostError;
use crate::host::Verifier;
use granite_types::{
    is_strong_quorum, is_weak_quorum, ActorId, BitField, ChainKey, ECChain, Justification,
    PowerTable, PubKey, StoragePower,
};
use num_traits::Zero;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Per-phase, per-round vote accumulator.
pub(crate) struct QuorumState {
    power_table: Arc<PowerTable>,
    /// Senders from which a vote has been received.
    senders: BTreeSet<ActorId>,
    /// Aggregate power of all distinct senders seen so far.
    senders_total_power: StoragePower,
    /// Support per chain value, keyed by chain fingerprint.
    chain_support: BTreeMap<ChainKey, ChainSupport>,
    /// First justification observed for each value.
    received_justification: BTreeMap<ChainKey, Justification>,
}

/// A chain value and the state of its support.
struct ChainSupport {
    chain: ECChain,
    power: StoragePower,
    signatures: BTreeMap<ActorId, Vec<u8>>,
    has_strong_quorum: bool,
    has_weak_quorum: bool,
}

impl QuorumState {
    pub(crate) fn new(power_table: Arc<PowerTable>) -> Self {
        Self {
            power_table,
            senders: BTreeSet::new(),
            senders_total_power: StoragePower::zero(),
            chain_support: BTreeMap::new(),
            received_justification: BTreeMap::new(),
        }
    }

    /// Receives a chain from a sender. Idempotent per sender: any subsequent
    /// value from a sender already seen is ignored.
    pub(crate) fn receive(&mut self, sender: ActorId, value: &ECChain, signature: &[u8]) {
        let Some(power) = self.receive_sender(sender) else {
            return;
        };
        self.receive_inner(sender, value, &power, signature.to_vec());
    }

    /// Receives each prefix of a chain as a distinct value from a sender.
    /// Signatures are not stored, so prefixes cannot later be aggregated.
    /// Intended for the QUALITY phase only.
    pub(crate) fn receive_each_prefix(&mut self, sender: ActorId, values: &ECChain) {
        let Some(power) = self.receive_sender(sender) else {
            return;
        };
        for j in 1..=values.suffix().len() {
            let prefix = values.prefix(j);
            self.receive_inner(sender, &prefix, &power, Vec::new());
        }
    }

    /// Adds the sender's power to the total the first time it is seen.
    /// Returns `None` for repeat senders or non-participants.
    fn receive_sender(&mut self, sender: ActorId) -> Option<StoragePower> {
        if !self.senders.insert(sender) {
            return None;
        }
        let (power, _) = self.power_table.get(sender)?;
        let power = power.clone();
        self.senders_total_power += &power;
        Some(power)
    }

    fn receive_inner(
        &mut self,
        sender: ActorId,
        value: &ECChain,
        power: &StoragePower,
        signature: Vec<u8>,
    ) {
        let support = self
            .chain_support
            .entry(value.key())
            .or_insert_with(|| ChainSupport {
                chain: value.clone(),
                power: StoragePower::zero(),
                signatures: BTreeMap::new(),
                has_strong_quorum: false,
                has_weak_quorum: false,
            });
        support.power += power;
        if support.signatures.insert(sender, signature).is_some() {
            panic!("duplicate vote should have been dropped");
        }
        support.has_strong_quorum = is_strong_quorum(&support.power, self.power_table.total());
        support.has_weak_quorum = is_weak_quorum(&support.power, self.power_table.total());
    }

    /// Stores the justification for a value; only the first one is kept.
    pub(crate) fn receive_justification(&mut self, value: &ECChain, justification: &Justification) {
        self.received_justification
            .entry(value.key())
            .or_insert_with(|| justification.clone());
    }

    pub(crate) fn justification_for(&self, key: &ChainKey) -> Option<&Justification> {
        self.received_justification.get(key)
    }

    /// All values received from any sender, in no particular order.
    pub(crate) fn list_all_values(&self) -> impl Iterator<Item = &ECChain> {
        self.chain_support.values().map(|cs| &cs.chain)
    }

    /// Whether votes have arrived from a strong quorum of senders
    /// (independent of which values they support).
    pub(crate) fn received_from_strong_quorum(&self) -> bool {
        is_strong_quorum(&self.senders_total_power, self.power_table.total())
    }

    pub(crate) fn has_strong_quorum_for(&self, key: &ChainKey) -> bool {
        self.chain_support
            .get(key)
            .is_some_and(|cs| cs.has_strong_quorum)
    }

    #[allow(dead_code)]
    pub(crate) fn has_weak_quorum_for(&self, key: &ChainKey) -> bool {
        self.chain_support
            .get(key)
            .is_some_and(|cs| cs.has_weak_quorum)
    }

    /// If the value has strong quorum, returns a minimal set of signers that
    /// crosses the threshold, along with their keys and signatures, ready
    /// for aggregate signing.
    pub(crate) fn find_strong_quorum_for(&self, key: &ChainKey) -> Option<QuorumResult> {
        let support = self.chain_support.get(key)?;
        if !support.has_strong_quorum {
            return None;
        }

        // Walk signers in power table order. Entries are ordered by
        // decreasing power, so the first subset crossing the threshold is
        // the smallest.
        let mut signers: Vec<usize> = support
            .signatures
            .keys()
            .map(|id| {
                self.power_table
                    .index_of(*id)
                    .expect("vote from actor outside power table")
            })
            .collect();
        signers.sort_unstable();

        let mut pub_keys = Vec::with_capacity(signers.len());
        let mut signatures = Vec::with_capacity(signers.len());
        let mut accumulated = StoragePower::zero();
        for count in 0..signers.len() {
            let entry = &self.power_table.entries()[signers[count]];
            accumulated += &entry.power;
            pub_keys.push(entry.pub_key.clone());
            signatures.push(support.signatures[&entry.id].clone());
            if is_strong_quorum(&accumulated, self.power_table.total()) {
                signers.truncate(count + 1);
                return Some(QuorumResult {
                    signers,
                    pub_keys,
                    signatures,
                });
            }
        }
        panic!("strong quorum flagged but not reproducible from signatures");
    }

    /// The chains which have reached strong quorum, in descending length
    /// order. Appropriate for the QUALITY phase, where each participant
    /// votes for every prefix of its preferred chain.
    ///
    /// Panics if two chains of the same length have strong quorum: that
    /// violates the adversary assumption and must surface, not be masked.
    pub(crate) fn list_strong_quorum_values(&self) -> Vec<ECChain> {
        let mut with_quorum: Vec<ECChain> = self
            .chain_support
            .values()
            .filter(|cs| cs.has_strong_quorum)
            .map(|cs| cs.chain.clone())
            .collect();
        with_quorum.sort_by(|a, b| b.len().cmp(&a.len()));
        for pair in with_quorum.windows(2) {
            if pair[0].len() == pair[1].len() {
                panic!(
                    "multiple chains of length {} with strong quorum",
                    pair[0].len()
                );
            }
        }
        with_quorum
    }

    /// The single chain with strong quorum, if any. Appropriate for
    /// PREPARE/COMMIT/DECIDE, where each participant casts one vote.
    ///
    /// Panics if more than one chain has strong quorum.
    pub(crate) fn find_strong_quorum_value(&self) -> Option<ECChain> {
        let mut found = None;
        for cs in self.chain_support.values() {
            if cs.has_strong_quorum {
                if found.is_some() {
                    panic!("multiple chains with strong quorum");
                }
                found = Some(cs.chain.clone());
            }
        }
        found
    }
}

/// A minimal strong-quorum subset of signers for one value.
pub(crate) struct QuorumResult {
    /// Indices into the power table, in increasing order.
    pub signers: Vec<usize>,
    pub pub_keys: Vec<PubKey>,
    pub signatures: Vec<Vec<u8>>,
}

impl QuorumResult {
    pub(crate) fn aggregate(&self, verifier: &impl Verifier) -> Result<Vec<u8>, HostError> {
        verifier.aggregate(&self.pub_keys, &self.signatures)
    }

    pub(crate) fn signers_bitfield(&self) -> BitField {
        BitField::try_from_bits(self.signers.iter().map(|&i| i as u64))
            .expect("signer indices are sorted and unique")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granite_types::test_utils::test_chain;
    use granite_types::{PowerEntry, PubKey};

    fn table(powers: &[i64]) -> Arc<PowerTable> {
        let entries = powers
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                PowerEntry::new(i as ActorId, StoragePower::from(p), PubKey::new(vec![i as u8]))
            })
            .collect();
        Arc::new(PowerTable::from_entries(entries).unwrap())
    }

    #[test]
    fn single_vote_reaches_quorum_alone() {
        let mut state = QuorumState::new(table(&[1]));
        let chain = test_chain(&[(0, 1), (1, 2)]);
        state.receive(0, &chain, b"sig");
        assert!(state.has_strong_quorum_for(&chain.key()));
        assert!(state.received_from_strong_quorum());
        assert_eq!(state.find_strong_quorum_value(), Some(chain));
    }

    #[test]
    fn duplicate_sender_is_ignored() {
        let mut state = QuorumState::new(table(&[1, 1, 1]));
        let a = test_chain(&[(0, 1), (1, 2)]);
        let b = test_chain(&[(0, 1), (1, 3)]);
        state.receive(0, &a, b"s0");
        state.receive(0, &a, b"s0-again");
        state.receive(0, &b, b"s0-equivocation");
        assert!(!state.has_strong_quorum_for(&a.key()));
        assert!(!state.has_weak_quorum_for(&b.key()));
        // Total sender power counted once.
        assert!(!state.received_from_strong_quorum());
    }

    #[test]
    fn quorum_crossing() {
        let mut state = QuorumState::new(table(&[1, 1, 1]));
        let chain = test_chain(&[(0, 1), (1, 2)]);
        state.receive(0, &chain, b"s0");
        assert!(!state.has_strong_quorum_for(&chain.key()));
        assert!(!state.has_weak_quorum_for(&chain.key()));
        state.receive(1, &chain, b"s1");
        // 2 of 3: weak but not strong (3·2 == 2·3).
        assert!(state.has_weak_quorum_for(&chain.key()));
        assert!(!state.has_strong_quorum_for(&chain.key()));
        state.receive(2, &chain, b"s2");
        assert!(state.has_strong_quorum_for(&chain.key()));
    }

    #[test]
    fn non_participant_votes_are_ignored() {
        let mut state = QuorumState::new(table(&[1, 1, 1]));
        let chain = test_chain(&[(0, 1)]);
        state.receive(42, &chain, b"sig");
        assert!(!state.has_weak_quorum_for(&chain.key()));
        assert!(!state.received_from_strong_quorum());
    }

    #[test]
    fn each_prefix_counts_independently() {
        let mut state = QuorumState::new(table(&[1, 1, 1]));
        let long = test_chain(&[(0, 1), (1, 2), (2, 3)]);
        let short = long.prefix(1);
        state.receive_each_prefix(0, &long);
        state.receive_each_prefix(1, &long);
        state.receive_each_prefix(2, &short);
        // All three support the short prefix, only two the full chain.
        assert!(state.has_strong_quorum_for(&short.key()));
        assert!(!state.has_strong_quorum_for(&long.key()));
        // Base-only prefix is not a vote.
        assert!(!state.has_weak_quorum_for(&long.prefix(0).key()));

        let values = state.list_strong_quorum_values();
        assert_eq!(values, vec![short]);
    }

    #[test]
    fn minimal_quorum_subset_prefers_high_power() {
        // Powers: actor 0 -> 5, actor 1 -> 2, actor 2 -> 2. Total 9.
        let mut state = QuorumState::new(table(&[5, 2, 2]));
        let chain = test_chain(&[(0, 1)]);
        state.receive(1, &chain, b"s1");
        state.receive(2, &chain, b"s2");
        state.receive(0, &chain, b"s0");
        let quorum = state.find_strong_quorum_for(&chain.key()).unwrap();
        // 5 + 2 > 6 already: the third signature is unnecessary.
        assert_eq!(quorum.signers, vec![0, 1]);
        assert_eq!(quorum.signatures, vec![b"s0".to_vec(), b"s1".to_vec()]);
        let bits: Vec<u64> = quorum.signers_bitfield().iter().map(|b| b as u64).collect();
        assert_eq!(bits, vec![0, 1]);
    }

    #[test]
    fn first_justification_wins() {
        let mut state = QuorumState::new(table(&[1]));
        let chain = test_chain(&[(0, 1)]);
        let make = |sig: &[u8]| Justification {
            vote: granite_types::Payload::new(0, 0, granite_types::Phase::Commit, chain.clone()),
            signers: BitField::try_from_bits([0u64]).unwrap(),
            signature: sig.to_vec(),
        };
        state.receive_justification(&chain, &make(b"first"));
        state.receive_justification(&chain, &make(b"second"));
        assert_eq!(
            state.justification_for(&chain.key()).unwrap().signature,
            b"first".to_vec()
        );
    }

    #[test]
    #[should_panic(expected = "multiple chains of length")]
    fn same_length_quorum_values_panic() {
        // Two disjoint singleton-power quorums cannot arise honestly; force
        // the state by hand with full-power votes for two distinct chains of
        // equal length from distinct strong-quorum sender sets.
        let mut state = QuorumState::new(table(&[1]));
        let a = test_chain(&[(0, 1)]);
        let b = test_chain(&[(0, 2)]);
        state.receive(0, &a, b"sa");
        // Second chain support forged via prefix path to bypass sender dedup
        // is not possible through the public API; simulate the assumption
        // violation directly.
        state.senders.remove(&0);
        state.receive(0, &b, b"sb");
        state.list_strong_quorum_values();
    }
}
