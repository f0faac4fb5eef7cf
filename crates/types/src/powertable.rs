//! The weighted participant set for one Granite instance.
//!
//! Entries are held in a canonical order — descending power, ties broken by
//! ascending actor id — which governs the signer indices carried in
//! justification bitfields. A power table is created once per instance and
//! never mutated afterwards.

use crate::{ActorId, PubKey, StoragePower};
use num_traits::Zero;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PowerTableError {
    #[error("duplicate power table entry for actor {0}")]
    DuplicateId(ActorId),
    #[error("non-positive power for actor {0}")]
    NonPositivePower(ActorId),
    #[error("power table entries out of canonical order at index {0}")]
    UnsortedEntries(usize),
}

/// One participant: its id, voting weight, and signing public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerEntry {
    pub id: ActorId,
    pub power: StoragePower,
    pub pub_key: PubKey,
}

impl PowerEntry {
    pub fn new(id: ActorId, power: StoragePower, pub_key: PubKey) -> Self {
        Self { id, power, pub_key }
    }

    /// Canonical ordering: descending power, then ascending id.
    fn canonical_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .power
            .cmp(&self.power)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Ordered, immutable participant set with O(1) lookup by actor id.
#[derive(Clone, Default)]
pub struct PowerTable {
    entries: Vec<PowerEntry>,
    total: StoragePower,
    lookup: HashMap<ActorId, usize>,
}

impl PowerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a power table from entries, sorting them into canonical order.
    pub fn from_entries(entries: Vec<PowerEntry>) -> Result<Self, PowerTableError> {
        let mut table = Self::new();
        table.add(entries)?;
        Ok(table)
    }

    /// Adds entries, maintaining canonical order and the id index.
    pub fn add(&mut self, entries: Vec<PowerEntry>) -> Result<(), PowerTableError> {
        for entry in entries {
            if self.lookup.contains_key(&entry.id) {
                return Err(PowerTableError::DuplicateId(entry.id));
            }
            if entry.power <= StoragePower::zero() {
                return Err(PowerTableError::NonPositivePower(entry.id));
            }
            self.total += &entry.power;
            let pos = self
                .entries
                .binary_search_by(|e| e.canonical_cmp(&entry))
                .unwrap_err();
            self.entries.insert(pos, entry);
        }
        // Rebuild the index: insertion shifts positions.
        self.lookup = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();
        Ok(())
    }

    /// Returns the power and public key for an actor, or `None` if the actor
    /// is not a participant.
    pub fn get(&self, id: ActorId) -> Option<(&StoragePower, &PubKey)> {
        self.lookup
            .get(&id)
            .map(|&i| (&self.entries[i].power, &self.entries[i].pub_key))
    }

    /// Index of an actor in the canonical order, as used in justification
    /// signer bitfields.
    pub fn index_of(&self, id: ActorId) -> Option<usize> {
        self.lookup.get(&id).copied()
    }

    pub fn entries(&self) -> &[PowerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total(&self) -> &StoragePower {
        &self.total
    }

    /// Checks a candidate table: positive powers, unique ids, canonical
    /// order.
    pub fn validate(&self) -> Result<(), PowerTableError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.power <= StoragePower::zero() {
                return Err(PowerTableError::NonPositivePower(entry.id));
            }
            if self.lookup.get(&entry.id) != Some(&i) {
                return Err(PowerTableError::DuplicateId(entry.id));
            }
            if i > 0
                && self.entries[i - 1].canonical_cmp(entry) != std::cmp::Ordering::Less
            {
                return Err(PowerTableError::UnsortedEntries(i));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PowerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PowerTable({} entries, total {})",
            self.entries.len(),
            self.total
        )
    }
}

/// Whether a portion of power is a strong quorum of the total:
/// `3·part > 2·total`. Exact arithmetic; equality is not a quorum.
pub fn is_strong_quorum(part: &StoragePower, total: &StoragePower) -> bool {
    part * 3 > total * 2
}

/// Whether a portion of power is a weak quorum of the total:
/// `3·part > total`.
pub fn is_weak_quorum(part: &StoragePower, total: &StoragePower) -> bool {
    &(part * 3) > total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: ActorId, power: i64) -> PowerEntry {
        PowerEntry::new(id, StoragePower::from(power), PubKey::new(vec![id as u8]))
    }

    #[test]
    fn canonical_order() {
        let table = PowerTable::from_entries(vec![
            entry(3, 10),
            entry(1, 20),
            entry(2, 10),
            entry(4, 30),
        ])
        .unwrap();
        let ids: Vec<ActorId> = table.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 1, 2, 3]);
        assert_eq!(table.total(), &StoragePower::from(70));
        assert!(table.validate().is_ok());
        assert_eq!(table.index_of(2), Some(2));
    }

    #[test]
    fn rejects_duplicate_id() {
        let err = PowerTable::from_entries(vec![entry(1, 10), entry(1, 20)]).unwrap_err();
        assert_eq!(err, PowerTableError::DuplicateId(1));
    }

    #[test]
    fn rejects_non_positive_power() {
        let err = PowerTable::from_entries(vec![entry(1, 0)]).unwrap_err();
        assert_eq!(err, PowerTableError::NonPositivePower(1));
        let err = PowerTable::from_entries(vec![entry(2, -5)]).unwrap_err();
        assert_eq!(err, PowerTableError::NonPositivePower(2));
    }

    #[test]
    fn get_missing_actor() {
        let table = PowerTable::from_entries(vec![entry(1, 10)]).unwrap();
        assert!(table.get(9).is_none());
        assert!(table.index_of(9).is_none());
    }

    #[test]
    fn strong_quorum_threshold_is_strict() {
        let total = StoragePower::from(3);
        // 2/3 exactly is not a strong quorum; 3·2 == 2·3.
        assert!(!is_strong_quorum(&StoragePower::from(2), &total));
        assert!(is_strong_quorum(&StoragePower::from(3), &total));

        let total = StoragePower::from(6);
        assert!(!is_strong_quorum(&StoragePower::from(4), &total));
        assert!(is_strong_quorum(&StoragePower::from(5), &total));
    }

    #[test]
    fn weak_quorum_threshold_is_strict() {
        let total = StoragePower::from(3);
        assert!(!is_weak_quorum(&StoragePower::from(1), &total));
        assert!(is_weak_quorum(&StoragePower::from(2), &total));
    }

    #[test]
    fn singleton_has_strong_quorum() {
        assert!(is_strong_quorum(
            &StoragePower::from(1),
            &StoragePower::from(1)
        ));
    }
}
