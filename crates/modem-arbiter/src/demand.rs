//! # Demand Registry
//!
//! Outstanding requests for cellular data connectivity. Each demand carries a
//! priority score and an optional subscription affinity. The registry keeps
//! registration order so that equal scores resolve deterministically: the
//! first registered demand wins, on every recomputation.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ids::{DemandId, SubId};

/// A request for data connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDemand {
    pub id: DemandId,
    /// Higher wins.
    pub score: i32,
    /// Subscription the demand must be served on; `None` follows the
    /// preferred data subscription.
    #[serde(default)]
    pub affinity: Option<SubId>,
    /// Restricted demands never cause a modem to become active; they are
    /// served only by a modem already active for another reason.
    #[serde(default)]
    pub restricted: bool,
}

impl NetworkDemand {
    pub fn new(id: DemandId, score: i32) -> Self {
        Self {
            id,
            score,
            affinity: None,
            restricted: false,
        }
    }

    pub fn with_affinity(mut self, sub: SubId) -> Self {
        self.affinity = Some(sub);
        self
    }

    pub fn restricted(mut self) -> Self {
        self.restricted = true;
        self
    }
}

/// Result of [`DemandRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    ScoreUpdated,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct DemandRegistry {
    /// Registration sequence → demand. Iteration order is registration order.
    by_seq: BTreeMap<u64, NetworkDemand>,
    seq_of: HashMap<DemandId, u64>,
    next_seq: u64,
}

impl DemandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a demand, or updates the score of an existing one in place.
    ///
    /// Affinity and the restricted flag are fixed at registration; an update
    /// that tries to change them keeps the original values.
    pub fn upsert(&mut self, demand: NetworkDemand) -> Upsert {
        if let Some(seq) = self.seq_of.get(&demand.id) {
            let Some(existing) = self.by_seq.get_mut(seq) else {
                return Upsert::Unchanged;
            };
            if existing.affinity != demand.affinity || existing.restricted != demand.restricted {
                warn!(
                    demand = %demand.id,
                    "ignoring attempt to change affinity/restriction of a registered demand"
                );
            }
            if existing.score == demand.score {
                return Upsert::Unchanged;
            }
            existing.score = demand.score;
            return Upsert::ScoreUpdated;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq_of.insert(demand.id, seq);
        self.by_seq.insert(seq, demand);
        Upsert::Inserted
    }

    pub fn remove(&mut self, id: DemandId) -> Option<NetworkDemand> {
        let seq = self.seq_of.remove(&id)?;
        self.by_seq.remove(&seq)
    }

    pub fn get(&self, id: DemandId) -> Option<&NetworkDemand> {
        self.seq_of.get(&id).and_then(|seq| self.by_seq.get(seq))
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    /// Demands in evaluation order: descending score, ties by registration.
    pub fn snapshot(&self) -> Vec<NetworkDemand> {
        let mut out: Vec<NetworkDemand> = self.by_seq.values().cloned().collect();
        // Stable sort keeps registration order among equal scores.
        out.sort_by(|a, b| b.score.cmp(&a.score));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_orders_by_score_then_registration() {
        let mut reg = DemandRegistry::new();
        reg.upsert(NetworkDemand::new(DemandId(1), 50));
        reg.upsert(NetworkDemand::new(DemandId(2), 100));
        reg.upsert(NetworkDemand::new(DemandId(3), 50));
        reg.upsert(NetworkDemand::new(DemandId(4), 0));

        let ids: Vec<u64> = reg.snapshot().iter().map(|d| d.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3, 4]);
    }

    #[test]
    fn score_update_keeps_registration_slot() {
        let mut reg = DemandRegistry::new();
        reg.upsert(NetworkDemand::new(DemandId(1), 10));
        reg.upsert(NetworkDemand::new(DemandId(2), 50));
        reg.upsert(NetworkDemand::new(DemandId(3), 50));

        assert_eq!(
            reg.upsert(NetworkDemand::new(DemandId(1), 50)),
            Upsert::ScoreUpdated
        );
        // Demand 1 registered first, so it now leads the tie.
        let ids: Vec<u64> = reg.snapshot().iter().map(|d| d.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn identical_upsert_is_unchanged() {
        let mut reg = DemandRegistry::new();
        assert_eq!(
            reg.upsert(NetworkDemand::new(DemandId(1), 10)),
            Upsert::Inserted
        );
        assert_eq!(
            reg.upsert(NetworkDemand::new(DemandId(1), 10)),
            Upsert::Unchanged
        );
    }

    #[test]
    fn affinity_is_immutable() {
        let mut reg = DemandRegistry::new();
        reg.upsert(NetworkDemand::new(DemandId(1), 10).with_affinity(SubId(2)));
        reg.upsert(NetworkDemand::new(DemandId(1), 20).with_affinity(SubId(3)));
        let d = reg.get(DemandId(1)).unwrap();
        assert_eq!(d.affinity, Some(SubId(2)));
        assert_eq!(d.score, 20);
    }

    #[test]
    fn remove_then_reinsert_goes_to_back() {
        let mut reg = DemandRegistry::new();
        reg.upsert(NetworkDemand::new(DemandId(1), 50));
        reg.upsert(NetworkDemand::new(DemandId(2), 50));
        assert!(reg.remove(DemandId(1)).is_some());
        assert!(reg.remove(DemandId(1)).is_none());
        reg.upsert(NetworkDemand::new(DemandId(1), 50));

        let ids: Vec<u64> = reg.snapshot().iter().map(|d| d.id.0).collect();
        assert_eq!(ids, vec![2, 1]);
    }
}
