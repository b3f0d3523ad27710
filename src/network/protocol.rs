//! Wire types exchanged between workers each generation
//!
//! Instructions flow from the coordinator to workers, reports flow back.
//! Genome payloads themselves travel as opaque adapter-encoded bytes.

use crate::seed::{LineageMatrix, Ranking};
use serde::{Deserialize, Serialize};

/// Message tag; point-to-point genome transfers are tagged by the sender's
/// absolute slot so concurrent exchanges never cross
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    Collective(u64),
    Slot(usize),
}

/// Per-slot peer-to-peer instruction for one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInstruction {
    /// Slot mirrored across the half-population boundary
    pub pair_slot: usize,
    /// Survivors send their genome, culled slots receive
    pub sending: bool,
    /// Newest lineage seed to apply after the exchange
    pub seed: u32,
}

/// Per-slot outcome reported back to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotReport {
    pub fitness: f64,
    /// Serialized genome size in bytes; zero when genomes never travel
    pub size: u64,
}

/// Build every slot's instruction from last generation's ranking and the
/// slot-ordered lineage that already carries this generation's seeds
pub fn plan_exchange(ranking: &Ranking, lineage: &LineageMatrix) -> Vec<SlotInstruction> {
    lineage
        .last_column()
        .into_iter()
        .enumerate()
        .map(|(slot, seed)| SlotInstruction {
            pair_slot: ranking.pair_of(slot),
            sending: ranking.survives(slot),
            seed,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_exchange() {
        let ranking = Ranking::from_keys(&[0.9, 0.1, 0.5, 0.3]);
        let lineage =
            LineageMatrix::from_rows(vec![vec![7, 0], vec![7, 41], vec![2, 42], vec![2, 43]])
                .unwrap();
        let plan = plan_exchange(&ranking, &lineage);
        assert_eq!(plan.len(), 4);
        // ranks: slot 1 = 0, slot 3 = 1, slot 2 = 2, slot 0 = 3
        assert_eq!(plan[0], SlotInstruction { pair_slot: 3, sending: true, seed: 0 });
        assert_eq!(plan[1], SlotInstruction { pair_slot: 2, sending: false, seed: 41 });
        assert_eq!(plan.iter().filter(|i| i.sending).count(), 2);
    }

    #[test]
    fn test_report_roundtrip() {
        let report = SlotReport { fitness: -0.125, size: 512 };
        let bytes = serde_json::to_vec(&report).unwrap();
        let back: SlotReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, report);
    }
}
