//! Selection — fitness ranking and truncation of the lineage matrix
//!
//! Ranking is computed on perturbed fitness so that true ties resolve the
//! same way under every protocol and worker count.

use super::LineageMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Stream selector mixed into the generation number so tie-break draws never
/// coincide with seed generation draws
const TIE_BREAK_STREAM: u64 = 0x7469_6562_7265_616b;

/// Add a deterministic per-slot perturbation of magnitude below `epsilon`.
///
/// NaN fitness ranks below everything else.
pub fn perturb(fitness: &[f64], generation: u64, epsilon: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(generation ^ TIE_BREAK_STREAM);
    fitness
        .iter()
        .map(|&f| {
            let jitter = rng.gen::<f64>() * epsilon;
            if f.is_nan() {
                f64::NEG_INFINITY
            } else {
                f + jitter
            }
        })
        .collect()
}

/// Ascending sort permutation and its inverse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranking {
    /// `sort[r]` is the slot holding rank r
    pub sort: Vec<usize>,
    /// `rank[slot]` is 0 for the worst member, P-1 for the best
    pub rank: Vec<usize>,
}

impl Ranking {
    /// Rank slots by ascending key; equal keys keep slot order
    pub fn from_keys(keys: &[f64]) -> Self {
        let mut sort: Vec<usize> = (0..keys.len()).collect();
        sort.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
        let mut rank = vec![0; keys.len()];
        for (r, &slot) in sort.iter().enumerate() {
            rank[slot] = r;
        }
        Self { sort, rank }
    }

    pub fn len(&self) -> usize {
        self.sort.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sort.is_empty()
    }

    /// Slot mirrored across the half-population boundary: worst pairs with best
    pub fn pair_of(&self, slot: usize) -> usize {
        let p = self.len();
        self.sort[(self.rank[slot] + p / 2) % p]
    }

    /// Whether `slot` survives selection and sends its genome to its pair
    pub fn survives(&self, slot: usize) -> bool {
        self.rank[slot] >= self.len() / 2
    }

    /// Reorder `lineage` into ascending-rank order, then clone the best half
    /// over the worst half
    pub fn select(&self, lineage: &mut LineageMatrix) {
        lineage.permute(&self.sort);
        lineage.truncate_bottom_half();
    }

    /// Put rank-ordered rows back in slot order
    pub fn restore_slot_order(&self, lineage: &mut LineageMatrix) {
        lineage.permute(&self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_bijection(perm: &[usize]) -> bool {
        let mut seen = vec![false; perm.len()];
        for &v in perm {
            if v >= perm.len() || seen[v] {
                return false;
            }
            seen[v] = true;
        }
        true
    }

    #[test]
    fn test_rank_is_bijection() {
        let keys = [3.0, -1.0, 3.0, 7.5, 0.0, 0.0, 2.0, 9.0];
        let ranking = Ranking::from_keys(&keys);
        assert!(is_bijection(&ranking.rank));
        assert!(is_bijection(&ranking.sort));
        for (slot, &r) in ranking.rank.iter().enumerate() {
            assert_eq!(ranking.sort[r], slot);
        }
        assert_eq!(ranking.rank[7], 7);
        assert_eq!(ranking.rank[1], 0);
    }

    #[test]
    fn test_ties_broken_by_perturbation() {
        let raw = vec![1.0; 6];
        let a = perturb(&raw, 3, 1e-4);
        let b = perturb(&raw, 3, 1e-4);
        assert_eq!(a, b);
        assert!(a.iter().all(|&k| (k - 1.0).abs() < 1e-4));
        let ranking = Ranking::from_keys(&a);
        assert!(is_bijection(&ranking.rank));
    }

    #[test]
    fn test_nan_ranks_last() {
        let keys = perturb(&[f64::NAN, 0.0, -5.0, 1.0], 0, 1e-4);
        let ranking = Ranking::from_keys(&keys);
        assert_eq!(ranking.rank[0], 0);
    }

    #[test]
    fn test_pairing_mirrors_halves() {
        let ranking = Ranking::from_keys(&[0.4, 0.1, 0.9, 0.2, 0.7, 0.3]);
        for slot in 0..6 {
            let pair = ranking.pair_of(slot);
            assert_eq!(ranking.pair_of(pair), slot);
            assert_ne!(ranking.survives(slot), ranking.survives(pair));
            assert_eq!(ranking.rank[slot].abs_diff(ranking.rank[pair]), 3);
        }
    }

    #[test]
    fn test_select_clones_best_half() {
        let mut lineage = LineageMatrix::from_rows(vec![
            vec![1, 11],
            vec![2, 22],
            vec![3, 33],
            vec![4, 44],
        ])
        .unwrap();
        // slot 2 worst, slot 0 best
        let ranking = Ranking::from_keys(&[9.0, 5.0, 1.0, 3.0]);
        ranking.select(&mut lineage);
        assert_eq!(lineage.row(2), &[2, 22]);
        assert_eq!(lineage.row(3), &[1, 11]);
        assert_eq!(lineage.row(0), lineage.row(2));
        assert_eq!(lineage.row(1), lineage.row(3));
    }

    #[test]
    fn test_restore_slot_order_follows_pairing() {
        let mut lineage =
            LineageMatrix::from_rows(vec![vec![1], vec![2], vec![3], vec![4]]).unwrap();
        let ranking = Ranking::from_keys(&[9.0, 5.0, 1.0, 3.0]);
        ranking.select(&mut lineage);
        ranking.restore_slot_order(&mut lineage);
        // each slot now carries the lineage its exchange partner would send
        for slot in 0..4 {
            let donor = if ranking.survives(slot) {
                slot
            } else {
                ranking.pair_of(slot)
            };
            assert_eq!(lineage.row(slot), &[donor as u32 + 1]);
        }
    }
}
