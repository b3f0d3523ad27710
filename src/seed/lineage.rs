//! Lineage — the P × G seed matrix and its fitness history
//!
//! Row i is the lineage of the member in slot i (or of rank i while the
//! coordinator is mid-selection). Every row always holds exactly one seed per
//! elapsed generation.

use serde::{Deserialize, Serialize};

/// Seed lineages for the whole population
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageMatrix {
    rows: Vec<Vec<u32>>,
}

impl LineageMatrix {
    /// Empty lineages for a population that has not started yet
    pub fn new(population_size: usize) -> Self {
        Self {
            rows: vec![Vec::new(); population_size],
        }
    }

    /// Rebuild from persisted rows; `None` if the rows are ragged
    pub fn from_rows(rows: Vec<Vec<u32>>) -> Option<Self> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != width) {
            return None;
        }
        Some(Self { rows })
    }

    pub fn population_size(&self) -> usize {
        self.rows.len()
    }

    /// Number of elapsed generations recorded
    pub fn generations(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }

    pub fn row(&self, index: usize) -> &[u32] {
        &self.rows[index]
    }

    pub fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }

    /// Contiguous rows owned by one worker
    pub fn batch(&self, start: usize, len: usize) -> &[Vec<u32>] {
        &self.rows[start..start + len]
    }

    /// The newest seed of every row
    pub fn last_column(&self) -> Vec<u32> {
        self.rows
            .iter()
            .map(|r| r.last().copied().unwrap_or(0))
            .collect()
    }

    /// Append one generation's seeds, one per row
    pub fn append_column(&mut self, seeds: &[u32]) {
        assert_eq!(seeds.len(), self.rows.len(), "one seed per lineage");
        for (row, &seed) in self.rows.iter_mut().zip(seeds) {
            row.push(seed);
        }
    }

    /// Reorder rows so that row i becomes the old row `order[i]`
    pub fn permute(&mut self, order: &[usize]) {
        assert_eq!(order.len(), self.rows.len(), "permutation length");
        let old = std::mem::take(&mut self.rows);
        self.rows = order.iter().map(|&j| old[j].clone()).collect();
    }

    /// Overwrite the bottom half of rows with copies of the top half
    pub fn truncate_bottom_half(&mut self) {
        let half = self.rows.len() / 2;
        for i in 0..half {
            self.rows[i] = self.rows[half + i].clone();
        }
    }

    pub fn into_rows(self) -> Vec<Vec<u32>> {
        self.rows
    }
}

/// Per-slot fitness recorded every generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessHistory {
    rows: Vec<Vec<f64>>,
}

impl FitnessHistory {
    pub fn new(population_size: usize) -> Self {
        Self {
            rows: vec![Vec::new(); population_size],
        }
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Option<Self> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != width) {
            return None;
        }
        Some(Self { rows })
    }

    pub fn generations(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn append_column(&mut self, fitness: &[f64]) {
        assert_eq!(fitness.len(), self.rows.len(), "one fitness per slot");
        for (row, &f) in self.rows.iter_mut().zip(fitness) {
            row.push(f);
        }
    }

    /// Fitness of every slot in generation `generation` (0-based column)
    pub fn column(&self, generation: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r[generation]).collect()
    }

    pub fn into_rows(self) -> Vec<Vec<f64>> {
        self.rows
    }
}
