//! SeedGenerator — per-generation mutation seeds honoring elitism

use super::NO_MUTATION;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Produces one mutation seed per member for every generation
#[derive(Debug, Clone)]
pub struct SeedGenerator {
    population_size: usize,
    elitism: usize,
}

impl SeedGenerator {
    pub fn new(population_size: usize, elitism: usize) -> Self {
        Self {
            population_size,
            elitism,
        }
    }

    pub fn elitism(&self) -> usize {
        self.elitism
    }

    /// Seeds for `generation`, in ascending-rank row order.
    ///
    /// Generation 0 mutates every member. Later generations leave the last
    /// `elitism` rows (the best performers) at [`NO_MUTATION`].
    pub fn generate(&self, generation: u64) -> Vec<u32> {
        let mut rng = StdRng::seed_from_u64(generation);
        let frozen = if generation == 0 { 0 } else { self.elitism };
        let mutated = self.population_size - frozen;

        let mut seeds: Vec<u32> = (0..mutated).map(|_| rng.gen_range(1..=u32::MAX)).collect();
        seeds.resize(self.population_size, NO_MUTATION);
        seeds
    }
}
