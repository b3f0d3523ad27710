//! Seed lineages — the compact genetic record of a population
//!
//! A member is never described by its weights on the coordinator, only by the
//! ordered list of mutation seeds applied to it since generation 0.
//! Replaying that list through an agent reproduces the member exactly.

mod generator;
mod lineage;
mod selection;

pub use generator::SeedGenerator;
pub use lineage::{FitnessHistory, LineageMatrix};
pub use selection::{perturb, Ranking};

/// Seed value that leaves a member unmutated for one generation
pub const NO_MUTATION: u32 = 0;
