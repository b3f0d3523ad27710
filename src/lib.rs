//! evoseed — distributed seed-lineage evolution
//!
//! Every population member is stored as the list of mutation seeds that
//! produced it. A coordinator draws seeds, ranks fitness and applies
//! truncation selection; workers rebuild or extend genomes and evaluate them,
//! exchanging genomes peer-to-peer where the protocol calls for it.

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod seed;
pub mod storage;

pub use agent::{launch, Adapter, Policy, Task};
pub use config::{Elitism, Protocol, RunConfig};
pub use engine::{run_cluster, RunSummary, WorkerReport};
pub use error::{EvoError, Result};
pub use seed::{FitnessHistory, LineageMatrix, Ranking, SeedGenerator};
pub use storage::CheckpointManager;
