//! Agent/environment adapters — what the engine evolves and how it is scored
//!
//! The engine never looks inside a genome. It only asks an [`Adapter`] to
//! build one from a seed lineage, extend it by one seed, evaluate it, and
//! encode it for transfer between workers.

mod policy;
mod registry;
mod task;

pub use policy::{LinearGenome, LinearPolicy, MlpGenome, MlpPolicy, MUTATION_STEP};
pub use registry::{build_adapter, build_task, launch, AGENTS, ENVIRONMENTS};
pub use task::{RegressionTask, SphereTask};

use crate::config::RunConfig;
use crate::error::{EvoError, Result};
use crate::seed::NO_MUTATION;
use log::warn;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Leading bytes of every encoded genome
const WIRE_MAGIC: &[u8; 4] = b"EVSD";

/// An agent architecture: a genome type plus its mutation and forward pass
pub trait Policy: Sized + Send + Sync + 'static {
    type Genome: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Registry name
    const ID: &'static str;
    /// Bumped whenever the encoded genome layout changes
    const FORMAT_VERSION: u16;
    /// Additional-argument keys this policy reads
    const OPTIONS: &'static [&'static str];

    fn from_config(config: &RunConfig, input_dim: usize, output_dim: usize) -> Result<Self>;

    /// The genome before any seed is applied
    fn initialize(&self) -> Self::Genome;

    /// Apply one mutation drawing only from `rng`
    fn mutate(&self, genome: &mut Self::Genome, rng: &mut StdRng);

    fn act(&self, genome: &Self::Genome, observation: &DVector<f64>) -> DVector<f64>;
}

/// A scoring task; higher fitness is better
pub trait Task: Send + Sync {
    fn id(&self) -> &'static str;

    fn input_dim(&self) -> usize;

    fn output_dim(&self) -> usize;

    /// Score a policy on episodes seeded from `generation` only
    fn evaluate(&self, act: &mut dyn FnMut(&DVector<f64>) -> DVector<f64>, generation: u64) -> f64;
}

/// Where an adapter instance lives in the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub rank: usize,
    pub world_size: usize,
    pub use_gpu: bool,
    /// Device this worker should use, `rank % device_count`; `None` on CPU
    pub device: Option<usize>,
}

impl AdapterContext {
    pub fn new(rank: usize, world_size: usize, use_gpu: bool, device_count: usize) -> Self {
        Self {
            rank,
            world_size,
            use_gpu,
            device: use_gpu.then(|| rank % device_count.max(1)),
        }
    }
}

/// One worker's view of a policy evaluated on a task
pub struct Adapter<P: Policy> {
    policy: P,
    task: Box<dyn Task>,
    context: AdapterContext,
}

impl<P: Policy> Adapter<P> {
    pub fn new(policy: P, task: Box<dyn Task>, context: AdapterContext) -> Self {
        if let Some(device) = context.device {
            warn!(
                "rank {}: GPU use requested (device {}) but '{}' runs on CPU",
                context.rank,
                device,
                P::ID
            );
        }
        Self {
            policy,
            task,
            context,
        }
    }

    pub fn context(&self) -> &AdapterContext {
        &self.context
    }

    /// Replay a whole lineage from the initial genome
    pub fn build(&self, seeds: &[u32]) -> Result<P::Genome> {
        let mut genome = self.policy.initialize();
        for &seed in seeds {
            self.extend(&mut genome, seed)?;
        }
        Ok(genome)
    }

    /// Apply exactly one mutation; [`NO_MUTATION`] leaves the genome untouched
    pub fn extend(&self, genome: &mut P::Genome, seed: u32) -> Result<()> {
        if seed == NO_MUTATION {
            return Ok(());
        }
        let mut rng = StdRng::seed_from_u64(u64::from(seed));
        self.policy.mutate(genome, &mut rng);
        Ok(())
    }

    pub fn evaluate(&self, genome: &P::Genome, generation: u64) -> Result<f64> {
        let policy = &self.policy;
        let mut act = |obs: &DVector<f64>| policy.act(genome, obs);
        let fitness = self.task.evaluate(&mut act, generation);
        if !fitness.is_finite() {
            return Err(EvoError::agent(format!(
                "task '{}' produced non-finite fitness {} at generation {}",
                self.task.id(),
                fitness,
                generation
            )));
        }
        Ok(fitness)
    }

    /// Encode as `magic | format version (u16 LE) | id length | id | JSON body`
    pub fn serialize(&self, genome: &P::Genome) -> Result<Vec<u8>> {
        let id = P::ID.as_bytes();
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(WIRE_MAGIC);
        out.extend_from_slice(&P::FORMAT_VERSION.to_le_bytes());
        out.push(id.len() as u8);
        out.extend_from_slice(id);
        serde_json::to_writer(&mut out, genome)?;
        Ok(out)
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<P::Genome> {
        let header = WIRE_MAGIC.len() + 3;
        if bytes.len() < header || &bytes[..4] != WIRE_MAGIC {
            return Err(EvoError::agent("genome payload has no evoseed header"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != P::FORMAT_VERSION {
            return Err(EvoError::agent(format!(
                "genome format v{} but '{}' reads v{}",
                version,
                P::ID,
                P::FORMAT_VERSION
            )));
        }
        let id_len = bytes[6] as usize;
        let id = bytes
            .get(header..header + id_len)
            .ok_or_else(|| EvoError::agent("genome payload truncated"))?;
        if id != P::ID.as_bytes() {
            return Err(EvoError::agent(format!(
                "genome encoded by '{}' cannot be read by '{}'",
                String::from_utf8_lossy(id),
                P::ID
            )));
        }
        Ok(serde_json::from_slice(&bytes[header + id_len..])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_adapter() -> Adapter<LinearPolicy> {
        let config = RunConfig::new("sphere", "linear", 4, 1);
        build_adapter::<LinearPolicy>(&config, 0).unwrap()
    }

    #[test]
    fn test_build_replays_extend() {
        let adapter = linear_adapter();
        let seeds = [11, 0, 29, 3];
        let built = adapter.build(&seeds).unwrap();

        let mut extended = adapter.build(&[]).unwrap();
        for &s in &seeds {
            adapter.extend(&mut extended, s).unwrap();
        }
        assert_eq!(built, extended);
    }

    #[test]
    fn test_zero_seed_is_noop() {
        let adapter = linear_adapter();
        let mut genome = adapter.build(&[5]).unwrap();
        let before = genome.clone();
        adapter.extend(&mut genome, NO_MUTATION).unwrap();
        assert_eq!(genome, before);
    }

    #[test]
    fn test_serialize_roundtrip_exact() {
        let adapter = linear_adapter();
        let genome = adapter.build(&[1, 2, 3]).unwrap();
        let bytes = adapter.serialize(&genome).unwrap();
        let back = adapter.deserialize(&bytes).unwrap();
        assert_eq!(back, genome);
        assert_eq!(adapter.serialize(&back).unwrap(), bytes);
    }

    #[test]
    fn test_deserialize_rejects_foreign_payloads() {
        let adapter = linear_adapter();
        assert!(adapter.deserialize(b"nope").is_err());

        let config = RunConfig::new("sphere", "mlp", 4, 1);
        let mlp = build_adapter::<MlpPolicy>(&config, 0).unwrap();
        let bytes = mlp.serialize(&mlp.build(&[7]).unwrap()).unwrap();
        assert!(matches!(adapter.deserialize(&bytes), Err(EvoError::Agent(_))));
    }

    #[test]
    fn test_evaluate_deterministic() {
        let adapter = linear_adapter();
        let genome = adapter.build(&[42, 43]).unwrap();
        let a = adapter.evaluate(&genome, 3).unwrap();
        let b = adapter.evaluate(&genome, 3).unwrap();
        assert_eq!(a, b);
    }

    struct Unbounded(f64);

    impl Task for Unbounded {
        fn id(&self) -> &'static str {
            "unbounded"
        }

        fn input_dim(&self) -> usize {
            2
        }

        fn output_dim(&self) -> usize {
            2
        }

        fn evaluate(&self, _act: &mut dyn FnMut(&DVector<f64>) -> DVector<f64>, _generation: u64) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_evaluate_rejects_non_finite_fitness() {
        let config = RunConfig::new("sphere", "linear", 4, 1);
        for fitness in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let policy = LinearPolicy::from_config(&config, 2, 2).unwrap();
            let adapter = Adapter::new(
                policy,
                Box::new(Unbounded(fitness)),
                AdapterContext::new(0, 1, false, 1),
            );
            let genome = adapter.build(&[1]).unwrap();
            assert!(matches!(adapter.evaluate(&genome, 0), Err(EvoError::Agent(_))));
        }
    }

    #[test]
    fn test_device_follows_rank() {
        assert_eq!(AdapterContext::new(5, 8, true, 2).device, Some(1));
        assert_eq!(AdapterContext::new(5, 8, true, 1).device, Some(0));
        assert_eq!(AdapterContext::new(5, 8, false, 2).device, None);
    }
}
