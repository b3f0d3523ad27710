//! Built-in static-parameter policies
//!
//! Genomes start at zero and every mutation adds Gaussian noise of scale
//! [`MUTATION_STEP`] to every parameter, in a fixed iteration order.

use super::Policy;
use crate::config::RunConfig;
use crate::error::{EvoError, Result};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Standard deviation of per-parameter mutation noise
pub const MUTATION_STEP: f64 = 0.01;

const DEFAULT_HIDDEN: usize = 8;

fn perturb_all<'a>(params: impl Iterator<Item = &'a mut f64>, rng: &mut StdRng) {
    for p in params {
        *p += MUTATION_STEP * rng.sample::<f64, _>(StandardNormal);
    }
}

/// Single affine layer: `y = W x + b`
#[derive(Debug, Clone)]
pub struct LinearPolicy {
    input_dim: usize,
    output_dim: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearGenome {
    pub weights: DMatrix<f64>,
    pub bias: DVector<f64>,
}

impl Policy for LinearPolicy {
    type Genome = LinearGenome;

    const ID: &'static str = "linear";
    const FORMAT_VERSION: u16 = 1;
    const OPTIONS: &'static [&'static str] = &[];

    fn from_config(_config: &RunConfig, input_dim: usize, output_dim: usize) -> Result<Self> {
        Ok(Self {
            input_dim,
            output_dim,
        })
    }

    fn initialize(&self) -> LinearGenome {
        LinearGenome {
            weights: DMatrix::zeros(self.output_dim, self.input_dim),
            bias: DVector::zeros(self.output_dim),
        }
    }

    fn mutate(&self, genome: &mut LinearGenome, rng: &mut StdRng) {
        perturb_all(genome.weights.iter_mut(), rng);
        perturb_all(genome.bias.iter_mut(), rng);
    }

    fn act(&self, genome: &LinearGenome, observation: &DVector<f64>) -> DVector<f64> {
        &genome.weights * observation + &genome.bias
    }
}

/// One tanh hidden layer
#[derive(Debug, Clone)]
pub struct MlpPolicy {
    input_dim: usize,
    hidden_dim: usize,
    output_dim: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpGenome {
    pub w1: DMatrix<f64>,
    pub b1: DVector<f64>,
    pub w2: DMatrix<f64>,
    pub b2: DVector<f64>,
}

impl Policy for MlpPolicy {
    type Genome = MlpGenome;

    const ID: &'static str = "mlp";
    const FORMAT_VERSION: u16 = 1;
    const OPTIONS: &'static [&'static str] = &["hidden"];

    fn from_config(config: &RunConfig, input_dim: usize, output_dim: usize) -> Result<Self> {
        let hidden_dim = match config.additional_arguments.get("hidden") {
            None => DEFAULT_HIDDEN,
            Some(v) => v
                .as_u64()
                .filter(|&h| h >= 1)
                .ok_or_else(|| EvoError::config("'hidden' must be an integer >= 1"))?
                as usize,
        };
        Ok(Self {
            input_dim,
            hidden_dim,
            output_dim,
        })
    }

    fn initialize(&self) -> MlpGenome {
        MlpGenome {
            w1: DMatrix::zeros(self.hidden_dim, self.input_dim),
            b1: DVector::zeros(self.hidden_dim),
            w2: DMatrix::zeros(self.output_dim, self.hidden_dim),
            b2: DVector::zeros(self.output_dim),
        }
    }

    fn mutate(&self, genome: &mut MlpGenome, rng: &mut StdRng) {
        perturb_all(genome.w1.iter_mut(), rng);
        perturb_all(genome.b1.iter_mut(), rng);
        perturb_all(genome.w2.iter_mut(), rng);
        perturb_all(genome.b2.iter_mut(), rng);
    }

    fn act(&self, genome: &MlpGenome, observation: &DVector<f64>) -> DVector<f64> {
        let hidden = (&genome.w1 * observation + &genome.b1).map(f64::tanh);
        &genome.w2 * hidden + &genome.b2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_initial_genome_is_zero() {
        let policy = LinearPolicy { input_dim: 3, output_dim: 2 };
        let genome = policy.initialize();
        assert_eq!(genome.weights.shape(), (2, 3));
        assert!(genome.weights.iter().all(|&w| w == 0.0));
    }

    #[test]
    fn test_mutation_is_seeded() {
        let policy = LinearPolicy { input_dim: 3, output_dim: 2 };
        let mut a = policy.initialize();
        let mut b = policy.initialize();
        policy.mutate(&mut a, &mut StdRng::seed_from_u64(9));
        policy.mutate(&mut b, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
        assert!(a.weights.iter().any(|&w| w != 0.0));
        assert!(a.weights.iter().all(|&w| w.abs() < 10.0 * MUTATION_STEP));
    }

    #[test]
    fn test_mutation_noise_scale() {
        let policy = LinearPolicy { input_dim: 40, output_dim: 50 };
        let mut genome = policy.initialize();
        policy.mutate(&mut genome, &mut StdRng::seed_from_u64(3));
        let n = genome.weights.len() as f64;
        let mean = genome.weights.iter().sum::<f64>() / n;
        let std = (genome.weights.iter().map(|w| (w - mean).powi(2)).sum::<f64>() / n).sqrt();
        assert!(mean.abs() < 0.1 * MUTATION_STEP);
        assert!((std - MUTATION_STEP).abs() < 0.1 * MUTATION_STEP);

        let mut other = policy.initialize();
        policy.mutate(&mut other, &mut StdRng::seed_from_u64(4));
        assert_ne!(genome, other);
    }

    #[test]
    fn test_mlp_hidden_from_config() {
        let mut config = RunConfig::new("sphere", "mlp", 4, 1);
        config
            .additional_arguments
            .insert("hidden".into(), serde_json::json!(5));
        let policy = MlpPolicy::from_config(&config, 3, 2).unwrap();
        let genome = policy.initialize();
        assert_eq!(genome.w1.shape(), (5, 3));
        assert_eq!(policy.act(&genome, &DVector::zeros(3)).len(), 2);

        config
            .additional_arguments
            .insert("hidden".into(), serde_json::json!(0));
        assert!(MlpPolicy::from_config(&config, 3, 2).is_err());
    }
}
