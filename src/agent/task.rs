//! Built-in scoring tasks
//!
//! Both tasks draw their hidden target from a fixed seed, so every worker
//! builds the same task, and draw episode inputs from
//! `generation * trials + trial`.

use super::Task;
use crate::config::RunConfig;
use crate::error::{EvoError, Result};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TASK_SEED: u64 = 0x5eed;
const DEFAULT_DIM: usize = 4;
const REGRESSION_OUTPUTS: usize = 2;
const SAMPLES_PER_TRIAL: usize = 8;

fn uniform_vector(rng: &mut StdRng, len: usize) -> DVector<f64> {
    DVector::from_fn(len, |_, _| rng.gen_range(-1.0..1.0))
}

fn positive_arg(config: &RunConfig, key: &str, default: usize) -> Result<usize> {
    match config.additional_arguments.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .filter(|&n| n >= 1)
            .map(|n| n as usize)
            .ok_or_else(|| {
                EvoError::config(format!("'{}' must be an integer >= 1, got {}", key, value))
            }),
    }
}

fn episode_rng(generation: u64, trials: usize, trial: usize) -> StdRng {
    StdRng::seed_from_u64(generation * trials as u64 + trial as u64)
}

/// Reach a hidden target vector from a random observation; fitness is the
/// negative squared distance, averaged over trials
#[derive(Debug, Clone)]
pub struct SphereTask {
    target: DVector<f64>,
    trials: usize,
}

impl SphereTask {
    pub const ID: &'static str = "sphere";
    pub const OPTIONS: &'static [&'static str] = &["dim", "trials"];

    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let dim = positive_arg(config, "dim", DEFAULT_DIM)?;
        let trials = positive_arg(config, "trials", 1)?;
        let mut rng = StdRng::seed_from_u64(TASK_SEED);
        Ok(Self {
            target: uniform_vector(&mut rng, dim),
            trials,
        })
    }
}

impl Task for SphereTask {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn input_dim(&self) -> usize {
        self.target.len()
    }

    fn output_dim(&self) -> usize {
        self.target.len()
    }

    fn evaluate(&self, act: &mut dyn FnMut(&DVector<f64>) -> DVector<f64>, generation: u64) -> f64 {
        let mut total = 0.0;
        for trial in 0..self.trials {
            let mut rng = episode_rng(generation, self.trials, trial);
            let observation = uniform_vector(&mut rng, self.target.len());
            let output = act(&observation);
            total -= (output - &self.target).norm_squared();
        }
        total / self.trials as f64
    }
}

/// Fit a hidden linear map on generation-seeded inputs; fitness is the
/// negative mean squared error
#[derive(Debug, Clone)]
pub struct RegressionTask {
    map: DMatrix<f64>,
    trials: usize,
}

impl RegressionTask {
    pub const ID: &'static str = "regression";
    pub const OPTIONS: &'static [&'static str] = &["dim", "trials"];

    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let dim = positive_arg(config, "dim", DEFAULT_DIM)?;
        let trials = positive_arg(config, "trials", 1)?;
        let mut rng = StdRng::seed_from_u64(TASK_SEED);
        let map = DMatrix::from_fn(REGRESSION_OUTPUTS, dim, |_, _| rng.gen_range(-1.0..1.0));
        Ok(Self { map, trials })
    }
}

impl Task for RegressionTask {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn input_dim(&self) -> usize {
        self.map.ncols()
    }

    fn output_dim(&self) -> usize {
        self.map.nrows()
    }

    fn evaluate(&self, act: &mut dyn FnMut(&DVector<f64>) -> DVector<f64>, generation: u64) -> f64 {
        let mut error = 0.0;
        for trial in 0..self.trials {
            let mut rng = episode_rng(generation, self.trials, trial);
            for _ in 0..SAMPLES_PER_TRIAL {
                let x = uniform_vector(&mut rng, self.input_dim());
                let predicted = act(&x);
                error += (predicted - &self.map * x).norm_squared();
            }
        }
        -error / (self.trials * SAMPLES_PER_TRIAL) as f64
    }
}
