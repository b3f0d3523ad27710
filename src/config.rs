//! Run configuration — everything fixed before the first generation starts
//!
//! A `RunConfig` is validated once, before any state is built. Invalid
//! population sizes, elitism, or save frequencies are fatal.

use crate::error::{EvoError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default root directory for checkpoint shards
pub const DEFAULT_STATE_DIR: &str = "data/states";

/// Default magnitude of the fitness tie-break perturbation
pub const DEFAULT_TIE_BREAK_EPSILON: f64 = 1e-4;

/// Inter-worker communication protocol, fixed for the lifetime of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Coordinator scatters full lineages; workers rebuild every generation
    #[serde(rename = "ps")]
    Centralized,
    /// Resident genomes, newest seed only, peer exchange for selection
    #[serde(rename = "ps_p2p")]
    PeerToPeer,
    /// Peer exchange with per-worker checkpoint shards
    #[serde(rename = "big_ps_p2p")]
    BigPeerToPeer,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [
        Protocol::Centralized,
        Protocol::PeerToPeer,
        Protocol::BigPeerToPeer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Centralized => "ps",
            Protocol::PeerToPeer => "ps_p2p",
            Protocol::BigPeerToPeer => "big_ps_p2p",
        }
    }

    /// Whether live genomes stay resident and move between workers
    pub fn is_peer_to_peer(&self) -> bool {
        !matches!(self, Protocol::Centralized)
    }

    /// Number of checkpoint shards a run with `world_size` workers writes
    pub fn expected_shards(&self, world_size: usize) -> usize {
        match self {
            Protocol::BigPeerToPeer => world_size,
            _ => 1,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = EvoError;

    fn from_str(s: &str) -> Result<Self> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                EvoError::config(format!(
                    "unknown communication protocol '{}' (expected ps, ps_p2p or big_ps_p2p)",
                    s
                ))
            })
    }
}

/// Elitism as given on the command line: a fraction of the population or a
/// count of members
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Elitism {
    Fraction(f64),
    Count(usize),
}

impl Default for Elitism {
    fn default() -> Self {
        Elitism::Count(0)
    }
}

impl FromStr for Elitism {
    type Err = EvoError;

    /// Values below 1 are fractions, anything else must be a whole count
    fn from_str(s: &str) -> Result<Self> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| EvoError::config(format!("elitism '{}' is not a number", s)))?;
        if !value.is_finite() || value < 0.0 {
            return Err(EvoError::config("elitism must not be < 0"));
        }
        if value < 1.0 {
            return Ok(Elitism::Fraction(value));
        }
        if value.fract() != 0.0 {
            return Err(EvoError::config(format!(
                "elitism {} is neither a fraction in [0, 0.5] nor a whole count",
                value
            )));
        }
        Ok(Elitism::Count(value as usize))
    }
}

impl Elitism {
    /// Resolve to a member count for a population of `population_size`
    pub fn resolve(&self, population_size: usize) -> Result<usize> {
        match *self {
            Elitism::Fraction(f) => {
                if !(0.0..=0.5).contains(&f) {
                    return Err(EvoError::config("elitism fraction must lie in [0, 0.5]"));
                }
                Ok((f * population_size as f64) as usize)
            }
            Elitism::Count(n) => {
                if n > population_size / 2 {
                    return Err(EvoError::config(format!(
                        "elitism {} exceeds half the population ({})",
                        n,
                        population_size / 2
                    )));
                }
                Ok(n)
            }
        }
    }
}

/// Complete configuration of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Environment (task) identity, resolved through the registry
    pub env: String,
    /// Agent (architecture) identity, resolved through the registry
    pub agent: String,
    /// Number of members; even and divisible by `workers`
    pub population_size: usize,
    /// Generations already run by the checkpoint being resumed (0 = fresh)
    pub elapsed_generations: u64,
    /// Generations to run now
    pub generations: u64,
    pub elitism: Elitism,
    /// Save every N generations; 0 saves only at the end
    pub save_frequency: u64,
    pub protocol: Protocol,
    /// Size of the worker group
    pub workers: usize,
    pub enable_gpu_use: bool,
    /// Devices shared round-robin by workers when GPU use is on
    pub device_count: usize,
    /// Free-form environment/agent options
    pub additional_arguments: BTreeMap<String, Value>,
    pub state_dir: PathBuf,
    pub tie_break_epsilon: f64,
}

impl RunConfig {
    pub fn new(
        env: impl Into<String>,
        agent: impl Into<String>,
        population_size: usize,
        generations: u64,
    ) -> Self {
        Self {
            env: env.into(),
            agent: agent.into(),
            population_size,
            elapsed_generations: 0,
            generations,
            elitism: Elitism::default(),
            save_frequency: 0,
            protocol: Protocol::PeerToPeer,
            workers: 1,
            enable_gpu_use: false,
            device_count: 1,
            additional_arguments: BTreeMap::new(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            tie_break_epsilon: DEFAULT_TIE_BREAK_EPSILON,
        }
    }

    /// Check every invariant that must hold before state is built
    pub fn validate(&self) -> Result<()> {
        let p = self.population_size;
        if p == 0 || p % 2 != 0 {
            return Err(EvoError::config(format!(
                "population size must be a positive even number, got {}",
                p
            )));
        }
        if self.workers == 0 {
            return Err(EvoError::config("worker count must be at least 1"));
        }
        if p % self.workers != 0 {
            return Err(EvoError::config(format!(
                "population size {} must be a multiple of the worker count {}",
                p, self.workers
            )));
        }
        self.elitism.resolve(p)?;
        if self.save_frequency > self.generations {
            return Err(EvoError::config(format!(
                "save frequency must lie in [0, {}], got {}",
                self.generations, self.save_frequency
            )));
        }
        if !self.tie_break_epsilon.is_finite() || self.tie_break_epsilon < 0.0 {
            return Err(EvoError::config("tie-break epsilon must be finite and >= 0"));
        }
        if self.device_count == 0 {
            return Err(EvoError::config("device count must be at least 1"));
        }
        self.config_tokens()?;
        Ok(())
    }

    pub fn elitism_count(&self) -> Result<usize> {
        self.elitism.resolve(self.population_size)
    }

    /// Members owned by each worker
    pub fn batch_size(&self) -> usize {
        self.population_size / self.workers
    }

    /// Generation number reached when this run finishes
    pub fn final_generation(&self) -> u64 {
        self.elapsed_generations + self.generations
    }

    /// Ascending generation numbers at which state is persisted
    pub fn save_points(&self) -> BTreeSet<u64> {
        let mut points = BTreeSet::new();
        points.insert(self.final_generation());
        if self.save_frequency > 0 {
            for k in 1..=(self.generations / self.save_frequency) {
                points.insert(self.elapsed_generations + self.save_frequency * k);
            }
        }
        points
    }

    /// Sorted `key=value` tokens joined by `~`; a lone `~` when empty.
    ///
    /// The result is a single path component, so separators and `..` are
    /// rejected.
    pub fn config_tokens(&self) -> Result<String> {
        if self.additional_arguments.is_empty() {
            return Ok("~".to_string());
        }
        let mut tokens = Vec::with_capacity(self.additional_arguments.len());
        for (k, v) in &self.additional_arguments {
            let token = match v {
                Value::String(s) => format!("{}={}", k, s),
                other => format!("{}={}", k, other),
            };
            if token.contains(['/', '\\']) || token.contains("..") {
                return Err(EvoError::config(format!(
                    "additional argument '{}' cannot be used in a state path",
                    token
                )));
            }
            tokens.push(token);
        }
        Ok(tokens.join("~"))
    }
}

/// Parse additional arguments given inline as JSON or as a path to a `.json` file
pub fn parse_additional_arguments(raw: &str) -> Result<BTreeMap<String, Value>> {
    let text = if Path::new(raw).extension().is_some_and(|ext| ext == "json") {
        std::fs::read_to_string(raw)?
    } else {
        raw.to_string()
    };
    match serde_json::from_str::<Value>(&text)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(EvoError::config(format!(
            "additional arguments must be a JSON object, got {}",
            other
        ))),
    }
}
