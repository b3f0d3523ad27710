//! Checkpoint shards — versioned, checksummed, protocol-aware
//!
//! Layout: `<root>/<env>/<config tokens>/<agent>/<population>/<generation>/<rank>.json`.
//! Each shard file is a one-line header `evoseed-shard v<N> <sha256>` followed
//! by the JSON record the checksum covers.
//!
//! Loading fails fast on any disagreement between what is on disk and the
//! active protocol or worker count; nothing is coerced.

use crate::config::{Protocol, RunConfig};
use crate::error::{EvoError, Result};
use crate::network::SlotReport;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Current shard record layout
pub const SHARD_FORMAT_VERSION: u32 = 1;

const HEADER_PREFIX: &str = "evoseed-shard";

/// Hex-encode genome payloads so shards stay compact and readable
mod hex_genomes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(genomes: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(genomes.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded: Vec<String> = Vec::deserialize(d)?;
        encoded
            .iter()
            .map(|g| hex::decode(g).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// The persisted parts of a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum ShardParts {
    /// Coordinator shard under `ps`
    Centralized {
        lineage: Vec<Vec<u32>>,
        fitness_history: Vec<Vec<f64>>,
        latest_fitness: Vec<f64>,
    },
    /// Coordinator shard under `ps_p2p` (all genomes) or `big_ps_p2p`
    /// (the coordinator's own batch)
    PeerToPeer {
        lineage: Vec<Vec<u32>>,
        fitness_history: Vec<Vec<f64>>,
        latest: Vec<SlotReport>,
        #[serde(with = "hex_genomes")]
        genomes: Vec<Vec<u8>>,
    },
    /// Non-coordinator shard under `big_ps_p2p`
    LocalBatch {
        #[serde(with = "hex_genomes")]
        genomes: Vec<Vec<u8>>,
    },
}

impl ShardParts {
    /// Number of top-level parts: 3, 4, or 1
    pub fn part_count(&self) -> usize {
        match self {
            ShardParts::Centralized { .. } => 3,
            ShardParts::PeerToPeer { .. } => 4,
            ShardParts::LocalBatch { .. } => 1,
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            ShardParts::Centralized { .. } => "Centralized",
            ShardParts::PeerToPeer { .. } => "PeerToPeer",
            ShardParts::LocalBatch { .. } => "LocalBatch",
        }
    }
}

/// Part count a shard written by `rank` must have under `protocol`
fn expected_part_count(protocol: Protocol, rank: usize) -> usize {
    match protocol {
        Protocol::Centralized => 3,
        Protocol::PeerToPeer => 4,
        Protocol::BigPeerToPeer if rank == 0 => 4,
        Protocol::BigPeerToPeer => 1,
    }
}

/// One worker's shard of a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub format_version: u32,
    pub protocol: Protocol,
    pub generation: u64,
    pub world_size: usize,
    pub rank: usize,
    pub saved_at: DateTime<Utc>,
    pub parts: ShardParts,
}

/// Reads and writes this worker's shards for one run
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    run_dir: PathBuf,
    protocol: Protocol,
    rank: usize,
    world_size: usize,
}

impl CheckpointManager {
    pub fn new(config: &RunConfig, rank: usize) -> Result<Self> {
        let run_dir = config
            .state_dir
            .join(&config.env)
            .join(config.config_tokens()?)
            .join(&config.agent)
            .join(config.population_size.to_string());
        Ok(Self {
            run_dir,
            protocol: config.protocol,
            rank,
            world_size: config.workers,
        })
    }

    pub fn generation_dir(&self, generation: u64) -> PathBuf {
        self.run_dir.join(generation.to_string())
    }

    pub fn shard_path(&self, generation: u64, rank: usize) -> PathBuf {
        self.generation_dir(generation).join(format!("{}.json", rank))
    }

    /// Write this worker's shard for `generation`
    pub fn save(&self, generation: u64, parts: ShardParts) -> Result<PathBuf> {
        let record = ShardRecord {
            format_version: SHARD_FORMAT_VERSION,
            protocol: self.protocol,
            generation,
            world_size: self.world_size,
            rank: self.rank,
            saved_at: Utc::now(),
            parts,
        };
        let body = serde_json::to_vec(&record)?;
        let checksum = hex::encode(Sha256::digest(&body));

        let dir = self.generation_dir(generation);
        std::fs::create_dir_all(&dir)?;
        let path = self.shard_path(generation, self.rank);
        let tmp = path.with_extension("json.tmp");

        let mut contents =
            format!("{} v{} {}\n", HEADER_PREFIX, SHARD_FORMAT_VERSION, checksum).into_bytes();
        contents.extend_from_slice(&body);
        std::fs::write(&tmp, &contents)?;
        std::fs::rename(&tmp, &path)?;

        info!(
            "rank {} saved {} shard for generation {} ({} bytes)",
            self.rank,
            record.parts.shape(),
            generation,
            contents.len()
        );
        Ok(path)
    }

    /// Ranks of the shard files present for `generation`
    fn list_shards(&self, dir: &Path) -> Result<Vec<usize>> {
        let mut ranks = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(rank) = name
                .strip_suffix(".json")
                .and_then(|stem| stem.parse::<usize>().ok())
            {
                ranks.push(rank);
            }
        }
        ranks.sort_unstable();
        Ok(ranks)
    }

    /// Read and verify one shard without any protocol checks
    pub fn read_shard(&self, generation: u64, rank: usize) -> Result<ShardRecord> {
        let path = self.shard_path(generation, rank);
        let contents =
            std::fs::read(&path).map_err(|_| EvoError::CheckpointShardMissing(path.clone()))?;
        let corrupt = |reason: String| EvoError::CheckpointCorrupt {
            path: path.clone(),
            reason,
        };

        let split = contents
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| corrupt("missing header line".into()))?;
        let header = std::str::from_utf8(&contents[..split])
            .map_err(|_| corrupt("header is not UTF-8".into()))?;
        let body = &contents[split + 1..];

        let fields: Vec<&str> = header.split_whitespace().collect();
        let expected_version = format!("v{}", SHARD_FORMAT_VERSION);
        match fields.as_slice() {
            [prefix, version, checksum] if *prefix == HEADER_PREFIX => {
                if *version != expected_version {
                    return Err(corrupt(format!(
                        "shard format {} but this build reads {}",
                        version, expected_version
                    )));
                }
                let actual = hex::encode(Sha256::digest(body));
                if actual != *checksum {
                    return Err(corrupt(format!(
                        "checksum mismatch: expected {}, got {}",
                        checksum, actual
                    )));
                }
            }
            _ => return Err(corrupt(format!("unrecognized header '{}'", header))),
        }

        let record: ShardRecord =
            serde_json::from_slice(body).map_err(|e| corrupt(e.to_string()))?;
        if record.generation != generation {
            return Err(corrupt(format!(
                "record is for generation {}, expected {}",
                record.generation, generation
            )));
        }
        Ok(record)
    }

    /// Locate and validate this worker's shard for `generation`
    pub fn load(&self, generation: u64) -> Result<ShardRecord> {
        let dir = self.generation_dir(generation);
        if !dir.is_dir() {
            return Err(EvoError::CheckpointNotFound(dir));
        }
        let shards = self.list_shards(&dir)?;
        if shards.is_empty() {
            return Err(EvoError::CheckpointNotFound(dir));
        }

        match self.protocol {
            Protocol::Centralized | Protocol::PeerToPeer if shards.len() > 1 => {
                return Err(EvoError::CheckpointProtocolMismatch(format!(
                    "active protocol is '{}' but the saved state has {} shards, as written by '{}'",
                    self.protocol,
                    shards.len(),
                    Protocol::BigPeerToPeer
                )));
            }
            Protocol::BigPeerToPeer if shards.len() != self.world_size => {
                if let Ok(coordinator) = self.read_shard(generation, 0) {
                    if coordinator.protocol != Protocol::BigPeerToPeer {
                        return Err(EvoError::CheckpointProtocolMismatch(format!(
                            "active protocol is '{}' but the saved state used '{}'",
                            self.protocol, coordinator.protocol
                        )));
                    }
                }
                return Err(EvoError::CheckpointWorldSizeMismatch {
                    saved: shards.len(),
                    current: self.world_size,
                });
            }
            _ => {}
        }

        let record = self.read_shard(generation, self.rank)?;

        let expected = expected_part_count(self.protocol, self.rank);
        if record.parts.part_count() != expected {
            return Err(EvoError::CheckpointProtocolMismatch(format!(
                "active protocol is '{}' (expects a {}-part record) but the saved state holds a {}-part {} record",
                self.protocol,
                expected,
                record.parts.part_count(),
                record.parts.shape()
            )));
        }
        if record.protocol != self.protocol {
            return Err(EvoError::CheckpointProtocolMismatch(format!(
                "active protocol is '{}' but the saved state used '{}'",
                self.protocol, record.protocol
            )));
        }
        if self.protocol == Protocol::BigPeerToPeer && record.world_size != self.world_size {
            return Err(EvoError::CheckpointWorldSizeMismatch {
                saved: record.world_size,
                current: self.world_size,
            });
        }

        info!(
            "rank {} loaded {} shard for generation {}",
            self.rank,
            record.parts.shape(),
            generation
        );
        Ok(record)
    }
}
