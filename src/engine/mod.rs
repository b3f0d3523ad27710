//! Engine — the generational loop every worker runs
//!
//! Each generation follows the same barrier on every protocol:
//! distribution (lineages or slot instructions) → local build/extend and
//! evaluation → fitness collection at the coordinator → ranking, reorder and
//! truncation → checkpoint at save points.
//!
//! Only rank 0 owns lineage and fitness arrays. Every rank owns its own
//! genome batch and nothing else.

mod cluster;

pub use cluster::run_cluster;

use crate::agent::{Adapter, Policy};
use crate::config::{Protocol, RunConfig};
use crate::error::{EvoError, Result};
use crate::network::{exchange_genomes, plan_exchange, Communicator, SlotInstruction, SlotReport};
use crate::seed::{perturb, FitnessHistory, LineageMatrix, Ranking, SeedGenerator};
use crate::storage::{CheckpointManager, ShardParts};
use log::{debug, info};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

const COORDINATOR: usize = 0;

/// Run adapter work on the blocking pool so peer messaging keeps moving
async fn offload<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| EvoError::agent(format!("adapter task failed: {}", e)))?
}

/// Outcome of a whole run, assembled from the coordinator and every worker
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Lineages after the last selection, in ascending-rank order
    pub lineage: LineageMatrix,
    /// Raw fitness per slot and generation
    pub fitness_history: FitnessHistory,
    /// Raw fitness of the last generation run, per slot
    pub final_fitness: Vec<f64>,
    pub workers: Vec<WorkerReport>,
}

/// What one worker did during the run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub rank: usize,
    /// Absolute slots this worker built or extended and evaluated
    pub evaluated_slots: BTreeSet<usize>,
    /// Newest seed applied to each local slot, one entry per generation run
    pub applied_seeds: Vec<Vec<u32>>,
    pub shards_written: Vec<PathBuf>,
}

/// Generation record held by the coordinator
#[derive(Debug, Clone)]
pub(crate) struct CoordinatorState {
    generator: SeedGenerator,
    lineage: LineageMatrix,
    history: FitnessHistory,
    /// Perturbed fitness of the last generation, the keys `ranking` came from
    keys: Vec<f64>,
    /// Serialized genome size per slot; zero under `ps`
    sizes: Vec<u64>,
    ranking: Option<Ranking>,
    started: Instant,
}

impl CoordinatorState {
    fn new(population_size: usize, elitism: usize) -> Self {
        Self {
            generator: SeedGenerator::new(population_size, elitism),
            lineage: LineageMatrix::new(population_size),
            history: FitnessHistory::new(population_size),
            keys: Vec::new(),
            sizes: Vec::new(),
            ranking: None,
            started: Instant::now(),
        }
    }

    /// Rebuild from the bookkeeping parts of a coordinator shard
    fn restore(
        mut self,
        lineage: Vec<Vec<u32>>,
        history: Vec<Vec<f64>>,
        latest: Vec<SlotReport>,
        elapsed: u64,
        shard: PathBuf,
    ) -> Result<Self> {
        let population = self.lineage.population_size();
        let corrupt = |reason: String| EvoError::CheckpointCorrupt {
            path: shard.clone(),
            reason,
        };

        let lineage = LineageMatrix::from_rows(lineage)
            .ok_or_else(|| corrupt("lineage rows have different lengths".into()))?;
        let history = FitnessHistory::from_rows(history)
            .ok_or_else(|| corrupt("fitness history rows have different lengths".into()))?;
        if lineage.population_size() != population
            || history.rows().len() != population
            || latest.len() != population
        {
            return Err(corrupt(format!(
                "saved population does not match the configured {}",
                population
            )));
        }
        if lineage.generations() as u64 != elapsed || history.generations() as u64 != elapsed {
            return Err(corrupt(format!(
                "saved state covers {} generations, expected {}",
                lineage.generations(),
                elapsed
            )));
        }

        self.keys = latest.iter().map(|r| r.fitness).collect();
        self.sizes = latest.iter().map(|r| r.size).collect();
        self.ranking = Some(Ranking::from_keys(&self.keys));
        self.lineage = lineage;
        self.history = history;
        Ok(self)
    }

    /// Append this generation's seeds in rank order, then return rows to
    /// slot order
    fn begin_generation(&mut self, generation: u64) {
        self.started = Instant::now();
        let seeds = self.generator.generate(generation);
        self.lineage.append_column(&seeds);
        if let Some(ranking) = &self.ranking {
            ranking.restore_slot_order(&mut self.lineage);
        }
    }

    fn lineage_batches(&self, workers: usize) -> Vec<Vec<Vec<u32>>> {
        let batch = self.lineage.population_size() / workers;
        (0..workers)
            .map(|w| self.lineage.batch(w * batch, batch).to_vec())
            .collect()
    }

    fn instruction_batches(&self, workers: usize) -> Result<Vec<Vec<SlotInstruction>>> {
        let ranking = self
            .ranking
            .as_ref()
            .ok_or_else(|| EvoError::comm("peer exchange requested before any ranking exists"))?;
        let plan = plan_exchange(ranking, &self.lineage);
        let batch = plan.len() / workers;
        Ok(plan.chunks(batch).map(<[SlotInstruction]>::to_vec).collect())
    }

    /// Rank, reorder and truncate; record raw fitness
    fn finish_generation(&mut self, generation: u64, reports: &[SlotReport], epsilon: f64) {
        let fitness: Vec<f64> = reports.iter().map(|r| r.fitness).collect();
        let keys = perturb(&fitness, generation, epsilon);
        let ranking = Ranking::from_keys(&keys);
        ranking.select(&mut self.lineage);
        self.history.append_column(&fitness);

        let mean = fitness.iter().sum::<f64>() / fitness.len() as f64;
        let max = fitness.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        info!(
            "generation {} ({:.2}s): mean fitness {:.6}, max {:.6}",
            generation + 1,
            self.started.elapsed().as_secs_f64(),
            mean,
            max
        );

        self.keys = keys;
        self.sizes = reports.iter().map(|r| r.size).collect();
        self.ranking = Some(ranking);
    }

    fn latest_reports(&self) -> Vec<SlotReport> {
        self.keys
            .iter()
            .zip(&self.sizes)
            .map(|(&fitness, &size)| SlotReport { fitness, size })
            .collect()
    }

    fn into_summary(self, workers: Vec<WorkerReport>) -> RunSummary {
        let final_fitness = match self.history.generations() {
            0 => Vec::new(),
            g => self.history.column(g - 1),
        };
        RunSummary {
            lineage: self.lineage,
            fitness_history: self.history,
            final_fitness,
            workers,
        }
    }
}

/// What a worker task hands back to the runner
pub(crate) struct WorkerOutcome {
    pub(crate) report: WorkerReport,
    pub(crate) coordinator: Option<CoordinatorState>,
}

/// One member of the worker group
pub(crate) struct Worker<P: Policy> {
    comm: Communicator,
    adapter: Arc<Adapter<P>>,
    config: RunConfig,
    checkpoints: CheckpointManager,
    coordinator: Option<CoordinatorState>,
    /// Resident genomes of the local batch (peer-to-peer protocols only)
    genomes: Vec<P::Genome>,
    /// Encoded form of `genomes`, refreshed after every evaluation
    encoded: Vec<Vec<u8>>,
    report: WorkerReport,
}

impl<P: Policy> Worker<P> {
    pub(crate) fn new(comm: Communicator, adapter: Adapter<P>, config: RunConfig) -> Result<Self> {
        let rank = comm.rank();
        let coordinator = if rank == COORDINATOR {
            Some(CoordinatorState::new(
                config.population_size,
                config.elitism_count()?,
            ))
        } else {
            None
        };
        Ok(Self {
            checkpoints: CheckpointManager::new(&config, rank)?,
            comm,
            adapter: Arc::new(adapter),
            config,
            coordinator,
            genomes: Vec::new(),
            encoded: Vec::new(),
            report: WorkerReport {
                rank,
                ..WorkerReport::default()
            },
        })
    }

    fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn first_slot(&self) -> usize {
        self.rank() * self.config.batch_size()
    }

    pub(crate) async fn run(mut self) -> Result<WorkerOutcome> {
        let elapsed = self.config.elapsed_generations;
        if elapsed > 0 {
            self.restore(elapsed).await?;
        }
        let save_points = self.config.save_points();
        for generation in elapsed..self.config.final_generation() {
            self.run_generation(generation).await?;
            if save_points.contains(&(generation + 1)) {
                self.save(generation + 1).await?;
            }
        }
        Ok(WorkerOutcome {
            report: self.report,
            coordinator: self.coordinator,
        })
    }

    /// Reload state written at the end of generation `elapsed`
    async fn restore(&mut self, elapsed: u64) -> Result<()> {
        let protocol = self.config.protocol;
        let workers = self.config.workers;
        let mut coordinator_genomes = None;

        if let Some(state) = self.coordinator.take() {
            let record = self.checkpoints.load(elapsed)?;
            let shard = self.checkpoints.shard_path(elapsed, self.rank());
            let state = match record.parts {
                ShardParts::Centralized {
                    lineage,
                    fitness_history,
                    latest_fitness,
                } => {
                    let latest = latest_fitness
                        .into_iter()
                        .map(|fitness| SlotReport { fitness, size: 0 })
                        .collect();
                    state.restore(lineage, fitness_history, latest, elapsed, shard)?
                }
                ShardParts::PeerToPeer {
                    lineage,
                    fitness_history,
                    latest,
                    genomes,
                } => {
                    coordinator_genomes = Some(genomes);
                    state.restore(lineage, fitness_history, latest, elapsed, shard)?
                }
                ShardParts::LocalBatch { .. } => {
                    return Err(EvoError::CheckpointProtocolMismatch(
                        "coordinator shard holds no lineage".into(),
                    ))
                }
            };
            self.coordinator = Some(state);
        }

        let batch = match protocol {
            Protocol::Centralized => return Ok(()),
            Protocol::PeerToPeer => {
                let chunks = match coordinator_genomes {
                    Some(all) if all.len() == self.config.population_size => Some(
                        all.chunks(self.config.batch_size())
                            .map(<[Vec<u8>]>::to_vec)
                            .collect::<Vec<_>>(),
                    ),
                    Some(all) => {
                        return Err(EvoError::CheckpointCorrupt {
                            path: self.checkpoints.shard_path(elapsed, COORDINATOR),
                            reason: format!(
                                "{} genomes saved for a population of {}",
                                all.len(),
                                self.config.population_size
                            ),
                        })
                    }
                    None => None,
                };
                self.comm.scatter(chunks, COORDINATOR).await?
            }
            Protocol::BigPeerToPeer => match coordinator_genomes {
                Some(own) => own,
                None => match self.checkpoints.load(elapsed)?.parts {
                    ShardParts::LocalBatch { genomes } => genomes,
                    _ => {
                        return Err(EvoError::CheckpointProtocolMismatch(format!(
                            "rank {} expected a local batch shard",
                            self.rank()
                        )))
                    }
                },
            },
        };

        if batch.len() != self.config.batch_size() {
            return Err(EvoError::CheckpointCorrupt {
                path: self.checkpoints.shard_path(elapsed, self.rank()),
                reason: format!(
                    "{} genomes restored for a batch of {}",
                    batch.len(),
                    self.config.batch_size()
                ),
            });
        }
        self.genomes = batch
            .iter()
            .map(|bytes| self.adapter.deserialize(bytes))
            .collect::<Result<_>>()?;
        self.encoded = batch;
        info!(
            "rank {} resumed {} genomes at generation {} across {} workers",
            self.rank(),
            self.genomes.len(),
            elapsed,
            workers
        );
        Ok(())
    }

    async fn run_generation(&mut self, generation: u64) -> Result<()> {
        let workers = self.config.workers;
        if let Some(state) = self.coordinator.as_mut() {
            state.begin_generation(generation);
        }

        let reports = if self.config.protocol == Protocol::Centralized || generation == 0 {
            let chunks = self.coordinator.as_ref().map(|s| s.lineage_batches(workers));
            let rows: Vec<Vec<u32>> = self.comm.scatter(chunks, COORDINATOR).await?;
            self.build_batch(rows, generation).await?
        } else {
            let local_max = self.encoded.iter().map(|e| e.len() as u64).max().unwrap_or(0);
            let buffer_size = self.comm.all_reduce_max(local_max).await?;
            let chunks = self
                .coordinator
                .as_ref()
                .map(|s| s.instruction_batches(workers))
                .transpose()?;
            let instructions: Vec<SlotInstruction> =
                self.comm.scatter(chunks, COORDINATOR).await?;
            self.exchange_and_extend(&instructions, buffer_size as usize, generation)
                .await?
        };

        let gathered = self.comm.gather(reports, COORDINATOR).await?;
        if let (Some(state), Some(gathered)) = (self.coordinator.as_mut(), gathered) {
            let reports: Vec<SlotReport> = gathered.into_iter().flatten().collect();
            state.finish_generation(generation, &reports, self.config.tie_break_epsilon);
        }
        Ok(())
    }

    /// Build every local member from its full lineage and evaluate it
    async fn build_batch(
        &mut self,
        rows: Vec<Vec<u32>>,
        generation: u64,
    ) -> Result<Vec<SlotReport>> {
        let resident = self.config.protocol.is_peer_to_peer();
        let first = self.first_slot();
        let applied: Vec<u32> = rows.iter().map(|row| row.last().copied().unwrap_or(0)).collect();

        let adapter = Arc::clone(&self.adapter);
        let built = offload(move || {
            rows.iter()
                .map(|row| {
                    let genome = adapter.build(row)?;
                    let fitness = adapter.evaluate(&genome, generation)?;
                    let bytes = if resident {
                        Some(adapter.serialize(&genome)?)
                    } else {
                        None
                    };
                    Ok((genome, fitness, bytes))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await?;

        if resident {
            self.genomes.clear();
            self.encoded.clear();
        }
        let mut reports = Vec::with_capacity(built.len());
        for (i, (genome, fitness, bytes)) in built.into_iter().enumerate() {
            let size = match bytes {
                Some(bytes) => {
                    let size = bytes.len() as u64;
                    self.genomes.push(genome);
                    self.encoded.push(bytes);
                    size
                }
                None => 0,
            };
            self.report.evaluated_slots.insert(first + i);
            reports.push(SlotReport { fitness, size });
        }
        self.report.applied_seeds.push(applied);
        Ok(reports)
    }

    /// Swap genomes with paired peers, then apply the newest seed and evaluate
    async fn exchange_and_extend(
        &mut self,
        instructions: &[SlotInstruction],
        buffer_size: usize,
        generation: u64,
    ) -> Result<Vec<SlotReport>> {
        if instructions.len() != self.genomes.len() {
            return Err(EvoError::comm(format!(
                "rank {} holds {} genomes but received {} instructions",
                self.rank(),
                self.genomes.len(),
                instructions.len()
            )));
        }
        let first = self.first_slot();
        let encoded = &self.encoded;
        let received = exchange_genomes(&self.comm, instructions, first, buffer_size, |i| {
            Ok(encoded[i].clone())
        })
        .await?;

        let applied: Vec<u32> = instructions.iter().map(|i| i.seed).collect();
        let seeds = applied.clone();
        let adapter = Arc::clone(&self.adapter);
        let mut genomes = std::mem::take(&mut self.genomes);
        let (genomes, evaluated) = offload(move || {
            let mut evaluated = Vec::with_capacity(genomes.len());
            for ((genome, incoming), seed) in genomes.iter_mut().zip(received).zip(seeds) {
                if let Some(bytes) = incoming {
                    *genome = adapter.deserialize(&bytes)?;
                }
                adapter.extend(genome, seed)?;
                let fitness = adapter.evaluate(genome, generation)?;
                evaluated.push((fitness, adapter.serialize(genome)?));
            }
            Ok((genomes, evaluated))
        })
        .await?;

        self.genomes = genomes;
        let mut reports = Vec::with_capacity(evaluated.len());
        for (i, (fitness, bytes)) in evaluated.into_iter().enumerate() {
            reports.push(SlotReport {
                fitness,
                size: bytes.len() as u64,
            });
            self.encoded[i] = bytes;
            self.report.evaluated_slots.insert(first + i);
        }
        self.report.applied_seeds.push(applied);
        Ok(reports)
    }

    /// Persist the state reached at the end of generation `generation - 1`
    async fn save(&mut self, generation: u64) -> Result<()> {
        let path = match self.config.protocol {
            Protocol::Centralized => match &self.coordinator {
                Some(state) => Some(self.checkpoints.save(
                    generation,
                    ShardParts::Centralized {
                        lineage: state.lineage.rows().to_vec(),
                        fitness_history: state.history.rows().to_vec(),
                        latest_fitness: state.keys.clone(),
                    },
                )?),
                None => None,
            },
            Protocol::PeerToPeer => {
                let gathered = self.comm.gather(self.encoded.clone(), COORDINATOR).await?;
                match (&self.coordinator, gathered) {
                    (Some(state), Some(batches)) => Some(self.checkpoints.save(
                        generation,
                        ShardParts::PeerToPeer {
                            lineage: state.lineage.rows().to_vec(),
                            fitness_history: state.history.rows().to_vec(),
                            latest: state.latest_reports(),
                            genomes: batches.into_iter().flatten().collect(),
                        },
                    )?),
                    _ => None,
                }
            }
            Protocol::BigPeerToPeer => {
                let parts = match &self.coordinator {
                    Some(state) => ShardParts::PeerToPeer {
                        lineage: state.lineage.rows().to_vec(),
                        fitness_history: state.history.rows().to_vec(),
                        latest: state.latest_reports(),
                        genomes: self.encoded.clone(),
                    },
                    None => ShardParts::LocalBatch {
                        genomes: self.encoded.clone(),
                    },
                };
                Some(self.checkpoints.save(generation, parts)?)
            }
        };
        if let Some(path) = path {
            debug!("rank {} checkpoint at {}", self.rank(), path.display());
            self.report.shards_written.push(path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reports(fitness: &[f64]) -> Vec<SlotReport> {
        fitness
            .iter()
            .map(|&fitness| SlotReport { fitness, size: 0 })
            .collect()
    }

    #[test]
    fn test_generation_zero_no_reorder() {
        let mut state = CoordinatorState::new(4, 1);
        state.begin_generation(0);
        assert_eq!(state.lineage.generations(), 1);
        assert!(state.lineage.last_column().iter().all(|&s| s != 0));
        assert!(state.instruction_batches(2).is_err());
    }

    #[test]
    fn test_selection_then_restore() {
        let mut state = CoordinatorState::new(4, 1);
        state.begin_generation(0);
        let before = state.lineage.clone();
        state.finish_generation(0, &reports(&[0.1, 4.0, 2.0, 3.0]), 0.0);

        // rank order: slot 0, 2, 3, 1; bottom half overwritten by top half
        assert_eq!(state.lineage.row(0), before.row(3));
        assert_eq!(state.lineage.row(1), before.row(1));
        assert_eq!(state.lineage.row(2), before.row(3));
        assert_eq!(state.lineage.row(3), before.row(1));
        assert_eq!(state.history.column(0), vec![0.1, 4.0, 2.0, 3.0]);

        state.begin_generation(1);
        // the best slot (1) keeps its lineage and gets the elite zero seed
        assert_eq!(state.lineage.row(1)[0], before.row(1)[0]);
        assert_eq!(state.lineage.row(1)[1], 0);
        // the worst slot (0) now carries its pair's (slot 3) lineage
        assert_eq!(state.lineage.row(0)[0], before.row(3)[0]);
        let zeros = state.lineage.last_column().iter().filter(|&&s| s == 0).count();
        assert_eq!(zeros, 1);
    }

    #[test]
    fn test_instruction_batches_cover_population() {
        let mut state = CoordinatorState::new(8, 0);
        state.begin_generation(0);
        state.finish_generation(0, &reports(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]), 1e-4);
        state.begin_generation(1);
        let batches = state.instruction_batches(4).unwrap();
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.len() == 2));
        let senders = batches.iter().flatten().filter(|i| i.sending).count();
        assert_eq!(senders, 4);
    }

    #[test]
    fn test_restore_rejects_wrong_generation_count() {
        let state = CoordinatorState::new(2, 0);
        let result = state.restore(
            vec![vec![1, 2], vec![3, 4]],
            vec![vec![0.0, 0.0], vec![0.0, 0.0]],
            reports(&[0.0, 1.0]),
            3,
            PathBuf::from("0.json"),
        );
        assert!(matches!(result, Err(EvoError::CheckpointCorrupt { .. })));
    }

    #[test]
    fn test_restore_rebuilds_ranking() {
        let state = CoordinatorState::new(2, 0)
            .restore(
                vec![vec![1], vec![3]],
                vec![vec![0.5], vec![0.25]],
                reports(&[0.5, 0.25]),
                1,
                PathBuf::from("0.json"),
            )
            .unwrap();
        let ranking = state.ranking.unwrap();
        assert_eq!(ranking.sort, vec![1, 0]);
    }
}
