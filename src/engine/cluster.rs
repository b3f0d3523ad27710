//! Cluster runner — spawns one worker task per rank and joins them
//!
//! The first failing worker aborts the whole group.

use super::{RunSummary, Worker, WorkerOutcome};
use crate::agent::{build_adapter, Policy};
use crate::config::RunConfig;
use crate::error::{EvoError, Result};
use crate::network::local_group;
use log::{error, info};
use std::time::Instant;
use tokio::task::JoinSet;

/// Run a whole configuration with policy `P` on an in-process worker group
pub async fn run_cluster<P: Policy>(config: RunConfig) -> Result<RunSummary> {
    config.validate()?;
    let started = Instant::now();

    let adapters = (0..config.workers)
        .map(|rank| build_adapter::<P>(&config, rank))
        .collect::<Result<Vec<_>>>()?;

    info!(
        "{} / {}: population {}, generations {}..{}, protocol {}, {} workers",
        config.env,
        config.agent,
        config.population_size,
        config.elapsed_generations,
        config.final_generation(),
        config.protocol,
        config.workers
    );

    let mut tasks = JoinSet::new();
    for (comm, adapter) in local_group(config.workers).into_iter().zip(adapters) {
        let worker = Worker::new(comm, adapter, config.clone())?;
        tasks.spawn(worker.run());
    }

    let mut outcomes: Vec<WorkerOutcome> = Vec::with_capacity(config.workers);
    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok(Ok(outcome)) => {
                outcomes.push(outcome);
                continue;
            }
            Ok(Err(e)) => e,
            Err(join_error) => EvoError::comm(format!("worker task failed: {}", join_error)),
        };
        error!("aborting run: {}", failure);
        tasks.abort_all();
        return Err(failure);
    }

    outcomes.sort_by_key(|o| o.report.rank);
    let mut coordinator = None;
    let mut reports = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        if outcome.coordinator.is_some() {
            coordinator = outcome.coordinator;
        }
        reports.push(outcome.report);
    }
    let coordinator =
        coordinator.ok_or_else(|| EvoError::comm("coordinator finished without its state"))?;

    info!(
        "run finished at generation {} in {:.2}s",
        config.final_generation(),
        started.elapsed().as_secs_f64()
    );
    Ok(coordinator.into_summary(reports))
}
