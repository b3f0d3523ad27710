//! evoseed CLI — run or resume a distributed seed-lineage evolution
//!
//! Examples:
//!   evoseed -e sphere -b linear -p 64 -g 100 -t 0.1 -f 10
//!   evoseed -e regression -b mlp -p 64 -l 100 -g 50 -c big_ps_p2p -w 4 -a '{"hidden": 16}'

use clap::Parser;
use evoseed_core::config::{
    parse_additional_arguments, Elitism, Protocol, RunConfig, DEFAULT_STATE_DIR,
    DEFAULT_TIE_BREAK_EPSILON,
};
use evoseed_core::launch;
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "evoseed")]
#[command(about = "Distributed generational evolution over seed lineages", version)]
struct Cli {
    /// Environment to score agents on (sphere, regression)
    #[arg(short = 'e', long)]
    env: String,
    /// Agent architecture (linear, mlp)
    #[arg(short = 'b', long)]
    agent: String,
    /// Population size; even and a multiple of the worker count
    #[arg(short = 'p', long)]
    population_size: usize,
    /// Generations already run by the saved state to resume (0 starts fresh)
    #[arg(short = 'l', long, default_value_t = 0)]
    elapsed_generations: u64,
    /// Generations to run now
    #[arg(short = 'g', long)]
    generations: u64,
    /// Elite members kept unmutated: a fraction in [0, 0.5] or a count
    #[arg(short = 't', long, default_value = "0")]
    elitism: Elitism,
    /// Save every N generations; 0 saves only at the end
    #[arg(short = 'f', long, default_value_t = 0)]
    save_frequency: u64,
    /// Communication protocol: ps, ps_p2p or big_ps_p2p
    #[arg(short = 'c', long = "communication", default_value = "ps_p2p")]
    protocol: Protocol,
    /// Number of workers in the group
    #[arg(short = 'w', long, default_value_t = 1)]
    workers: usize,
    /// Let adapters use a GPU (0 or 1)
    #[arg(short = 'u', long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    enable_gpu_use: u8,
    /// Devices to spread ranks over when GPU use is enabled
    #[arg(long, default_value_t = 1)]
    device_count: usize,
    /// Extra environment/agent options, inline JSON or a path to a .json file
    #[arg(short = 'a', long, default_value = "{}")]
    additional_arguments: String,
    /// Root directory for saved states
    #[arg(long, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,
    /// Magnitude of the deterministic fitness tie-break
    #[arg(long, default_value_t = DEFAULT_TIE_BREAK_EPSILON)]
    tie_break_epsilon: f64,
}

impl Cli {
    fn into_config(self) -> evoseed_core::Result<RunConfig> {
        let mut config = RunConfig::new(self.env, self.agent, self.population_size, self.generations);
        config.elapsed_generations = self.elapsed_generations;
        config.elitism = self.elitism;
        config.save_frequency = self.save_frequency;
        config.protocol = self.protocol;
        config.workers = self.workers;
        config.enable_gpu_use = self.enable_gpu_use == 1;
        config.device_count = self.device_count;
        config.additional_arguments = parse_additional_arguments(&self.additional_arguments)?;
        config.state_dir = self.state_dir;
        config.tie_break_epsilon = self.tie_break_epsilon;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match launch(config).await {
        Ok(summary) => {
            let best = summary
                .final_fitness
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            println!(
                "Finished {} generations | best fitness {:.6}",
                summary.lineage.generations(),
                best
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
