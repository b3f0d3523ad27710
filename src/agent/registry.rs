//! Registry — environment and agent identities resolved once at startup

use super::{Adapter, AdapterContext, LinearPolicy, MlpPolicy, Policy, RegressionTask, SphereTask, Task};
use crate::config::RunConfig;
use crate::engine::{run_cluster, RunSummary};
use crate::error::{EvoError, Result};

/// Environment names accepted by `--env`
pub const ENVIRONMENTS: [&str; 2] = [SphereTask::ID, RegressionTask::ID];

/// Agent names accepted by `--agent`
pub const AGENTS: [&str; 2] = [LinearPolicy::ID, MlpPolicy::ID];

fn task_options(env: &str) -> &'static [&'static str] {
    match env {
        SphereTask::ID => SphereTask::OPTIONS,
        RegressionTask::ID => RegressionTask::OPTIONS,
        _ => &[],
    }
}

fn policy_options(agent: &str) -> &'static [&'static str] {
    match agent {
        id if id == LinearPolicy::ID => LinearPolicy::OPTIONS,
        id if id == MlpPolicy::ID => MlpPolicy::OPTIONS,
        _ => &[],
    }
}

/// Reject additional arguments neither the task nor the policy reads
fn check_options(config: &RunConfig) -> Result<()> {
    let known: Vec<&str> = task_options(&config.env)
        .iter()
        .chain(policy_options(&config.agent))
        .copied()
        .collect();
    match config
        .additional_arguments
        .keys()
        .find(|k| !known.contains(&k.as_str()))
    {
        Some(key) => Err(EvoError::config(format!(
            "'{}' with '{}' does not support additional argument '{}' (accepted: {:?})",
            config.env, config.agent, key, known
        ))),
        None => Ok(()),
    }
}

/// Build the configured task, rejecting unknown names and options
pub fn build_task(config: &RunConfig) -> Result<Box<dyn Task>> {
    let task: Box<dyn Task> = match config.env.as_str() {
        SphereTask::ID => Box::new(SphereTask::from_config(config)?),
        RegressionTask::ID => Box::new(RegressionTask::from_config(config)?),
        other => {
            return Err(EvoError::config(format!(
                "unknown environment '{}' (expected one of {:?})",
                other, ENVIRONMENTS
            )))
        }
    };
    check_options(config)?;
    Ok(task)
}

/// Build one worker's adapter for policy `P`
pub fn build_adapter<P: Policy>(config: &RunConfig, rank: usize) -> Result<Adapter<P>> {
    let task = build_task(config)?;
    let policy = P::from_config(config, task.input_dim(), task.output_dim())?;
    let context = AdapterContext::new(
        rank,
        config.workers,
        config.enable_gpu_use,
        config.device_count,
    );
    Ok(Adapter::new(policy, task, context))
}

/// Validate the configuration and run it with the named agent
pub async fn launch(config: RunConfig) -> Result<RunSummary> {
    config.validate()?;
    build_task(&config)?;
    let agent = config.agent.clone();
    match agent.as_str() {
        id if id == LinearPolicy::ID => run_cluster::<LinearPolicy>(config).await,
        id if id == MlpPolicy::ID => run_cluster::<MlpPolicy>(config).await,
        other => Err(EvoError::config(format!(
            "unknown agent '{}' (expected one of {:?})",
            other, AGENTS
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_environment() {
        let config = RunConfig::new("cart_pole", "linear", 4, 1);
        assert!(matches!(build_task(&config), Err(EvoError::Configuration(_))));
    }

    #[test]
    fn test_unknown_argument_rejected() {
        let mut config = RunConfig::new("sphere", "linear", 4, 1);
        config
            .additional_arguments
            .insert("gravity".into(), serde_json::json!(9.8));
        assert!(build_task(&config).is_err());
    }

    #[test]
    fn test_options_follow_task_and_policy() {
        let mut config = RunConfig::new("sphere", "linear", 4, 1);
        config
            .additional_arguments
            .insert("hidden".into(), serde_json::json!(4));
        assert!(matches!(build_task(&config), Err(EvoError::Configuration(_))));

        config.agent = "mlp".into();
        assert!(build_task(&config).is_ok());

        config
            .additional_arguments
            .insert("trials".into(), serde_json::json!(2));
        assert!(build_task(&config).is_ok());
    }

    #[test]
    fn test_gpu_device_assignment() {
        let mut config = RunConfig::new("sphere", "linear", 8, 1);
        config.workers = 4;
        config.enable_gpu_use = true;
        config.device_count = 2;
        let adapter = build_adapter::<LinearPolicy>(&config, 3).unwrap();
        assert_eq!(adapter.context().device, Some(1));

        config.enable_gpu_use = false;
        let adapter = build_adapter::<LinearPolicy>(&config, 3).unwrap();
        assert_eq!(adapter.context().device, None);
    }

    #[test]
    fn test_build_adapter_dims() {
        let config = RunConfig::new("regression", "linear", 4, 1);
        let adapter = build_adapter::<LinearPolicy>(&config, 2).unwrap();
        assert_eq!(adapter.context().rank, 2);
        let genome = adapter.build(&[]).unwrap();
        assert_eq!(genome.weights.shape(), (2, 4));
    }

    #[tokio::test]
    async fn test_launch_unknown_agent() {
        let config = RunConfig::new("sphere", "transformer", 4, 1);
        assert!(matches!(launch(config).await, Err(EvoError::Configuration(_))));
    }
}
