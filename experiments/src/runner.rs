use clap::ValueEnum;
use internals::Result;
use tracing::info;

use crate::config::ExperimentConfig;
use crate::scenarios::{self, ScenarioReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Experiment {
    PriorityFailover,
    Selector,
    SlowConsumer,
    TopicFanout,
    TwoDcNetwork,
}

impl Experiment {
    /// Default run order.
    pub const ALL: [Experiment; 5] = [
        Experiment::PriorityFailover,
        Experiment::Selector,
        Experiment::SlowConsumer,
        Experiment::TopicFanout,
        Experiment::TwoDcNetwork,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Experiment::PriorityFailover => "priority_failover",
            Experiment::Selector => "selector",
            Experiment::SlowConsumer => "slow_consumer",
            Experiment::TopicFanout => "topic_fanout",
            Experiment::TwoDcNetwork => "two_dc_network",
        }
    }
}

pub async fn run(experiment: Experiment, config: &ExperimentConfig) -> Result<ScenarioReport> {
    info!(experiment = experiment.name(), "running experiment");
    match experiment {
        Experiment::PriorityFailover => scenarios::priority_failover(config).await,
        Experiment::Selector => scenarios::selector(config).await,
        Experiment::SlowConsumer => scenarios::slow_consumer(config).await,
        Experiment::TopicFanout => scenarios::topic_fanout(config).await,
        Experiment::TwoDcNetwork => scenarios::two_dc_network(config).await,
    }
}

/// Runs the experiments in order and stops at the first error.
pub async fn run_all(
    experiments: &[Experiment],
    config: &ExperimentConfig,
) -> Result<Vec<ScenarioReport>> {
    let mut reports = Vec::with_capacity(experiments.len());
    for experiment in experiments {
        reports.push(run(*experiment, config).await?);
    }
    Ok(reports)
}
