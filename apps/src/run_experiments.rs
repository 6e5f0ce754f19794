use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use experiments::{config, run, Experiment, ExperimentConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Runs delivery experiments against a network of brokers", long_about = None)]
struct Args {
    /// JSON experiment configuration; built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Experiments to run, in order; all of them when omitted
    #[arg(long, value_enum)]
    experiment: Vec<Experiment>,

    #[arg(long)]
    delivery_timeout_ms: Option<u64>,

    #[arg(long)]
    messages: Option<usize>,
}

fn load_config(args: &Args) -> internals::Result<ExperimentConfig> {
    let mut config = match &args.config {
        Some(path) => config::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(timeout) = args.delivery_timeout_ms {
        config.timings.delivery_timeout_ms = timeout;
    }
    if let Some(messages) = args.messages {
        config.messages_per_scenario = messages;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    utils::init_tracing();
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error=%e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let experiments = if args.experiment.is_empty() {
        Experiment::ALL.to_vec()
    } else {
        args.experiment.clone()
    };

    for experiment in experiments {
        match run(experiment, &config).await {
            Ok(report) => {
                if !report.completed {
                    warn!(experiment = experiment.name(), "not every expected delivery was observed");
                }
                println!("{}", report);
            }
            Err(e) => {
                error!(experiment = experiment.name(), error=%e, "experiment failed");
                return ExitCode::FAILURE;
            }
        }
    }

    info!("all experiments finished");
    ExitCode::SUCCESS
}
