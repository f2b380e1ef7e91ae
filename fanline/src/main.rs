mod config;

use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, ConfigError};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "fanline", about = "Message fan-out pipeline")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve handler invocations
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Check a config file and exit
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not install metrics recorder: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Pipeline(#[from] pipeline::errors::PipelineError),
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = execute(cli.command) {
        eprintln!("fanline: {e}");
        process::exit(1);
    }
}

fn execute(command: CliCommand) -> Result<(), CliError> {
    match command {
        CliCommand::Validate { config } => {
            Config::from_file(&config)?;
            println!("{} is valid", config.display());
            Ok(())
        }
        CliCommand::Run { config } => {
            let config = Config::from_file(&config)?;
            // Flushes pending events on drop, so it must outlive the runtime
            let _sentry = init_logging(&config.common);
            init_metrics(&config.common)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            tracing::info!("Starting fanline");
            runtime.block_on(pipeline::run(config.pipeline))?;
            Ok(())
        }
    }
}

fn init_logging(common: &CommonConfig) -> Option<sentry::ClientInitGuard> {
    let guard = common.logging.as_ref().map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(common: &CommonConfig) -> Result<(), CliError> {
    if let Some(statsd) = &common.metrics {
        let recorder = StatsdBuilder::from(statsd.statsd_host.clone(), statsd.statsd_port)
            .build(Some("fanline"))
            .map_err(|e| CliError::Metrics(e.to_string()))?;
        metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
        tracing::info!(host = %statsd.statsd_host, port = statsd.statsd_port, "StatsD export enabled");
    }
    shared::metrics_defs::describe_all(pipeline::metrics_defs::ALL_METRICS);
    Ok(())
}
