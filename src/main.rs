use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestra::{
    drivers::DriverRegistry,
    engine::{run_file, RunnerConfig},
};
use tracing::error;

#[derive(Parser)]
#[command(name = "orchestra")]
#[command(about = "Run CI pipelines as containers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a pipeline script
    Run {
        pipeline: PathBuf,

        #[arg(short, long, default_value = "native")]
        driver: String,

        /// Prefix for every backend resource this run creates
        #[arg(short, long, default_value = "ci")]
        namespace: String,
    },
    /// List the available drivers
    Drivers,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let registry = DriverRegistry::with_defaults();

    match cli.command {
        Commands::Run {
            pipeline,
            driver,
            namespace,
        } => {
            let config = RunnerConfig {
                driver,
                namespace,
                ..Default::default()
            };
            if let Err(e) = run_file(&registry, &config, &pipeline).await {
                error!(error = %e, pipeline = %pipeline.display(), "pipeline.failed");
                return Err(e).with_context(|| format!("pipeline {} failed", pipeline.display()));
            }
        }
        Commands::Drivers => {
            for name in registry.names() {
                println!("{name}");
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
