use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;

use cli::commands;
use quantgraph::Stage;

#[derive(Parser)]
#[command(
    name = "quantgraph",
    version,
    about = "Fixed-point quantization for operator graphs",
    long_about = "Prepare, split, calibrate, quantize and merge a float operator graph into integer arithmetic"
)]
struct Cli {
    /// Log filter when RUST_LOG is unset (error, warn, info, debug, trace).
    #[arg(short, long, global = true, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline described by a config file.
    Run {
        #[arg(value_name = "CONFIG")]
        config_file: String,

        /// First stage to run; earlier stages are loaded from checkpoints.
        #[arg(short, long, default_value = "prepare")]
        start: Stage,
    },

    /// Summarize a saved graph descriptor.
    Info {
        #[arg(value_name = "GRAPH")]
        input: String,
    },

    /// Compare the deployable graph against the prepared float graph.
    Evaluate {
        #[arg(value_name = "CONFIG")]
        config_file: String,

        /// Samples per evaluation batch.
        #[arg(short, long, default_value = "16")]
        batch: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.verbosity)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    println!("{}", format!("quantgraph v{}", quantgraph::VERSION).bold().cyan());
    println!();

    match cli.command {
        Commands::Run { config_file, start } => {
            commands::run(&config_file, start)?;
        }
        Commands::Info { input } => {
            commands::info(&input)?;
        }
        Commands::Evaluate { config_file, batch } => {
            if batch == 0 {
                anyhow::bail!("batch must be positive");
            }
            commands::evaluate(&config_file, batch)?;
        }
    }

    Ok(())
}
