//! Cobalt CLI - operator interface for the Cobalt training-job orchestrator
//!
//! This CLI provides a `cobalt` command for running job manifests, diagnosing
//! failure messages and inspecting checkpoints.

mod commands;
mod manifest;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Cobalt CLI - training-job orchestration
#[derive(Parser, Debug)]
#[command(
    name = "cobalt",
    author,
    version,
    about = "Cobalt - training-job orchestration",
    long_about = "Cobalt queues training jobs by priority, admits them against concurrency and resource limits,\nand recovers failed runs with bounded, backed-off retries."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the jobs in a manifest until every job is terminal
    ///
    /// Jobs run on the simulated trainer; each job's `[jobs.simulation]`
    /// table scripts its loss curve and failures.
    Run {
        /// Path to the job manifest (TOML)
        #[arg(long)]
        jobs: PathBuf,

        /// Orchestrator config file (defaults to ./cobalt.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides `[checkpoint] root`
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        timeout_secs: u64,

        /// Output the final job reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Classify an error message and list recovery strategies
    Classify {
        /// Error text as reported by a trainer
        #[arg(required = true)]
        error: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List a job's checkpoints and check their integrity
    Checkpoints {
        /// Job ID
        #[arg(long)]
        job: String,

        /// Checkpoint root (defaults to `[checkpoint] root` from the config)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Orchestrator config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Orchestrator config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // logs go to stderr so JSON output on stdout stays parseable
    if args.log_json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .without_time()
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    match args.command {
        Command::Run { jobs, config, checkpoint_dir, timeout_secs, json } => {
            commands::run::execute(commands::run::RunOptions {
                manifest: jobs,
                config,
                checkpoint_dir,
                timeout_secs,
                json,
            })
            .await
        }
        Command::Classify { error, json } => commands::classify::execute(&error.join(" "), json),
        Command::Checkpoints { job, dir, config, json } => {
            commands::checkpoints::execute(&job, dir, config.as_deref(), json)
        }
        Command::Config { config } => commands::config::execute(config.as_deref()),
    }
}
