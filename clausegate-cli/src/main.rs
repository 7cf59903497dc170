//! ClauseGate CLI: drive and inspect the resource governor.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// ClauseGate: resource-governed contract analysis
#[derive(Parser, Debug)]
#[command(name = "clausegate", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (replaces the user and workspace layers)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run simulated analyses through the governor and report the outcome
    Simulate(SimulateArgs),
    /// Print the status snapshot of a freshly configured manager
    Status,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct SimulateArgs {
    /// Number of documents to analyze
    #[arg(short = 'n', long, default_value_t = 20)]
    requests: usize,

    /// Starting memory gauge of the simulated local model, in MB
    #[arg(long, default_value_t = 1024.0)]
    memory_mb: f64,

    /// Memory added to the gauge per successful analysis, in MB
    #[arg(long, default_value_t = 64.0)]
    growth_mb: f64,

    /// Fraction of the gauge released on each optimization pass
    #[arg(long, default_value_t = 0.5)]
    release_fraction: f64,

    /// Latency of each simulated inference call, in ms
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,

    /// Make the local model fail so requests fall back to the API backend
    #[arg(long)]
    local_failing: bool,

    /// Override the configured concurrency ceiling
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Override the configured memory limit, in MB
    #[arg(long)]
    memory_limit_mb: Option<f64>,

    /// Print the final status as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default workspace configuration file
    Init,
    /// Show the effective configuration
    Show,
    /// Validate the effective configuration
    Validate,
    /// Print the config file locations that are consulted
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "clausegate", "clausegate")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "clausegate.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
