//! workout-sim: drives a handheld and a wearable coordinator over an
//! in-memory link.
//!
//! ## Subcommands
//!
//! - `run`: replay a JSON scenario and report failed expectations
//! - `check`: validate a sync envelope read from stdin

mod scenario;

use clap::{Parser, Subcommand};
use std::env;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use workout_sync_core::load_config;

#[derive(Parser)]
#[command(name = "workout-sim")]
#[command(about = "Two-device workout sync simulator")]
#[command(version)]
struct Cli {
    /// Coordinator config (defaults to ~/.workout-sync/coordinator.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file
    Run {
        /// Scenario JSON
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Print coordinator events as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Validate an envelope (reads JSON from stdin)
    Check,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { path, events } => run(cli.config, path, events),
        Commands::Check => check(),
    };
    if let Err(message) = result {
        tracing::error!(error = %message, "workout-sim failed");
        eprintln!("{message}");
        std::process::exit(1);
    }
}

fn run(config: Option<PathBuf>, path: PathBuf, events: bool) -> Result<(), String> {
    let config = load_config(config).map_err(|e| e.to_string())?;
    let scenario = scenario::load(&path).map_err(|e| e.to_string())?;
    let mut sink: Box<dyn scenario::EventSink> = if events {
        Box::new(scenario::JsonLines)
    } else {
        Box::new(scenario::Quiet)
    };
    let report = scenario::replay(&scenario, &config, sink.as_mut()).map_err(|e| e.to_string())?;

    let summary = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    if !events {
        println!("{summary}");
    }
    if report.passed() {
        tracing::info!(
            name = %report.name,
            steps = report.steps,
            rejected = report.rejected.len(),
            "Scenario passed"
        );
        Ok(())
    } else {
        Err(format!(
            "{}: {} expectation(s) failed",
            report.name,
            report.failed_expectations.len()
        ))
    }
}

fn check() -> Result<(), String> {
    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .map_err(|e| format!("Failed to read stdin: {e}"))?;
    let envelope = workout_sync_protocol::decode_envelope(&input).map_err(|e| e.to_string())?;
    println!(
        "{} from {} for session {:?}",
        envelope.kind().as_str(),
        envelope.origin.as_str(),
        envelope.session_id
    );
    Ok(())
}

fn init_logging() {
    let debug_enabled = env::var("WORKOUT_SYNC_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
