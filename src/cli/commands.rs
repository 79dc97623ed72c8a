use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;

#[derive(Parser)]
#[command(name = "fanout-pilot")]
#[command(author, version, about = "Timed fan-out/fan-in session orchestrator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// Data directory holding config, sessions, checkpoints and reports
    #[arg(
        long,
        global = true,
        env = "FANOUT_PILOT_DATA_DIR",
        default_value = ".fanout-pilot"
    )]
    pub data_dir: PathBuf,
}

/// Output format for CLI results.
/// - Text: Human-readable text output (default)
/// - Json: One JSON document per result
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the data directory and a default config
    Init,

    /// Run a full session against the simulated router and ledger
    Run(RunArgs),

    /// Show session status
    Status {
        /// Session ID
        session_id: String,
    },

    /// List known sessions
    List,

    /// Resume an interrupted session from its latest checkpoint
    Resume {
        /// Session ID
        session_id: String,

        #[command(flatten)]
        sim: SimulationArgs,
    },

    /// Show or export a session report
    Report {
        /// Session ID
        session_id: String,

        /// Write the JSON report to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// List a session's checkpoints, newest first
    Checkpoints {
        /// Session ID
        session_id: String,
    },

    /// Retry a failed refund
    Refund {
        /// Session ID
        session_id: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Account paying for the session (also the default destination)
    #[arg(long, default_value = "payer")]
    pub payer: String,

    /// Consolidation destination (defaults to the payer)
    #[arg(long)]
    pub destination: Option<String>,

    /// Total amount to distribute
    #[arg(long)]
    pub total: Option<Decimal>,

    /// Number of allocation units
    #[arg(long)]
    pub units: Option<usize>,

    /// Activation window in seconds
    #[arg(long)]
    pub activation_window: Option<u64>,

    /// Collection window in seconds
    #[arg(long)]
    pub collection_window: Option<u64>,

    /// Minimum unit amount
    #[arg(long)]
    pub min_amount: Option<Decimal>,

    /// Maximum unit amount
    #[arg(long)]
    pub max_amount: Option<Decimal>,

    /// Profit target for the report's target-reached flag
    #[arg(long)]
    pub profit_target: Option<Decimal>,

    /// Stop the session once progress reaches this percentage
    #[arg(long)]
    pub stop_at: Option<f64>,

    #[command(flatten)]
    pub sim: SimulationArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SimulationArgs {
    /// Probability (0.0-1.0) that a simulated execution fails transiently
    #[arg(long, default_value = "0.0")]
    pub failure_rate: f64,

    /// Yield picked up by funds returning to the operating account
    #[arg(long, default_value = "0.05")]
    pub yield_rate: Decimal,

    /// Simulated execution latency in milliseconds
    #[arg(long, default_value = "0")]
    pub latency_ms: u64,

    /// Seed for the simulated router's failure rolls
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Reset to defaults
    Reset,
}
