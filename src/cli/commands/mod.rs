//! CLI parser and dispatch to command-specific modules.

mod admin;
mod init;
mod pipeline;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions};
use crate::models::Stage;

#[derive(Parser)]
#[command(name = "osflow")]
#[command(about = "Service-request pipeline: download, triage and invoice extraction")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides config file and OSFLOW_DATA_DIR)
    #[arg(long, short = 'd', global = true)]
    data: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Resolve relative paths from current working directory instead of config file location
    #[arg(long, global = true)]
    cwd: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

fn parse_stage(value: &str) -> Result<Stage, String> {
    Stage::from_str(value).ok_or_else(|| {
        format!(
            "unknown stage '{}' (expected download, triage or tomados)",
            value
        )
    })
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directories and apply database migrations
    Init,

    /// Run one stage until interrupted
    Run {
        /// Stage to run: download, triage or tomados
        #[arg(value_parser = parse_stage)]
        stage: Stage,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Show entity counts, queue lengths and stage heartbeats
    Status {
        /// Limit the report to one stage
        #[arg(value_parser = parse_stage)]
        stage: Option<Stage>,
    },

    /// Return failed entities to pending
    Reseed {
        #[arg(value_parser = parse_stage)]
        stage: Stage,
        /// Entity ids to reset
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Return stale in-progress claims to pending
    Reap {
        #[arg(value_parser = parse_stage)]
        stage: Stage,
    },

    /// Insert missing ids inside the known download range
    Heal,

    /// Publish ids to a work queue
    Enqueue {
        /// Queue name: triage or tomados
        queue: String,
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        use_cwd: cli.cwd,
        data: cli.data,
    };
    let (settings, _config) = load_settings_with_options(options).await?;

    match cli.command {
        Commands::Init => init::cmd_init(&settings).await,
        Commands::Run { stage, once } => pipeline::cmd_run(&settings, stage, once).await,
        Commands::Status { stage } => status::cmd_status(&settings, stage).await,
        Commands::Reseed { stage, ids } => admin::cmd_reseed(&settings, stage, &ids).await,
        Commands::Reap { stage } => admin::cmd_reap(&settings, stage).await,
        Commands::Heal => admin::cmd_heal(&settings).await,
        Commands::Enqueue { queue, ids } => admin::cmd_enqueue(&settings, &queue, &ids).await,
    }
}
