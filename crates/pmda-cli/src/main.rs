//! pmda-load - command line entry point

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use std::path::PathBuf;
use std::process::ExitCode;

use pmda_common::logging::init_logging;
use pmda_etl::config::load_config;
use pmda_etl::datasets::RunArgs;
use pmda_etl::loader::LoadMode;
use pmda_etl::orchestrator::{Orchestrator, RunOutcome};
use pmda_etl::state::IngestionState;

#[derive(Parser)]
#[command(
    name = "pmda-load",
    version,
    about = "Incremental loader for PMDA regulatory publications"
)]
struct Cli {
    /// Configuration file (default: config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state table and every configured dataset schema
    InitDb,
    /// Run one dataset pipeline end to end
    Run {
        /// Dataset identifier from the configuration file
        #[arg(long)]
        dataset: String,
        /// Override the configured load mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Fiscal year to load (required for the approvals dataset)
        #[arg(long)]
        year: Option<i32>,
        /// Keep only rows matching these drug names (repeatable)
        #[arg(long = "drug-name")]
        drug_names: Vec<String>,
    },
    /// Show the last run state of every dataset
    Status,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Merge,
    Append,
    Overwrite,
}

impl From<ModeArg> for LoadMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Merge => LoadMode::Merge,
            ModeArg::Append => LoadMode::Append,
            ModeArg::Overwrite => LoadMode::Overwrite,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref()).context("loading configuration")?;
    // A failed re-init just means logging was already set up
    init_logging(&config.logging).ok();

    match cli.command {
        Commands::InitDb => {
            Orchestrator::new(config).init_db().await?;
            println!("Database initialized.");
            Ok(())
        }
        Commands::Run {
            dataset,
            mode,
            year,
            drug_names,
        } => {
            let args = RunArgs { year, drug_names };
            let outcome = Orchestrator::new(config)
                .run(&dataset, mode.map(Into::into), &args)
                .await?;
            match outcome {
                RunOutcome::Unchanged => {
                    println!("{dataset}: source unchanged, nothing to load.");
                }
                RunOutcome::Loaded { tables, rows } => {
                    println!("{dataset}: loaded {rows} rows into {tables} table(s).");
                }
            }
            Ok(())
        }
        Commands::Status => {
            let states = Orchestrator::new(config).status().await?;
            println!("{}", render_status(&states));
            Ok(())
        }
        Commands::CheckConfig => {
            println!(
                "Configuration OK ({} dataset(s) configured).",
                config.datasets.len()
            );
            Ok(())
        }
    }
}

fn render_status(states: &[IngestionState]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header([
        "Dataset",
        "Status",
        "Last run (UTC)",
        "Last success (UTC)",
        "Version",
    ]);
    for state in states {
        table.add_row([
            state.dataset_id.clone(),
            state.status.to_string(),
            state.last_run_ts_utc.format("%Y-%m-%d %H:%M:%S").to_string(),
            state
                .last_successful_run_ts_utc
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            state.pipeline_version.clone(),
        ]);
    }
    table
}
