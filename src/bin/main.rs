//! Fleet health-check daemon and read-only query tool.
//!
//! Usage:
//!   sqlfleet-health --config health.yaml serve
//!   sqlfleet-health --config health.yaml once
//!   sqlfleet-health --config health.yaml plan --instance SQL01
//!   sqlfleet-health --config health.yaml findings --status unresolved

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sqlfleet_health::db::Database;
use sqlfleet_health::models::{FindingFilters, FindingStatus};
use sqlfleet_health::settings::Settings;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sqlfleet-health")]
#[command(about = "Best-practice checks across a SQL Server fleet")]
struct Args {
    /// Path to the YAML settings file
    #[arg(long, env = "SQLFLEET_HEALTH_CONFIG", default_value = "health.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run passes on the configured interval until interrupted
    Serve,
    /// Run a single pass and print its report
    Once,
    /// Show what a pass would change for one instance, without writing
    Plan {
        #[arg(long)]
        instance: String,
    },
    /// List findings
    Findings {
        #[arg(long)]
        instance: Option<String>,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long)]
        check: Option<String>,
        #[arg(long, default_value = "100")]
        limit: u32,
    },
    /// Count findings grouped by check and database
    Summary {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
    /// Show recent error log entries for an instance
    Errors {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Unresolved,
    Resolved,
}

impl From<StatusArg> for FindingStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Unresolved => FindingStatus::Unresolved,
            StatusArg::Resolved => FindingStatus::Resolved,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()))?;
    sqlfleet_health::init_tracing(&settings.log_dir()).context("initialising logging")?;

    match args.command {
        Command::Serve => serve(&settings).await,
        Command::Once => {
            let runner = sqlfleet_health::build_runner(&settings)?;
            let report = runner.run_pass().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Plan { instance } => {
            let runner = sqlfleet_health::build_runner(&settings)?;
            let mutations = runner.plan_instance(&instance).await?;
            println!("{}", serde_json::to_string_pretty(&mutations)?);
            Ok(())
        }
        Command::Findings {
            instance,
            status,
            check,
            limit,
        } => {
            let db = Database::new(&settings.db_path())?;
            let findings = db.list_findings(&FindingFilters {
                instance_id: instance,
                status: status.map(FindingStatus::from),
                check_name: check,
                limit: Some(limit),
                offset: None,
            })?;
            println!("{}", serde_json::to_string_pretty(&findings)?);
            Ok(())
        }
        Command::Summary { status } => {
            let db = Database::new(&settings.db_path())?;
            let counts = db.finding_counts(status.map(FindingStatus::from))?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Command::Errors { instance, limit } => {
            let db = Database::new(&settings.db_path())?;
            let errors = db.list_recent_errors(&instance, limit.unwrap_or(settings.recent_error_limit))?;
            println!("{}", serde_json::to_string_pretty(&errors)?);
            Ok(())
        }
    }
}

async fn serve(settings: &Settings) -> Result<()> {
    let runner = sqlfleet_health::build_runner(settings)?;
    tracing::info!(db = %runner.db().path().display(), instances = settings.inventory.len(), "findings store opened");
    let scheduler = sqlfleet_health::build_scheduler(settings, runner);
    let handle = scheduler.start();
    tracing::info!(interval_seconds = settings.interval_seconds, "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    scheduler.shutdown();
    handle.await.context("joining scheduler")?;
    Ok(())
}
