pub mod db;
pub mod errors;
pub mod models;
pub mod provider;
pub mod reconciler;
pub mod rules;
pub mod runner;
pub mod scheduler;
pub mod settings;

use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::provider::{FileSnapshotProvider, MetricProvider, StaticInventory};
use crate::rules::RuleRegistry;
use crate::runner::{HealthRunner, RunnerOptions};
use crate::scheduler::PassScheduler;
use crate::settings::Settings;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Wires the store, registry, provider and inventory described by the
/// settings. Any failure here is a configuration failure.
pub fn build_runner(settings: &Settings) -> AppResult<HealthRunner> {
    let db = Arc::new(Database::new(&settings.db_path())?);
    let registry = Arc::new(RuleRegistry::with_default_checks()?);
    let snapshot_dir = settings
        .snapshot_dir
        .clone()
        .ok_or_else(|| AppError::Config("snapshot_dir is not configured".to_string()))?;
    let provider: Arc<dyn MetricProvider> = Arc::new(FileSnapshotProvider::new(snapshot_dir));
    let inventory = Arc::new(StaticInventory::new(settings.inventory.clone()));

    Ok(HealthRunner::new(
        db,
        registry,
        provider,
        inventory,
        RunnerOptions::from(settings),
    ))
}

/// Builds a scheduler whose executor runs one pass on `runner`.
pub fn build_scheduler(settings: &Settings, runner: HealthRunner) -> PassScheduler {
    let scheduler = PassScheduler::new(settings.interval());
    let runner = Arc::new(runner);
    scheduler.set_executor(Arc::new(move || {
        let runner = runner.clone();
        Box::pin(async move {
            match runner.run_pass().await {
                Ok(report) => {
                    if report.errors > 0 {
                        tracing::warn!(errors = report.errors, "pass completed with contained failures");
                    }
                    false
                }
                Err(error) => {
                    tracing::error!(error = %error, "reconciliation pass aborted");
                    true
                }
            }
        })
    }));
    scheduler
}

pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir).map_err(|error| AppError::Config(error.to_string()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "health.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
