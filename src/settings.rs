use crate::errors::{AppError, AppResult};
use crate::models::InventoryInstance;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_COLLECTION_RETRIES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    pub data_dir: PathBuf,
    pub interval_seconds: u64,
    pub retention_days: u32,
    pub worker_limit: usize,
    pub collection_timeout_seconds: u64,
    pub collection_retries: u32,
    pub retry_backoff_ms: u64,
    pub recent_error_limit: u32,
    pub snapshot_dir: Option<PathBuf>,
    pub inventory: Vec<InventoryInstance>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            interval_seconds: 900,
            retention_days: 90,
            worker_limit: 4,
            collection_timeout_seconds: 30,
            collection_retries: 2,
            retry_backoff_ms: 1_000,
            recent_error_limit: 50,
            snapshot_dir: None,
            inventory: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|error| AppError::Config(format!("cannot read {}: {}", path.display(), error)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let settings: Settings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.worker_limit == 0 {
            return Err(AppError::Config("worker_limit must be at least 1".to_string()));
        }
        if self.interval_seconds == 0 {
            return Err(AppError::Config("interval_seconds must be positive".to_string()));
        }
        if self.retention_days == 0 {
            return Err(AppError::Config("retention_days must be positive".to_string()));
        }
        if self.collection_retries > MAX_COLLECTION_RETRIES {
            return Err(AppError::Config(format!(
                "collection_retries must be at most {}",
                MAX_COLLECTION_RETRIES
            )));
        }

        let mut instances = HashSet::new();
        for instance in &self.inventory {
            if instance.instance_id.trim().is_empty() {
                return Err(AppError::Config("inventory entry with empty instance_id".to_string()));
            }
            if !instances.insert(instance.instance_id.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate instance {} in inventory",
                    instance.instance_id
                )));
            }
            let mut databases = HashSet::new();
            for database in &instance.databases {
                if database.database_id <= 0 {
                    return Err(AppError::Config(format!(
                        "database {} on {} must have a positive database_id",
                        database.name, instance.instance_id
                    )));
                }
                if !databases.insert(database.database_id) {
                    return Err(AppError::Config(format!(
                        "duplicate database_id {} on {}",
                        database.database_id, instance.instance_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("health.sqlite")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_secs(self.collection_timeout_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings = Settings::from_yaml(
            "inventory:\n  - instance_id: SQL01\n    databases:\n      - database_id: 5\n        name: Sales\n",
        )
        .expect("parse settings");
        assert_eq!(settings.interval_seconds, 900);
        assert_eq!(settings.retention_days, 90);
        assert_eq!(settings.inventory.len(), 1);
        assert_eq!(settings.inventory[0].databases[0].name, "Sales");
    }

    #[test]
    fn duplicate_instances_are_rejected() {
        let err = Settings::from_yaml("inventory:\n  - instance_id: SQL01\n  - instance_id: SQL01\n")
            .expect_err("duplicate instance should fail");
        assert!(err.to_string().contains("CONFIG_INVALID"));
    }

    #[test]
    fn unbounded_retries_are_rejected() {
        let err = Settings::from_yaml("collection_retries: 4294967295\n").expect_err("too many retries");
        assert!(err.is_fatal());
        assert!(Settings::from_yaml("collection_retries: 10\n").is_ok());
    }

    #[test]
    fn zero_worker_limit_is_rejected() {
        let err = Settings::from_yaml("worker_limit: 0\n").expect_err("zero workers should fail");
        assert!(err.is_fatal());
    }
}
