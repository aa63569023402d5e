//! Seams to the outside world: where instances come from and where their
//! metrics come from.

use crate::errors::{AppError, AppResult};
use crate::models::{InstanceCollection, InventoryInstance};
use async_trait::async_trait;
use std::path::PathBuf;

/// Highest database id reserved for system databases (master, tempdb,
/// model, msdb). Database-scoped checks only run against user databases.
pub const MAX_SYSTEM_DATABASE_ID: i64 = 4;

#[async_trait]
pub trait MetricProvider: Send + Sync {
    async fn get_snapshots(&self, instance: &InventoryInstance) -> AppResult<InstanceCollection>;
}

#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn list_active_instances(&self) -> AppResult<Vec<InventoryInstance>>;
}

/// Inventory fixed at startup, normally taken from the settings file.
#[derive(Debug, Clone)]
pub struct StaticInventory {
    instances: Vec<InventoryInstance>,
}

impl StaticInventory {
    pub fn new(instances: Vec<InventoryInstance>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl InventorySource for StaticInventory {
    async fn list_active_instances(&self) -> AppResult<Vec<InventoryInstance>> {
        if self.instances.is_empty() {
            return Err(AppError::Config("inventory lists no instances".to_string()));
        }
        Ok(self
            .instances
            .iter()
            .map(|instance| {
                let mut instance = instance.clone();
                instance.databases.retain(|database| {
                    let user_database = database.database_id > MAX_SYSTEM_DATABASE_ID;
                    if !user_database {
                        tracing::debug!(
                            instance_id = %instance.instance_id,
                            database = %database.name,
                            "skipping system database"
                        );
                    }
                    user_database
                });
                instance
            })
            .collect())
    }
}

/// Reads `<instance_id>.json` documents written by an external collector.
#[derive(Debug, Clone)]
pub struct FileSnapshotProvider {
    dir: PathBuf,
}

impl FileSnapshotProvider {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl MetricProvider for FileSnapshotProvider {
    async fn get_snapshots(&self, instance: &InventoryInstance) -> AppResult<InstanceCollection> {
        let path = self.dir.join(format!("{}.json", instance.instance_id));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|error| AppError::Collection(format!("cannot read {}: {}", path.display(), error)))?;
        let collection: InstanceCollection = serde_json::from_str(&raw)
            .map_err(|error| AppError::Collection(format!("malformed snapshot {}: {}", path.display(), error)))?;
        Ok(collection)
    }
}
