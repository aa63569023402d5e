use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Database id used for instance-scoped keys.
pub const INSTANCE_SCOPE: i64 = 0;

/// Check name recorded when a whole instance could not be collected.
pub const WHOLE_INSTANCE_CHECK: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckScope {
    Instance,
    Database,
}

impl CheckScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Database => "database",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
    Absent,
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Timestamp(_) => "timestamp",
            Self::Text(_) => "text",
            Self::Absent => "absent",
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Timestamp(value) => write!(f, "{}", value.to_rfc3339()),
            Self::Text(value) => write!(f, "{value}"),
            Self::Absent => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingKey {
    pub instance_id: String,
    pub database_id: i64,
    pub check_name: String,
}

impl FindingKey {
    pub fn new(instance_id: impl Into<String>, database_id: i64, check_name: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            database_id,
            check_name: check_name.into(),
        }
    }

    pub fn scope(&self) -> CheckScope {
        if self.database_id == INSTANCE_SCOPE {
            CheckScope::Instance
        } else {
            CheckScope::Database
        }
    }
}

impl fmt::Display for FindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.instance_id, self.database_id, self.check_name)
    }
}

/// A raw value pair reported by a metric provider, before evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub instance_id: String,
    #[serde(default)]
    pub database_id: i64,
    #[serde(default)]
    pub database_name: Option<String>,
    pub check_name: String,
    pub current_value: MetricValue,
    pub recommended_value: MetricValue,
}

impl Observation {
    pub fn key(&self) -> FindingKey {
        FindingKey::new(self.instance_id.clone(), self.database_id, self.check_name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub key: FindingKey,
    pub database_name: Option<String>,
    pub current_value: MetricValue,
    pub recommended_value: MetricValue,
    pub is_compliant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionFailure {
    #[serde(default)]
    pub database_id: i64,
    pub check_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFailure {
    pub context: String,
    pub message: String,
}

/// Everything one provider call returned for a single instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCollection {
    #[serde(default)]
    pub observations: Vec<Observation>,
    #[serde(default)]
    pub failures: Vec<CollectionFailure>,
    #[serde(default)]
    pub unavailable_contexts: Vec<ContextFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingStatus {
    Unresolved,
    Resolved,
}

impl FindingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unresolved" => Some(Self::Unresolved),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    pub key: FindingKey,
    pub database_name: Option<String>,
    pub status: FindingStatus,
    pub current_value: String,
    pub recommended_value: String,
    pub notes: String,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum FindingMutation {
    Resolve {
        finding_id: String,
        key: FindingKey,
        current_value: String,
    },
    Open {
        key: FindingKey,
        database_name: Option<String>,
        current_value: String,
        recommended_value: String,
        notes: String,
    },
    NoOp {
        key: FindingKey,
    },
}

impl FindingMutation {
    pub fn key(&self) -> &FindingKey {
        match self {
            Self::Resolve { key, .. } | Self::Open { key, .. } | Self::NoOp { key } => key,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Self::NoOp { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: String,
    pub instance_id: String,
    pub database_id: i64,
    pub check_name: String,
    pub error_message: String,
    pub error_location: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryDatabase {
    #[serde(alias = "database_id")]
    pub database_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryInstance {
    #[serde(alias = "instance_id")]
    pub instance_id: String,
    #[serde(default)]
    pub databases: Vec<InventoryDatabase>,
}

impl InventoryInstance {
    pub fn database(&self, database_id: i64) -> Option<&InventoryDatabase> {
        self.databases.iter().find(|database| database.database_id == database_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingFilters {
    pub instance_id: Option<String>,
    pub status: Option<FindingStatus>,
    pub check_name: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingCount {
    pub check_name: String,
    pub instance_id: String,
    pub database_id: i64,
    pub database_name: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub instances: u32,
    pub opened: u32,
    pub resolved: u32,
    pub unchanged: u32,
    pub errors: u32,
    pub orphans_deleted: u64,
    pub purged: u64,
}

impl PassReport {
    pub fn absorb(&mut self, other: &PassReport) {
        self.instances += other.instances;
        self.opened += other.opened;
        self.resolved += other.resolved;
        self.unchanged += other.unchanged;
        self.errors += other.errors;
    }

    pub fn count_mutation(&mut self, mutation: &FindingMutation) {
        match mutation {
            FindingMutation::Open { .. } => self.opened += 1,
            FindingMutation::Resolve { .. } => self.resolved += 1,
            FindingMutation::NoOp { .. } => self.unchanged += 1,
        }
    }
}
