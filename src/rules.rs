//! Best-practice check catalogue.
//!
//! A [`RuleRegistry`] is built once at startup and shared behind an `Arc`.
//! Each [`CheckDefinition`] pairs a comparison rule with a message template;
//! evaluation is a pure function of the observed value, the recommended value
//! and the evaluation clock.

use crate::errors::{AppError, AppResult};
use crate::models::{CheckScope, MetricSnapshot, MetricValue, Observation, INSTANCE_SCOPE};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

static CHECK_NAME_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid check name regex"));

const FLOAT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    /// Observed value must equal the recommended value.
    ExactMatch,
    /// Observed value must be greater than or equal to the recommended value.
    AtLeast,
    /// Observed value must be less than or equal to the recommended value.
    AtMost,
    /// Observed value must be one of the allowed literals (case-insensitive).
    OneOf(Vec<String>),
    /// Observed value is the time of the last qualifying event, which must
    /// fall within the given number of hours.
    WithinHours(u32),
}

impl Comparison {
    pub fn one_of(allowed: &[&str]) -> Self {
        Self::OneOf(allowed.iter().map(|value| value.to_string()).collect())
    }

    pub fn is_compliant(
        &self,
        current: &MetricValue,
        recommended: &MetricValue,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        match self {
            Self::ExactMatch => exact_match(current, recommended),
            Self::AtLeast => {
                let (current, recommended) = numeric_pair(current, recommended)?;
                Ok(current + FLOAT_TOLERANCE >= recommended)
            }
            Self::AtMost => {
                let (current, recommended) = numeric_pair(current, recommended)?;
                Ok(current <= recommended + FLOAT_TOLERANCE)
            }
            Self::OneOf(allowed) => match current {
                MetricValue::Text(value) => Ok(allowed
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(value.trim()))),
                MetricValue::Absent => Ok(false),
                other => Err(shape_error("text", other)),
            },
            Self::WithinHours(hours) => match current {
                MetricValue::Timestamp(at) => {
                    Ok(now.signed_duration_since(*at) <= chrono::Duration::hours(i64::from(*hours)))
                }
                MetricValue::Absent => Ok(false),
                other => Err(shape_error("timestamp", other)),
            },
        }
    }
}

fn exact_match(current: &MetricValue, recommended: &MetricValue) -> AppResult<bool> {
    match (current, recommended) {
        (MetricValue::Absent, _) => Ok(false),
        (MetricValue::Text(left), MetricValue::Text(right)) => Ok(left.trim().eq_ignore_ascii_case(right.trim())),
        (MetricValue::Timestamp(left), MetricValue::Timestamp(right)) => Ok(left == right),
        (left, right) => {
            let (left, right) = numeric_pair(left, right)?;
            Ok((left - right).abs() <= FLOAT_TOLERANCE)
        }
    }
}

fn numeric_pair(current: &MetricValue, recommended: &MetricValue) -> AppResult<(f64, f64)> {
    let current_number = current.as_f64().ok_or_else(|| shape_error("number", current))?;
    let recommended_number = recommended
        .as_f64()
        .ok_or_else(|| shape_error("number", recommended))?;
    Ok((current_number, recommended_number))
}

fn shape_error(expected: &str, value: &MetricValue) -> AppError {
    AppError::Evaluation(format!("expected {} value, got {} ({})", expected, value.kind(), value))
}

#[derive(Debug, Clone)]
pub struct CheckDefinition {
    pub name: String,
    pub scope: CheckScope,
    pub comparison: Comparison,
    /// Instance-level context this check cannot be evaluated without.
    pub requires: Vec<String>,
    /// Supports `{current}`, `{recommended}`, `{database}` and `{instance}`.
    pub message_template: String,
}

impl CheckDefinition {
    pub fn new(name: &str, scope: CheckScope, comparison: Comparison, message_template: &str) -> Self {
        Self {
            name: name.to_string(),
            scope,
            comparison,
            requires: Vec::new(),
            message_template: message_template.to_string(),
        }
    }

    pub fn requiring(mut self, context: &str) -> Self {
        self.requires.push(context.to_string());
        self
    }

    pub fn evaluate(&self, current: &MetricValue, recommended: &MetricValue, now: DateTime<Utc>) -> AppResult<bool> {
        self.comparison.is_compliant(current, recommended, now)
    }

    /// The recommendation this definition actually enforces. Set-membership
    /// and age rules carry their own target, so whatever the provider sent is
    /// replaced; numeric rules compare against the provider's value.
    pub fn recommended_for(&self, reported: &MetricValue) -> MetricValue {
        match &self.comparison {
            Comparison::OneOf(allowed) => MetricValue::Text(allowed.join(" or ")),
            Comparison::WithinHours(hours) => MetricValue::Text(format!("{}h", hours)),
            _ => reported.clone(),
        }
    }

    pub fn message(&self, observation: &Observation) -> String {
        let database = observation
            .database_name
            .clone()
            .unwrap_or_else(|| observation.database_id.to_string());
        self.message_template
            .replace("{current}", &observation.current_value.to_string())
            .replace("{recommended}", &self.recommended_for(&observation.recommended_value).to_string())
            .replace("{database}", &database)
            .replace("{instance}", &observation.instance_id)
    }
}

#[derive(Debug, Clone)]
pub struct RuleRegistry {
    definitions: BTreeMap<String, CheckDefinition>,
}

impl RuleRegistry {
    pub fn new(definitions: Vec<CheckDefinition>) -> AppResult<Self> {
        let mut map = BTreeMap::new();
        for definition in definitions {
            if !CHECK_NAME_RE.is_match(&definition.name) {
                return Err(AppError::Config(format!("invalid check name '{}'", definition.name)));
            }
            if map.contains_key(&definition.name) {
                return Err(AppError::Config(format!("duplicate check '{}'", definition.name)));
            }
            map.insert(definition.name.clone(), definition);
        }
        if map.is_empty() {
            return Err(AppError::Config("rule registry is empty".to_string()));
        }
        Ok(Self { definitions: map })
    }

    pub fn with_default_checks() -> AppResult<Self> {
        Self::new(default_checks())
    }

    pub fn get(&self, name: &str) -> Option<&CheckDefinition> {
        self.definitions.get(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CheckDefinition> {
        self.definitions.values()
    }

    /// Looks up the definition for an observation and checks that its scope
    /// matches the observation's key.
    pub fn definition_for(&self, observation: &Observation) -> AppResult<&CheckDefinition> {
        let definition = self.get(&observation.check_name).ok_or_else(|| {
            AppError::Evaluation(format!("unknown check '{}'", observation.check_name))
        })?;
        let observed_scope = if observation.database_id == INSTANCE_SCOPE {
            CheckScope::Instance
        } else {
            CheckScope::Database
        };
        if observed_scope != definition.scope {
            return Err(AppError::Evaluation(format!(
                "check '{}' is {}-scoped but was observed at {} scope",
                definition.name,
                definition.scope.as_str(),
                observed_scope.as_str()
            )));
        }
        Ok(definition)
    }

    pub fn evaluate(&self, observation: &Observation, now: DateTime<Utc>) -> AppResult<MetricSnapshot> {
        let definition = self.definition_for(observation)?;
        let is_compliant = definition.evaluate(&observation.current_value, &observation.recommended_value, now)?;
        Ok(MetricSnapshot {
            key: observation.key(),
            database_name: observation.database_name.clone(),
            current_value: observation.current_value.clone(),
            recommended_value: definition.recommended_for(&observation.recommended_value),
            is_compliant,
        })
    }
}

fn default_checks() -> Vec<CheckDefinition> {
    use CheckScope::{Database, Instance};

    vec![
        CheckDefinition::new(
            "MaxDOP",
            Instance,
            Comparison::ExactMatch,
            "Max degree of parallelism is {current}; the processor and NUMA layout of {instance} calls for {recommended}.",
        )
        .requiring("cpu_topology"),
        CheckDefinition::new(
            "CostThresholdForParallelism",
            Instance,
            Comparison::AtLeast,
            "Cost threshold for parallelism is {current}; raise it to at least {recommended}.",
        ),
        CheckDefinition::new(
            "LongRunningQueries",
            Instance,
            Comparison::AtMost,
            "{current} requests have been running longer than 30 seconds (limit {recommended}).",
        ),
        CheckDefinition::new(
            "BlockedSessions",
            Instance,
            Comparison::AtMost,
            "{current} sessions are blocked (limit {recommended}).",
        ),
        CheckDefinition::new(
            "Deadlocks",
            Instance,
            Comparison::AtMost,
            "{current} deadlocks were recorded in the sample window (limit {recommended}).",
        ),
        CheckDefinition::new(
            "HighCpuQueries",
            Instance,
            Comparison::AtMost,
            "{current} cached plans average more than one second of worker time per execution (limit {recommended}).",
        ),
        CheckDefinition::new(
            "LoginFailures",
            Instance,
            Comparison::AtMost,
            "{current} failed logins in the sample window (limit {recommended}).",
        ),
        CheckDefinition::new(
            "FailedAgentJobs",
            Instance,
            Comparison::AtMost,
            "{current} agent jobs failed on their last run (limit {recommended}).",
        ),
        CheckDefinition::new(
            "MemoryPressure",
            Instance,
            Comparison::ExactMatch,
            "Low memory flag on {instance} is {current}; expected {recommended} (process physical or virtual memory low).",
        ),
        CheckDefinition::new(
            "HighNetworkUsage",
            Instance,
            Comparison::AtMost,
            "Sessions on {instance} sent and received {current} MB in the sample window (limit {recommended} MB).",
        ),
        CheckDefinition::new(
            "WarehouseCreditUsage",
            Instance,
            Comparison::AtMost,
            "Compute credit usage is {current} for the window; budget is {recommended}.",
        ),
        CheckDefinition::new(
            "RecoveryModel",
            Database,
            Comparison::one_of(&["FULL"]),
            "Database {database} uses the {current} recovery model; use {recommended} to allow point-in-time restore.",
        ),
        CheckDefinition::new(
            "PageVerify",
            Database,
            Comparison::one_of(&["CHECKSUM"]),
            "Database {database} page verify option is {current}; set it to {recommended}.",
        ),
        CheckDefinition::new(
            "AutoShrink",
            Database,
            Comparison::ExactMatch,
            "Database {database} has auto shrink {current}; set it to {recommended}.",
        ),
        CheckDefinition::new(
            "IndexFragmentation",
            Database,
            Comparison::AtMost,
            "Database {database} has indexes at {current}% fragmentation (limit {recommended}%).",
        ),
        CheckDefinition::new(
            "IoStallMs",
            Database,
            Comparison::AtMost,
            "Database {database} averages {current} ms of I/O stall per operation (limit {recommended} ms).",
        ),
        CheckDefinition::new(
            "UnusedIndexes",
            Database,
            Comparison::AtMost,
            "Database {database} has {current} indexes with no seeks, scans or lookups (limit {recommended}).",
        ),
        CheckDefinition::new(
            "DuplicateIndexes",
            Database,
            Comparison::AtMost,
            "Database {database} has {current} duplicate or overlapping indexes (limit {recommended}).",
        ),
        CheckDefinition::new(
            "MissingIndexes",
            Database,
            Comparison::AtMost,
            "Database {database} has {current} high-impact missing index suggestions (limit {recommended}).",
        ),
        CheckDefinition::new(
            "LastFullBackup",
            Database,
            Comparison::WithinHours(24),
            "Database {database} last full backup was {current}; expected within {recommended}.",
        ),
        CheckDefinition::new(
            "LastLogBackup",
            Database,
            Comparison::WithinHours(1),
            "Database {database} last log backup was {current}; expected within {recommended}.",
        ),
        CheckDefinition::new(
            "LastIntegrityCheck",
            Database,
            Comparison::WithinHours(168),
            "Database {database} last clean DBCC CHECKDB was {current}; expected within {recommended}.",
        ),
    ]
}
