use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    FindingKey, FindingMutation, InstanceCollection, InventoryInstance, MetricSnapshot, Observation, PassReport,
    INSTANCE_SCOPE, WHOLE_INSTANCE_CHECK,
};
use crate::provider::{InventorySource, MetricProvider};
use crate::reconciler::reconcile;
use crate::rules::RuleRegistry;
use crate::settings::Settings;
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub worker_limit: usize,
    pub collection_timeout: Duration,
    pub collection_retries: u32,
    pub retry_backoff: Duration,
    pub retention: chrono::Duration,
}

impl From<&Settings> for RunnerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            worker_limit: settings.worker_limit.max(1),
            collection_timeout: settings.collection_timeout(),
            collection_retries: settings.collection_retries,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            retention: settings.retention(),
        }
    }
}

#[derive(Clone)]
pub struct HealthRunner {
    db: Arc<Database>,
    registry: Arc<RuleRegistry>,
    provider: Arc<dyn MetricProvider>,
    inventory: Arc<dyn InventorySource>,
    options: RunnerOptions,
}

impl HealthRunner {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<RuleRegistry>,
        provider: Arc<dyn MetricProvider>,
        inventory: Arc<dyn InventorySource>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            db,
            registry,
            provider,
            inventory,
            options,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// One full reconciliation pass over the inventory.
    ///
    /// Only a configuration failure aborts the pass; collection, evaluation
    /// and persistence failures are logged to the error table and contained
    /// to the key or instance they belong to.
    pub async fn run_pass(&self) -> AppResult<PassReport> {
        let started_at = Utc::now();
        let instances = self.load_inventory().await?;
        tracing::info!(instances = instances.len(), checks = self.registry.len(), "reconciliation pass started");

        let semaphore = Arc::new(Semaphore::new(self.options.worker_limit));
        let mut join_set = JoinSet::new();
        for instance in instances.iter().cloned() {
            let runner = self.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let instance_id = instance.instance_id.clone();
                let report = match semaphore.acquire_owned().await {
                    Ok(_permit) => runner.reconcile_instance(&instance).await,
                    Err(_) => {
                        let error = AppError::Internal("worker pool closed".to_string());
                        runner.record_error(&instance_id, INSTANCE_SCOPE, WHOLE_INSTANCE_CHECK, &error);
                        PassReport {
                            instances: 1,
                            errors: 1,
                            ..PassReport::default()
                        }
                    }
                };
                (instance_id, report)
            });
        }

        let mut report = PassReport {
            started_at: Some(started_at),
            ..PassReport::default()
        };
        let mut finished = HashSet::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((instance_id, instance_report)) => {
                    finished.insert(instance_id);
                    report.absorb(&instance_report);
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "instance worker panicked");
                    report.errors += 1;
                }
            }
        }
        // Workers that panicked never reported back; record them by name.
        for instance in instances.iter().filter(|instance| !finished.contains(&instance.instance_id)) {
            let error = AppError::Internal("instance worker terminated unexpectedly".to_string());
            self.record_error(&instance.instance_id, INSTANCE_SCOPE, WHOLE_INSTANCE_CHECK, &error);
            report.instances += 1;
        }

        match self.db.cascade_delete_orphans(&instances) {
            Ok(deleted) => report.orphans_deleted = deleted,
            Err(error) => tracing::warn!(error = %error, "orphan sweep failed"),
        }
        match self.db.purge_resolved_older_than(self.options.retention) {
            Ok(purged) => report.purged = purged,
            Err(error) => tracing::warn!(error = %error, "retention purge failed"),
        }

        report.finished_at = Some(Utc::now());
        tracing::info!(
            instances = report.instances,
            opened = report.opened,
            resolved = report.resolved,
            unchanged = report.unchanged,
            errors = report.errors,
            orphans_deleted = report.orphans_deleted,
            purged = report.purged,
            "reconciliation pass finished"
        );
        Ok(report)
    }

    async fn reconcile_instance(&self, instance: &InventoryInstance) -> PassReport {
        let mut report = PassReport {
            instances: 1,
            ..PassReport::default()
        };

        let collection = match self.collect_with_retry(instance).await {
            Ok(collection) => collection,
            Err(error) => {
                tracing::warn!(instance_id = %instance.instance_id, error = %error, "metric collection failed");
                self.record_error(&instance.instance_id, INSTANCE_SCOPE, WHOLE_INSTANCE_CHECK, &error);
                report.errors += 1;
                return report;
            }
        };

        let InstanceCollection {
            observations,
            failures,
            unavailable_contexts,
        } = collection;

        for failure in failures {
            let error = AppError::Collection(failure.message);
            self.record_error(&instance.instance_id, failure.database_id, &failure.check_name, &error);
            report.errors += 1;
        }

        let missing_contexts: HashSet<String> = unavailable_contexts
            .into_iter()
            .map(|failure| {
                tracing::warn!(
                    instance_id = %instance.instance_id,
                    context = %failure.context,
                    error = %failure.message,
                    "instance context unavailable"
                );
                failure.context
            })
            .collect();

        for observation in observations {
            let database_id = observation.database_id;
            let check_name = observation.check_name.clone();
            let result = self
                .admit(instance, observation, &missing_contexts)
                .and_then(|admitted| admitted.map(|observation| self.reconcile_observation(&observation)).transpose());
            match result {
                Ok(Some(mutation)) => report.count_mutation(&mutation),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        database_id,
                        check = %check_name,
                        error = %error,
                        "check could not be reconciled"
                    );
                    self.record_error(&instance.instance_id, database_id, &check_name, &error);
                    report.errors += 1;
                }
            }
        }

        report
    }

    /// Decides whether an observation may be reconciled for `instance`.
    ///
    /// `Ok(None)` drops it silently (a database that left the inventory and
    /// will be orphan-swept); an error is recorded against the instance being
    /// collected, never against the id the provider put on the observation.
    fn admit(
        &self,
        instance: &InventoryInstance,
        mut observation: Observation,
        missing_contexts: &HashSet<String>,
    ) -> AppResult<Option<Observation>> {
        if observation.instance_id != instance.instance_id {
            return Err(AppError::Collection(format!(
                "provider returned an observation for {} while collecting {}",
                observation.instance_id, instance.instance_id
            )));
        }
        if observation.database_id != INSTANCE_SCOPE {
            let Some(database) = instance.database(observation.database_id) else {
                tracing::debug!(
                    instance_id = %instance.instance_id,
                    database_id = observation.database_id,
                    check = %observation.check_name,
                    "observation for database outside inventory ignored"
                );
                return Ok(None);
            };
            if observation.database_name.is_none() {
                observation.database_name = Some(database.name.clone());
            }
        }

        let definition = self.registry.definition_for(&observation)?;
        if let Some(context) = definition.requires.iter().find(|context| missing_contexts.contains(*context)) {
            return Err(AppError::Collection(format!(
                "required instance context '{}' could not be resolved",
                context
            )));
        }
        Ok(Some(observation))
    }

    fn reconcile_observation(&self, observation: &Observation) -> AppResult<FindingMutation> {
        let definition = self.registry.definition_for(observation)?;
        let snapshot = self.registry.evaluate(observation, Utc::now())?;
        let notes = definition.message(observation);
        let mutation = self.db.apply_snapshot(&snapshot, &notes)?;
        match &mutation {
            FindingMutation::Open { .. } => {
                tracing::info!(key = %mutation.key(), current = %snapshot.current_value, "finding opened");
            }
            FindingMutation::Resolve { .. } => {
                tracing::info!(key = %mutation.key(), current = %snapshot.current_value, "finding resolved");
            }
            FindingMutation::NoOp { .. } => {}
        }
        Ok(mutation)
    }

    /// Dry run for one instance: collects and evaluates like a pass, then
    /// plans mutations against the instance's open findings without writing
    /// anything, including the error log.
    pub async fn plan_instance(&self, instance_id: &str) -> AppResult<Vec<FindingMutation>> {
        let instance = self
            .load_inventory()
            .await?
            .into_iter()
            .find(|instance| instance.instance_id == instance_id)
            .ok_or_else(|| AppError::NotFound(format!("instance {} is not in the inventory", instance_id)))?;

        let collection = self.collect_with_retry(&instance).await?;
        let missing_contexts: HashSet<String> = collection
            .unavailable_contexts
            .into_iter()
            .map(|failure| failure.context)
            .collect();

        let now = Utc::now();
        let mut snapshots = Vec::new();
        let mut notes: HashMap<FindingKey, String> = HashMap::new();
        for observation in collection.observations {
            let check_name = observation.check_name.clone();
            let planned = self.admit(&instance, observation, &missing_contexts).and_then(|admitted| {
                admitted
                    .map(|observation| -> AppResult<(String, MetricSnapshot)> {
                        let definition = self.registry.definition_for(&observation)?;
                        let snapshot = self.registry.evaluate(&observation, now)?;
                        Ok((definition.message(&observation), snapshot))
                    })
                    .transpose()
            });
            match planned {
                Ok(Some((message, snapshot))) => {
                    notes.insert(snapshot.key.clone(), message);
                    snapshots.push(snapshot);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(instance_id = %instance_id, check = %check_name, error = %error, "check left out of plan");
                }
            }
        }

        let existing = self.db.open_findings(instance_id)?;
        Ok(reconcile(&snapshots, &existing, |snapshot| {
            notes.get(&snapshot.key).cloned().unwrap_or_default()
        }))
    }

    async fn load_inventory(&self) -> AppResult<Vec<InventoryInstance>> {
        self.inventory.list_active_instances().await.map_err(|error| match error {
            AppError::Config(message) => AppError::Config(message),
            other => AppError::Config(format!("inventory unavailable: {}", other)),
        })
    }

    async fn collect_with_retry(&self, instance: &InventoryInstance) -> AppResult<InstanceCollection> {
        let attempts = attempt_budget(self.options.collection_retries);
        let mut last_error = AppError::Collection("no collection attempt made".to_string());
        for attempt in 1..=attempts {
            let result = timeout(self.options.collection_timeout, self.provider.get_snapshots(instance)).await;
            match result {
                Ok(Ok(collection)) => return Ok(collection),
                Ok(Err(error)) => last_error = error,
                Err(_) => {
                    last_error = AppError::Collection(format!(
                        "collection timed out after {} ms",
                        self.options.collection_timeout.as_millis()
                    ))
                }
            }
            if attempt < attempts {
                let delay = retry_delay(self.options.retry_backoff, attempt);
                tracing::debug!(
                    instance_id = %instance.instance_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "retrying metric collection"
                );
                tokio::time::sleep(delay).await;
            }
        }
        Err(match last_error {
            AppError::Collection(message) => AppError::Collection(format!("{} (after {} attempts)", message, attempts)),
            other => AppError::Collection(format!("{} (after {} attempts)", other, attempts)),
        })
    }

    fn record_error(&self, instance_id: &str, database_id: i64, check_name: &str, error: &AppError) {
        if let Err(log_error) = self.db.insert_error(instance_id, database_id, check_name, error) {
            tracing::error!(
                instance_id = %instance_id,
                database_id,
                check = %check_name,
                error = %error,
                log_error = %log_error,
                "failed to append to error log"
            );
        }
    }
}

fn attempt_budget(retries: u32) -> u32 {
    retries.saturating_add(1)
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 1u32 << (attempt.saturating_sub(1)).min(6);
    let backoff = base.saturating_mul(multiplier);
    let jitter_cap = (backoff.as_millis() as u64 / 10).max(1);
    let jitter = rand::rng().random_range(0..=jitter_cap);
    backoff + Duration::from_millis(jitter)
}
