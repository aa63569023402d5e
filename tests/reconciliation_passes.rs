use async_trait::async_trait;
use sqlfleet_health::db::Database;
use sqlfleet_health::errors::{AppError, AppResult};
use sqlfleet_health::models::{
    ContextFailure, FindingFilters, FindingKey, FindingMutation, FindingStatus, InstanceCollection, InventoryDatabase,
    InventoryInstance, MetricSnapshot, MetricValue, Observation,
};
use sqlfleet_health::provider::{InventorySource, MetricProvider};
use sqlfleet_health::rules::RuleRegistry;
use sqlfleet_health::runner::{HealthRunner, RunnerOptions};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

enum Scripted {
    Collection(InstanceCollection),
    Fail(String),
    Hang,
    Panic,
}

enum Outcome {
    Ready(InstanceCollection),
    Hang,
    Panic,
}

#[derive(Default)]
struct ScriptedProvider {
    responses: Mutex<HashMap<String, Scripted>>,
}

impl ScriptedProvider {
    fn set(&self, instance_id: &str, response: Scripted) {
        self.responses
            .lock()
            .expect("provider lock")
            .insert(instance_id.to_string(), response);
    }
}

#[async_trait]
impl MetricProvider for ScriptedProvider {
    async fn get_snapshots(&self, instance: &InventoryInstance) -> AppResult<InstanceCollection> {
        // Decide under the lock, act after releasing it so a panic never
        // poisons the shared script.
        let outcome = {
            let responses = self.responses.lock().expect("provider lock");
            match responses.get(&instance.instance_id) {
                Some(Scripted::Collection(collection)) => Outcome::Ready(collection.clone()),
                Some(Scripted::Fail(message)) => return Err(AppError::Collection(message.clone())),
                Some(Scripted::Hang) => Outcome::Hang,
                Some(Scripted::Panic) => Outcome::Panic,
                None => Outcome::Ready(InstanceCollection::default()),
            }
        };
        match outcome {
            Outcome::Ready(collection) => Ok(collection),
            Outcome::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(InstanceCollection::default())
            }
            Outcome::Panic => panic!("driver crashed while collecting {}", instance.instance_id),
        }
    }
}

#[derive(Default)]
struct MutableInventory {
    instances: Mutex<Option<Vec<InventoryInstance>>>,
}

impl MutableInventory {
    fn set(&self, instances: Option<Vec<InventoryInstance>>) {
        *self.instances.lock().expect("inventory lock") = instances;
    }
}

#[async_trait]
impl InventorySource for MutableInventory {
    async fn list_active_instances(&self) -> AppResult<Vec<InventoryInstance>> {
        self.instances
            .lock()
            .expect("inventory lock")
            .clone()
            .ok_or_else(|| AppError::Collection("inventory service unreachable".to_string()))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    db: Arc<Database>,
    provider: Arc<ScriptedProvider>,
    inventory: Arc<MutableInventory>,
    runner: HealthRunner,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(Database::new(&dir.path().join("health.sqlite")).expect("db"));
    let provider = Arc::new(ScriptedProvider::default());
    let inventory = Arc::new(MutableInventory::default());
    inventory.set(Some(vec![sql01(&[(5, "Sales")]), instance("SQL02", &[])]));
    let runner = HealthRunner::new(
        db.clone(),
        Arc::new(RuleRegistry::with_default_checks().expect("registry")),
        provider.clone(),
        inventory.clone(),
        RunnerOptions {
            worker_limit: 2,
            collection_timeout: Duration::from_millis(100),
            collection_retries: 1,
            retry_backoff: Duration::from_millis(1),
            retention: chrono::Duration::days(90),
        },
    );
    Harness {
        _dir: dir,
        db,
        provider,
        inventory,
        runner,
    }
}

fn instance(instance_id: &str, databases: &[(i64, &str)]) -> InventoryInstance {
    InventoryInstance {
        instance_id: instance_id.to_string(),
        databases: databases
            .iter()
            .map(|(database_id, name)| InventoryDatabase {
                database_id: *database_id,
                name: name.to_string(),
            })
            .collect(),
    }
}

fn sql01(databases: &[(i64, &str)]) -> InventoryInstance {
    instance("SQL01", databases)
}

fn maxdop(instance_id: &str, current: i64) -> Observation {
    Observation {
        instance_id: instance_id.to_string(),
        database_id: 0,
        database_name: None,
        check_name: "MaxDOP".to_string(),
        current_value: MetricValue::Integer(current),
        recommended_value: MetricValue::Integer(8),
    }
}

fn recovery_model(database_id: i64, current: &str) -> Observation {
    Observation {
        instance_id: "SQL01".to_string(),
        database_id,
        database_name: None,
        check_name: "RecoveryModel".to_string(),
        current_value: MetricValue::Text(current.to_string()),
        recommended_value: MetricValue::Text("FULL".to_string()),
    }
}

fn collection(observations: Vec<Observation>) -> Scripted {
    Scripted::Collection(InstanceCollection {
        observations,
        ..InstanceCollection::default()
    })
}

fn findings_for(db: &Database, check: &str) -> Vec<sqlfleet_health::models::Finding> {
    let mut findings = db
        .list_findings(&FindingFilters {
            check_name: Some(check.to_string()),
            ..FindingFilters::default()
        })
        .expect("list findings");
    findings.sort_by_key(|finding| finding.opened_at);
    findings
}

#[tokio::test]
async fn maxdop_opens_resolves_and_reopens_as_a_new_row() {
    let h = harness();

    h.provider.set("SQL01", collection(vec![maxdop("SQL01", 1)]));
    let first = h.runner.run_pass().await.expect("pass 1");
    assert_eq!(first.opened, 1);
    let after_first = findings_for(&h.db, "MaxDOP");
    assert_eq!(after_first.len(), 1);
    assert_eq!(after_first[0].status, FindingStatus::Unresolved);
    assert_eq!(after_first[0].recommended_value, "8");
    assert_eq!(after_first[0].current_value, "1");

    h.provider.set("SQL01", collection(vec![maxdop("SQL01", 8)]));
    let second = h.runner.run_pass().await.expect("pass 2");
    assert_eq!(second.resolved, 1);
    let after_second = findings_for(&h.db, "MaxDOP");
    assert_eq!(after_second.len(), 1);
    assert_eq!(after_second[0].status, FindingStatus::Resolved);
    assert_eq!(after_second[0].current_value, "8");
    assert!(after_second[0].resolved_at.is_some());

    h.provider.set("SQL01", collection(vec![maxdop("SQL01", 1)]));
    let third = h.runner.run_pass().await.expect("pass 3");
    assert_eq!(third.opened, 1);
    let after_third = findings_for(&h.db, "MaxDOP");
    assert_eq!(after_third.len(), 2);
    assert_eq!(after_third[0].id, after_first[0].id);
    assert_eq!(after_third[0].status, FindingStatus::Resolved);
    assert_ne!(after_third[1].id, after_first[0].id);
    assert_eq!(after_third[1].status, FindingStatus::Unresolved);
    assert!(after_third[1].opened_at >= after_third[0].resolved_at.expect("resolved at"));
}

#[tokio::test]
async fn recovery_model_finding_is_not_duplicated_on_later_passes() {
    let h = harness();
    h.provider.set("SQL01", collection(vec![recovery_model(5, "SIMPLE")]));

    h.runner.run_pass().await.expect("pass 1");
    let findings = findings_for(&h.db, "RecoveryModel");
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].database_name.as_deref(), Some("Sales"));
    assert!(findings[0].notes.contains("FULL"));

    let second = h.runner.run_pass().await.expect("pass 2");
    assert_eq!(second.opened, 0);
    assert_eq!(second.resolved, 0);
    assert_eq!(second.unchanged, 1);
    let again = findings_for(&h.db, "RecoveryModel");
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, findings[0].id);
    assert_eq!(again[0].opened_at, findings[0].opened_at);
}

#[tokio::test]
async fn unchanged_input_is_idempotent() {
    let h = harness();
    h.provider.set(
        "SQL01",
        collection(vec![maxdop("SQL01", 1), recovery_model(5, "FULL"), recovery_model(5, "FULL")]),
    );
    h.provider.set("SQL02", collection(vec![maxdop("SQL02", 8)]));

    h.runner.run_pass().await.expect("pass 1");
    let before = h.db.list_findings(&FindingFilters::default()).expect("before");

    let second = h.runner.run_pass().await.expect("pass 2");
    assert_eq!(second.opened + second.resolved, 0);
    let after = h.db.list_findings(&FindingFilters::default()).expect("after");
    assert_eq!(before.len(), after.len());
    assert_eq!(after.len(), 1);
}

#[tokio::test]
async fn failing_instance_does_not_block_others() {
    let h = harness();
    h.provider.set("SQL01", Scripted::Fail("login timeout".to_string()));
    h.provider.set("SQL02", collection(vec![maxdop("SQL02", 2)]));

    let report = h.runner.run_pass().await.expect("pass");
    assert_eq!(report.instances, 2);
    assert_eq!(report.opened, 1);
    assert_eq!(report.errors, 1);

    let sql02 = h
        .db
        .list_findings(&FindingFilters {
            instance_id: Some("SQL02".to_string()),
            ..FindingFilters::default()
        })
        .expect("sql02 findings");
    assert_eq!(sql02.len(), 1);

    let errors = h.db.list_recent_errors("SQL01", 10).expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].check_name, "*");
    assert_eq!(errors[0].error_location, "collection");
    assert!(errors[0].error_message.contains("login timeout"));
    assert!(h.db.list_recent_errors("SQL02", 10).expect("none").is_empty());
}

#[tokio::test]
async fn hung_instance_times_out_without_stalling_the_pass() {
    let h = harness();
    h.provider.set("SQL01", Scripted::Hang);
    h.provider.set("SQL02", collection(vec![maxdop("SQL02", 2)]));

    let report = tokio::time::timeout(Duration::from_secs(5), h.runner.run_pass())
        .await
        .expect("pass finishes")
        .expect("pass");
    assert_eq!(report.opened, 1);
    let errors = h.db.list_recent_errors("SQL01", 10).expect("errors");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].error_message.contains("timed out"));
}

#[tokio::test]
async fn panicking_worker_is_contained_to_its_instance() {
    let h = harness();
    h.provider.set("SQL01", Scripted::Panic);
    h.provider.set("SQL02", collection(vec![maxdop("SQL02", 2)]));

    let report = h.runner.run_pass().await.expect("pass survives the panic");
    assert_eq!(report.instances, 2);
    assert_eq!(report.opened, 1);
    assert_eq!(report.errors, 1);

    let sql02 = h
        .db
        .list_findings(&FindingFilters {
            instance_id: Some("SQL02".to_string()),
            ..FindingFilters::default()
        })
        .expect("sql02 findings");
    assert_eq!(sql02.len(), 1);

    let errors = h.db.list_recent_errors("SQL01", 10).expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].check_name, "*");
    assert_eq!(errors[0].error_location, "internal");
    assert!(h.db.list_recent_errors("SQL02", 10).expect("none").is_empty());
}

#[tokio::test]
async fn observations_tagged_with_another_instance_are_rejected() {
    let h = harness();
    let foreign_database = Observation {
        instance_id: "SQL02".to_string(),
        ..recovery_model(5, "SIMPLE")
    };
    h.provider.set(
        "SQL01",
        collection(vec![maxdop("GHOST", 1), foreign_database, maxdop("SQL01", 1)]),
    );

    let report = h.runner.run_pass().await.expect("pass");
    assert_eq!(report.opened, 1);
    assert_eq!(report.errors, 2);
    assert_eq!(report.orphans_deleted, 0);

    let all = h.db.list_findings(&FindingFilters::default()).expect("findings");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].key, FindingKey::new("SQL01", 0, "MaxDOP"));

    let errors = h.db.list_recent_errors("SQL01", 10).expect("errors");
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|error| error.error_location == "collection"));
    assert!(errors.iter().any(|error| error.error_message.contains("GHOST")));
    assert!(errors
        .iter()
        .any(|error| error.check_name == "RecoveryModel" && error.error_message.contains("SQL02")));
    assert!(h.db.list_recent_errors("GHOST", 10).expect("none").is_empty());
    assert!(h.db.list_recent_errors("SQL02", 10).expect("none").is_empty());
}

#[tokio::test]
async fn plan_previews_a_pass_without_writing() {
    let h = harness();
    h.provider.set(
        "SQL01",
        collection(vec![maxdop("SQL01", 1), recovery_model(5, "SIMPLE"), maxdop("GHOST", 1)]),
    );

    let plan = h.runner.plan_instance("SQL01").await.expect("plan");
    assert_eq!(plan.len(), 2);
    assert!(plan.iter().all(|mutation| matches!(mutation, FindingMutation::Open { .. })));
    assert!(h.db.list_findings(&FindingFilters::default()).expect("list").is_empty());
    assert!(h.db.list_recent_errors("SQL01", 10).expect("errors").is_empty());

    h.runner.run_pass().await.expect("pass");
    let replan = h.runner.plan_instance("SQL01").await.expect("replan");
    assert!(replan.iter().all(|mutation| !mutation.is_write()));

    let err = h.runner.plan_instance("SQL09").await.expect_err("unknown instance");
    assert!(err.to_string().starts_with("NOT_FOUND"));
}

#[tokio::test]
async fn per_key_failures_are_logged_and_the_rest_of_the_batch_continues() {
    let h = harness();
    let mut bad_shape = recovery_model(5, "SIMPLE");
    bad_shape.check_name = "IndexFragmentation".to_string();
    let unknown = Observation {
        check_name: "NotACheck".to_string(),
        ..maxdop("SQL01", 1)
    };
    h.provider.set(
        "SQL01",
        Scripted::Collection(InstanceCollection {
            observations: vec![bad_shape, unknown, recovery_model(5, "SIMPLE")],
            failures: vec![sqlfleet_health::models::CollectionFailure {
                database_id: 5,
                check_name: "LastFullBackup".to_string(),
                message: "msdb.backupset unreadable".to_string(),
            }],
            unavailable_contexts: Vec::new(),
        }),
    );

    let report = h.runner.run_pass().await.expect("pass");
    assert_eq!(report.opened, 1);
    assert_eq!(report.errors, 3);
    let errors = h.db.list_recent_errors("SQL01", 10).expect("errors");
    let locations: Vec<&str> = errors.iter().map(|error| error.error_location.as_str()).collect();
    assert_eq!(locations.iter().filter(|location| **location == "evaluation").count(), 2);
    assert_eq!(locations.iter().filter(|location| **location == "collection").count(), 1);
}

#[tokio::test]
async fn missing_cpu_topology_skips_only_dependent_checks() {
    let h = harness();
    h.provider.set(
        "SQL01",
        Scripted::Collection(InstanceCollection {
            observations: vec![maxdop("SQL01", 1), recovery_model(5, "SIMPLE")],
            failures: Vec::new(),
            unavailable_contexts: vec![ContextFailure {
                context: "cpu_topology".to_string(),
                message: "sys.dm_os_sys_info permission denied".to_string(),
            }],
        }),
    );

    let report = h.runner.run_pass().await.expect("pass");
    assert_eq!(report.opened, 1);
    assert!(findings_for(&h.db, "MaxDOP").is_empty());
    assert_eq!(findings_for(&h.db, "RecoveryModel").len(), 1);

    let errors = h.db.list_recent_errors("SQL01", 10).expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].check_name, "MaxDOP");
    assert!(errors[0].error_message.contains("cpu_topology"));
}

#[tokio::test]
async fn decommissioned_database_findings_are_swept() {
    let h = harness();
    h.inventory.set(Some(vec![sql01(&[(5, "Sales"), (42, "Legacy")])]));
    h.provider.set("SQL01", collection(vec![recovery_model(42, "SIMPLE")]));
    h.runner.run_pass().await.expect("pass 1");
    assert_eq!(findings_for(&h.db, "RecoveryModel").len(), 1);

    h.inventory.set(Some(vec![sql01(&[(5, "Sales")])]));
    h.provider.set("SQL01", collection(Vec::new()));
    let report = h.runner.run_pass().await.expect("pass 2");
    assert_eq!(report.orphans_deleted, 1);
    assert!(findings_for(&h.db, "RecoveryModel").is_empty());
}

#[tokio::test]
async fn unavailable_inventory_aborts_before_any_write() {
    let h = harness();
    h.inventory.set(None);
    h.provider.set("SQL01", collection(vec![maxdop("SQL01", 1)]));

    let err = h.runner.run_pass().await.expect_err("pass aborts");
    assert!(err.is_fatal());
    assert!(h.db.list_findings(&FindingFilters::default()).expect("list").is_empty());
    assert!(h.db.list_recent_errors("SQL01", 10).expect("errors").is_empty());
}

#[test]
fn concurrent_writers_never_open_two_rows_for_one_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(Database::new(&dir.path().join("health.sqlite")).expect("db"));
    let snapshot = MetricSnapshot {
        key: FindingKey::new("SQL01", 0, "MaxDOP"),
        database_name: None,
        current_value: MetricValue::Integer(1),
        recommended_value: MetricValue::Integer(8),
        is_compliant: false,
    };

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            let snapshot = snapshot.clone();
            std::thread::spawn(move || db.apply_snapshot(&snapshot, "maxdop").expect("apply"))
        })
        .collect();
    let opens = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .filter(|mutation| mutation.is_write())
        .count();
    assert_eq!(opens, 1);

    let open = db
        .list_findings(&FindingFilters {
            status: Some(FindingStatus::Unresolved),
            ..FindingFilters::default()
        })
        .expect("list");
    assert_eq!(open.len(), 1);
}
