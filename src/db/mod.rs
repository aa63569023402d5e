use crate::errors::{AppError, AppResult};
use crate::models::{
    ErrorRecord, Finding, FindingCount, FindingFilters, FindingKey, FindingMutation, FindingStatus,
    InventoryInstance, MetricSnapshot, INSTANCE_SCOPE,
};
use crate::reconciler::decide;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const FINDING_COLUMNS: &str = "id, instance_id, database_id, check_name, database_name, status, current_value, recommended_value, notes, opened_at, resolved_at";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Config(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|err| AppError::Config(err.to_string()))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|err| AppError::Config(format!("schema setup failed: {}", err)))?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn find_unresolved(&self, key: &FindingKey) -> AppResult<Option<Finding>> {
        let conn = self.lock()?;
        find_unresolved_in(&conn, key)
    }

    /// Unresolved findings of one instance, keyed for dry-run planning.
    pub fn open_findings(&self, instance_id: &str) -> AppResult<HashMap<FindingKey, Finding>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM findings WHERE instance_id = ?1 AND status = 'unresolved'",
            FINDING_COLUMNS
        ))?;
        let rows = statement.query_map([instance_id], parse_finding_row)?;
        let mut open = HashMap::new();
        for row in rows {
            let finding = row?;
            open.insert(finding.key.clone(), finding);
        }
        Ok(open)
    }

    /// Runs read, decide and write for one key inside a single immediate
    /// transaction, so concurrent callers for the same key observe a
    /// consistent pre-state.
    pub fn apply_snapshot(&self, snapshot: &MetricSnapshot, notes: &str) -> AppResult<FindingMutation> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let open = find_unresolved_in(&tx, &snapshot.key)?;
        let mutation = decide(snapshot, open.as_ref(), notes);
        write_mutation(&tx, &mutation, Utc::now())?;
        tx.commit()?;
        Ok(mutation)
    }

    pub fn upsert_resolved(&self, key: &FindingKey, current_value: &str) -> AppResult<Option<Finding>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(open) = find_unresolved_in(&tx, key)? else {
            return Ok(None);
        };
        let now = Utc::now();
        resolve_in(&tx, &open.id, current_value, now)?;
        tx.commit()?;
        Ok(Some(Finding {
            status: FindingStatus::Resolved,
            current_value: current_value.to_string(),
            resolved_at: Some(now),
            ..open
        }))
    }

    pub fn insert_unresolved(
        &self,
        key: &FindingKey,
        database_name: Option<&str>,
        current_value: &str,
        recommended_value: &str,
        notes: &str,
    ) -> AppResult<Finding> {
        let conn = self.lock()?;
        insert_unresolved_in(
            &conn,
            key,
            database_name,
            current_value,
            recommended_value,
            notes,
            Utc::now(),
        )
    }

    /// Deletes findings whose instance, or whose database within an instance,
    /// is no longer part of the inventory.
    pub fn cascade_delete_orphans(&self, inventory: &[InventoryInstance]) -> AppResult<u64> {
        let active: HashMap<&str, HashSet<i64>> = inventory
            .iter()
            .map(|instance| {
                (
                    instance.instance_id.as_str(),
                    instance.databases.iter().map(|database| database.database_id).collect(),
                )
            })
            .collect();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let scopes = {
            let mut statement = tx.prepare("SELECT DISTINCT instance_id, database_id FROM findings")?;
            let rows = statement.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut deleted = 0u64;
        for (instance_id, database_id) in scopes {
            let orphaned = match active.get(instance_id.as_str()) {
                None => true,
                Some(databases) => database_id != INSTANCE_SCOPE && !databases.contains(&database_id),
            };
            if !orphaned {
                continue;
            }
            let removed = tx.execute(
                "DELETE FROM findings WHERE instance_id = ?1 AND database_id = ?2",
                params![instance_id, database_id],
            )?;
            tracing::info!(instance_id = %instance_id, database_id, removed, "deleted findings for decommissioned scope");
            deleted += removed as u64;
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn purge_resolved_older_than(&self, retention: chrono::Duration) -> AppResult<u64> {
        let cutoff = fmt_time(Utc::now() - retention);
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM findings WHERE status = 'resolved' AND resolved_at IS NOT NULL AND resolved_at < ?1",
            [cutoff],
        )?;
        Ok(removed as u64)
    }

    pub fn list_findings(&self, filters: &FindingFilters) -> AppResult<Vec<Finding>> {
        let conn = self.lock()?;
        let mut query = format!("SELECT {} FROM findings WHERE 1 = 1", FINDING_COLUMNS);
        let mut params_vec: Vec<String> = Vec::new();

        if let Some(instance_id) = &filters.instance_id {
            query.push_str(" AND instance_id = ?");
            params_vec.push(instance_id.clone());
        }
        if let Some(status) = filters.status {
            query.push_str(" AND status = ?");
            params_vec.push(status.as_str().to_string());
        }
        if let Some(check_name) = &filters.check_name {
            query.push_str(" AND check_name = ?");
            params_vec.push(check_name.clone());
        }

        query.push_str(" ORDER BY opened_at DESC, id ASC LIMIT ? OFFSET ?");
        let limit = filters.limit.unwrap_or(100);
        let offset = filters.offset.unwrap_or(0);

        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);
        dyn_params.push(&offset);

        let rows = statement.query_map(rusqlite::params_from_iter(dyn_params), parse_finding_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn finding_counts(&self, status: Option<FindingStatus>) -> AppResult<Vec<FindingCount>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT check_name, instance_id, database_id, MAX(database_name), COUNT(1)
             FROM findings
             WHERE (?1 IS NULL OR status = ?1)
             GROUP BY check_name, instance_id, database_id
             ORDER BY check_name ASC, instance_id ASC, database_id ASC",
        )?;
        let rows = statement.query_map([status.map(FindingStatus::as_str)], |row| {
            Ok(FindingCount {
                check_name: row.get(0)?,
                instance_id: row.get(1)?,
                database_id: row.get(2)?,
                database_name: row.get(3)?,
                count: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn insert_error(
        &self,
        instance_id: &str,
        database_id: i64,
        check_name: &str,
        error: &AppError,
    ) -> AppResult<ErrorRecord> {
        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            database_id,
            check_name: check_name.to_string(),
            error_message: error.to_string(),
            error_location: error.location().to_string(),
            created_at: Utc::now(),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO error_log (id, instance_id, database_id, check_name, error_message, error_location, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.instance_id,
                record.database_id,
                record.check_name,
                record.error_message,
                record.error_location,
                fmt_time(record.created_at),
            ],
        )?;
        Ok(record)
    }

    pub fn list_recent_errors(&self, instance_id: &str, limit: u32) -> AppResult<Vec<ErrorRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, instance_id, database_id, check_name, error_message, error_location, created_at
             FROM error_log WHERE instance_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = statement.query_map(params![instance_id, limit], |row| {
            Ok(ErrorRecord {
                id: row.get(0)?,
                instance_id: row.get(1)?,
                database_id: row.get(2)?,
                check_name: row.get(3)?,
                error_message: row.get(4)?,
                error_location: row.get(5)?,
                created_at: parse_time(&row.get::<_, String>(6)?)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }
}

fn find_unresolved_in(conn: &Connection, key: &FindingKey) -> AppResult<Option<Finding>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM findings
             WHERE instance_id = ?1 AND database_id = ?2 AND check_name = ?3 AND status = 'unresolved'",
            FINDING_COLUMNS
        ),
        params![key.instance_id, key.database_id, key.check_name],
        parse_finding_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn write_mutation(conn: &Connection, mutation: &FindingMutation, now: DateTime<Utc>) -> AppResult<()> {
    match mutation {
        FindingMutation::Resolve {
            finding_id,
            current_value,
            ..
        } => resolve_in(conn, finding_id, current_value, now),
        FindingMutation::Open {
            key,
            database_name,
            current_value,
            recommended_value,
            notes,
        } => insert_unresolved_in(
            conn,
            key,
            database_name.as_deref(),
            current_value,
            recommended_value,
            notes,
            now,
        )
        .map(|_| ()),
        FindingMutation::NoOp { .. } => Ok(()),
    }
}

fn resolve_in(conn: &Connection, finding_id: &str, current_value: &str, now: DateTime<Utc>) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE findings SET status = 'resolved', current_value = ?1, resolved_at = ?2
         WHERE id = ?3 AND status = 'unresolved'",
        params![current_value, fmt_time(now), finding_id],
    )?;
    if changed == 0 {
        return Err(AppError::Persistence(format!("finding {} is no longer open", finding_id)));
    }
    Ok(())
}

fn insert_unresolved_in(
    conn: &Connection,
    key: &FindingKey,
    database_name: Option<&str>,
    current_value: &str,
    recommended_value: &str,
    notes: &str,
    now: DateTime<Utc>,
) -> AppResult<Finding> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO findings (
           id, instance_id, database_id, check_name, database_name, status,
           current_value, recommended_value, notes, opened_at, resolved_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, 'unresolved', ?6, ?7, ?8, ?9, NULL)",
        params![
            id,
            key.instance_id,
            key.database_id,
            key.check_name,
            database_name,
            current_value,
            recommended_value,
            notes,
            fmt_time(now),
        ],
    )?;
    Ok(Finding {
        id,
        key: key.clone(),
        database_name: database_name.map(ToString::to_string),
        status: FindingStatus::Unresolved,
        current_value: current_value.to_string(),
        recommended_value: recommended_value.to_string(),
        notes: notes.to_string(),
        opened_at: now,
        resolved_at: None,
    })
}

fn parse_finding_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Finding> {
    let status_raw: String = row.get(5)?;
    let status = FindingStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown finding status {}", status_raw),
            )),
        )
    })?;
    let resolved_at = match row.get::<_, Option<String>>(10)? {
        Some(raw) => Some(parse_time(&raw)?),
        None => None,
    };
    Ok(Finding {
        id: row.get(0)?,
        key: FindingKey {
            instance_id: row.get(1)?,
            database_id: row.get(2)?,
            check_name: row.get(3)?,
        },
        database_name: row.get(4)?,
        status,
        current_value: row.get(6)?,
        recommended_value: row.get(7)?,
        notes: row.get(8)?,
        opened_at: parse_time(&row.get::<_, String>(9)?)?,
        resolved_at,
    })
}

/// Fixed-width UTC timestamps keep lexical and chronological order equal.
fn fmt_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
