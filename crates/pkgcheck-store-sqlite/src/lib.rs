#![allow(clippy::missing_errors_doc)]

mod queue;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pkgcheck_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, CheckError, EvaluationId, EvaluationRecord,
    EvaluationResult, EvaluationStore, PackageId, PackageRecord, PackageState, PackageStore,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;
use ulid::Ulid;

pub use queue::{QueuedJob, SqliteJobQueue};

const STORE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_STORE_V1: &str = r"
CREATE TABLE IF NOT EXISTS package_info (
  id TEXT PRIMARY KEY,
  package_name TEXT NOT NULL,
  is_production INTEGER NOT NULL CHECK (is_production IN (0, 1)),
  hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  state_type TEXT NOT NULL CHECK (state_type IN ('PENDING', 'SUCCEEDED', 'FAILED')),
  state_meta_json TEXT,
  latest INTEGER NOT NULL CHECK (latest IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_package_info_hash
  ON package_info(hash, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS uq_package_info_latest_hash
  ON package_info(hash) WHERE latest = 1;

CREATE TABLE IF NOT EXISTS evaluations (
  id TEXT PRIMARY KEY,
  package_info_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  rule_set_json TEXT,
  rule_set_hash TEXT NOT NULL,
  result_json TEXT,
  UNIQUE (package_info_id, rule_set_hash),
  FOREIGN KEY (package_info_id) REFERENCES package_info(id)
);
";

const PACKAGE_COLUMNS: &str =
    "id, package_name, is_production, hash, created_at, state_type, state_meta_json, latest";
const EVALUATION_COLUMNS: &str =
    "id, package_info_id, created_at, rule_set_json, rule_set_hash, result_json";

/// `rusqlite`-backed document store for package and evaluation records.
///
/// At most one record per hash carries `latest = 1`; a partial unique index
/// enforces it and [`PackageStore::insert_package`] demotes siblings in the
/// same transaction as the insert.
pub struct SqlitePackageStore {
    conn: Connection,
}

impl SqlitePackageStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_STORE_V1)
            .context("failed to apply package store schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_MIGRATION_VERSION, now],
            )
            .context("failed to register package store migration")?;

        Ok(())
    }

    pub fn insert_package_record(&self, record: &PackageRecord) -> Result<()> {
        let (state_type, state_meta) = state_to_sql(&record.state)?;
        let created_at = format_rfc3339(record.created_at).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start package insert transaction")?;

        if record.latest {
            let demoted = tx
                .execute(
                    "UPDATE package_info SET latest = 0 WHERE hash = ?1 AND latest = 1",
                    params![record.hash],
                )
                .context("failed to demote sibling package records")?;
            if demoted > 0 {
                debug!(hash = %record.hash, demoted, "demoted sibling package records");
            }
        }

        tx.execute(
            &format!(
                "INSERT INTO package_info({PACKAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                record.id.to_string(),
                record.package_name,
                bool_to_sql(record.is_production),
                record.hash,
                created_at,
                state_type,
                state_meta,
                bool_to_sql(record.latest),
            ],
        )
        .context("failed to insert package record")?;

        tx.commit()
            .context("failed to commit package insert transaction")?;
        Ok(())
    }

    pub fn latest_package_by_hash(&self, hash: &str) -> Result<Option<PackageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PACKAGE_COLUMNS}
             FROM package_info
             WHERE hash = ?1 AND latest = 1
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))?;
        let row = stmt
            .query_row(params![hash], parse_package_row)
            .optional()
            .context("failed to query latest package record")?;
        Ok(row)
    }

    pub fn package_by_id(&self, id: PackageId) -> Result<Option<PackageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM package_info WHERE id = ?1"
        ))?;
        let row = stmt
            .query_row(params![id.to_string()], parse_package_row)
            .optional()
            .context("failed to query package record")?;
        Ok(row)
    }

    /// Every record sharing `hash`, oldest first.
    pub fn packages_with_hash(&self, hash: &str) -> Result<Vec<PackageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PACKAGE_COLUMNS}
             FROM package_info
             WHERE hash = ?1
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![hash], parse_package_row)?;
        collect_rows(rows)
    }

    pub fn set_package_state(&self, id: PackageId, state: &PackageState) -> Result<bool> {
        let (state_type, state_meta) = state_to_sql(state)?;
        let updated = self
            .conn
            .execute(
                "UPDATE package_info SET state_type = ?2, state_meta_json = ?3 WHERE id = ?1",
                params![id.to_string(), state_type, state_meta],
            )
            .context("failed to update package state")?;
        Ok(updated > 0)
    }

    pub fn demote_hash(&self, hash: &str) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE package_info SET latest = 0 WHERE hash = ?1 AND latest = 1",
                params![hash],
            )
            .context("failed to invalidate package records by hash")
    }

    pub fn evaluation_by_key(
        &self,
        package_info_id: PackageId,
        rule_set_hash: &str,
    ) -> Result<Option<EvaluationRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVALUATION_COLUMNS}
             FROM evaluations
             WHERE package_info_id = ?1 AND rule_set_hash = ?2"
        ))?;
        let row = stmt
            .query_row(
                params![package_info_id.to_string(), rule_set_hash],
                parse_evaluation_row,
            )
            .optional()
            .context("failed to query evaluation by key")?;
        Ok(row)
    }

    pub fn evaluation_by_id(&self, id: EvaluationId) -> Result<Option<EvaluationRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE id = ?1"
        ))?;
        let row = stmt
            .query_row(params![id.to_string()], parse_evaluation_row)
            .optional()
            .context("failed to query evaluation by id")?;
        Ok(row)
    }

    /// Inserts `record` unless its `(package_info_id, rule_set_hash)` key is
    /// taken, then returns whichever record owns the key.
    pub fn insert_evaluation_record(&self, record: &EvaluationRecord) -> Result<EvaluationRecord> {
        let created_at = format_rfc3339(record.created_at).map_err(|err| anyhow!(err.to_string()))?;
        let rule_set_json = record
            .rule_set
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize rule set")?;
        let result_json = record
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize evaluation result")?;

        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO evaluations({EVALUATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(package_info_id, rule_set_hash) DO NOTHING"
                ),
                params![
                    record.id.to_string(),
                    record.package_info_id.to_string(),
                    created_at,
                    rule_set_json,
                    record.rule_set_hash,
                    result_json,
                ],
            )
            .context("failed to insert evaluation record")?;
        if inserted == 0 {
            debug!(
                package_id = %record.package_info_id,
                rule_set_hash = %record.rule_set_hash,
                "evaluation key already taken"
            );
        }

        self.evaluation_by_key(record.package_info_id, &record.rule_set_hash)?
            .ok_or_else(|| {
                anyhow!(
                    "evaluation for package {} and rule set {} vanished after insert",
                    record.package_info_id,
                    record.rule_set_hash
                )
            })
    }

    pub fn store_evaluation_result(
        &self,
        id: EvaluationId,
        result: &EvaluationResult,
    ) -> Result<bool> {
        let payload =
            serde_json::to_string(result).context("failed to serialize evaluation result")?;
        let updated = self
            .conn
            .execute(
                "UPDATE evaluations SET result_json = ?2 WHERE id = ?1 AND result_json IS NULL",
                params![id.to_string(), payload],
            )
            .context("failed to store evaluation result")?;
        Ok(updated > 0)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl PackageStore for SqlitePackageStore {
    fn find_latest_by_hash(&self, hash: &str) -> Result<Option<PackageRecord>, CheckError> {
        self.latest_package_by_hash(hash).map_err(storage_error)
    }

    fn get_package(&self, id: PackageId) -> Result<Option<PackageRecord>, CheckError> {
        self.package_by_id(id).map_err(storage_error)
    }

    fn insert_package(&self, record: &PackageRecord) -> Result<(), CheckError> {
        self.insert_package_record(record).map_err(storage_error)
    }

    fn update_package_state(
        &self,
        id: PackageId,
        state: &PackageState,
    ) -> Result<bool, CheckError> {
        self.set_package_state(id, state).map_err(storage_error)
    }

    fn invalidate_hash(&self, hash: &str) -> Result<usize, CheckError> {
        self.demote_hash(hash).map_err(storage_error)
    }
}

impl EvaluationStore for SqlitePackageStore {
    fn find_evaluation(
        &self,
        package_info_id: PackageId,
        rule_set_hash: &str,
    ) -> Result<Option<EvaluationRecord>, CheckError> {
        self.evaluation_by_key(package_info_id, rule_set_hash)
            .map_err(storage_error)
    }

    fn insert_evaluation_if_absent(
        &self,
        record: &EvaluationRecord,
    ) -> Result<EvaluationRecord, CheckError> {
        self.insert_evaluation_record(record).map_err(storage_error)
    }

    fn get_evaluation(&self, id: EvaluationId) -> Result<Option<EvaluationRecord>, CheckError> {
        self.evaluation_by_id(id).map_err(storage_error)
    }

    fn set_evaluation_result(
        &self,
        id: EvaluationId,
        result: &EvaluationResult,
    ) -> Result<bool, CheckError> {
        self.store_evaluation_result(id, result)
            .map_err(storage_error)
    }
}

pub(crate) fn storage_error(err: anyhow::Error) -> CheckError {
    CheckError::Storage(format!("{err:#}"))
}

fn state_to_sql(state: &PackageState) -> Result<(&'static str, Option<String>)> {
    let meta = state
        .meta()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize package state meta")?;
    Ok((state.as_str(), meta))
}

fn parse_package_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PackageRecord> {
    let id_raw: String = row.get(0)?;
    let created_at_raw: String = row.get(4)?;
    let state_type: String = row.get(5)?;
    let state_meta_raw: Option<String> = row.get(6)?;

    let meta = state_meta_raw
        .as_deref()
        .map(|raw| parse_json_column(6, raw))
        .transpose()?
        .unwrap_or(Value::Null);
    let state = match state_type.as_str() {
        "PENDING" => PackageState::Pending,
        "SUCCEEDED" => PackageState::Succeeded { meta },
        "FAILED" => PackageState::Failed { meta },
        other => return Err(invalid_column(5, format!("invalid state_type: {other}"))),
    };

    Ok(PackageRecord {
        id: PackageId(parse_ulid(0, &id_raw)?),
        package_name: row.get(1)?,
        is_production: row.get::<_, i64>(2)? != 0,
        hash: row.get(3)?,
        created_at: parse_rfc3339_utc(&created_at_raw)
            .map_err(|err| invalid_column(4, err.to_string()))?,
        state,
        latest: row.get::<_, i64>(7)? != 0,
    })
}

fn parse_evaluation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvaluationRecord> {
    let id_raw: String = row.get(0)?;
    let package_info_id_raw: String = row.get(1)?;
    let created_at_raw: String = row.get(2)?;
    let rule_set_raw: Option<String> = row.get(3)?;
    let result_raw: Option<String> = row.get(5)?;

    let result = match result_raw {
        Some(raw) => Some(
            serde_json::from_str::<EvaluationResult>(&raw)
                .map_err(|err| invalid_column(5, format!("invalid result_json: {err}")))?,
        ),
        None => None,
    };

    Ok(EvaluationRecord {
        id: EvaluationId(parse_ulid(0, &id_raw)?),
        package_info_id: PackageId(parse_ulid(1, &package_info_id_raw)?),
        created_at: parse_rfc3339_utc(&created_at_raw)
            .map_err(|err| invalid_column(2, err.to_string()))?,
        rule_set: rule_set_raw
            .as_deref()
            .map(|raw| parse_json_column(3, raw))
            .transpose()?,
        rule_set_hash: row.get(4)?,
        result,
    })
}

fn parse_ulid(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| invalid_column(index, format!("invalid ULID: {raw}")))
}

fn parse_json_column(index: usize, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw).map_err(|err| invalid_column(index, format!("invalid JSON: {err}")))
}

pub(crate) fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
