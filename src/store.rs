//! Durable store for configs, runs and per-request metrics.
//!
//! A [`StoreManager`] wraps one embedded SQLite database file. Schema
//! creation and migrations are idempotent, gated on `PRAGMA user_version`.
//! The handle is shared between one executor and arbitrary readers; all
//! access serializes on an internal mutex.
//!
//! Deletion semantics: dropping a run cascades to its metrics; dropping a
//! config leaves its runs behind with `config_id` set to NULL.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StressConfig;

/// Current schema version; bump together with a new `migrate` step.
const SCHEMA_VERSION: i32 = 1;

/// Store-level errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Config named '{name}' already exists in profile '{profile}'")]
    DuplicateName { name: String, profile: String },

    #[error("Unknown run status '{0}' in store")]
    UnknownStatus(String),
}

/// Terminal and in-flight states of a run. Only the owning executor writes
/// transitions; `Failed` is reserved for setup errors surfaced after the
/// run row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "failed" => Ok(RunStatus::Failed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// One execution instance of a config, with its summary statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub config_id: Option<i64>,
    pub config_name: String,
    pub request_file: String,
    pub profile_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub total_sent: u64,
    pub total_completed: u64,
    pub total_errors: u64,
    pub total_validation_errors: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub p50_duration_ms: u64,
    pub p95_duration_ms: u64,
    pub p99_duration_ms: u64,
}

impl Run {
    /// Fresh `running` row for the given config, not yet persisted.
    pub fn for_config(config: &StressConfig) -> Self {
        Self {
            id: 0,
            config_id: (config.id > 0).then_some(config.id),
            config_name: config.name.clone(),
            request_file: config.request_file.clone(),
            profile_name: config.profile_name.clone(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            total_sent: 0,
            total_completed: 0,
            total_errors: 0,
            total_validation_errors: 0,
            avg_duration_ms: 0.0,
            min_duration_ms: 0,
            max_duration_ms: 0,
            p50_duration_ms: 0,
            p95_duration_ms: 0,
            p99_duration_ms: 0,
        }
    }
}

/// Per-request metric row. The collector sets at most one of
/// `error_message` / `validation_error` (network failures bypass
/// validation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: i64,
    pub run_id: i64,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub status_code: u16,
    pub duration_ms: u64,
    pub request_size: u64,
    pub response_size: u64,
    pub error_message: Option<String>,
    pub validation_error: Option<String>,
}

/// Handle to the embedded store.
#[derive(Debug)]
pub struct StoreManager {
    conn: Mutex<Connection>,
}

impl StoreManager {
    /// Opens (creating if needed) the database at `path` and applies
    /// migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        let manager = Self::init(conn)?;
        info!(path = %path.as_ref().display(), "Opened stress-test store");
        Ok(manager)
    }

    /// In-memory store, used by tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Closes the underlying connection. Pending data is already durable;
    /// this only releases the file handle early instead of at drop.
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }

    // ── Configs ──────────────────────────────────────────────────────────

    /// Inserts when `id == 0`, updates otherwise. Name uniqueness is
    /// enforced within the config's profile scope.
    pub fn save_config(&self, config: &mut StressConfig) -> Result<(), StoreError> {
        let conn = self.lock();
        let result = if config.id == 0 {
            conn.execute(
                "INSERT INTO configs (name, request_file, profile_name, concurrent_conns,
                                      total_requests, ramp_up_secs, duration_secs, timeout_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    config.name,
                    config.request_file,
                    config.profile_name,
                    config.concurrent_conns,
                    config.total_requests as i64,
                    config.ramp_up_secs as i64,
                    config.duration_secs as i64,
                    config.timeout_secs as i64,
                ],
            )
            .map(|_| conn.last_insert_rowid())
        } else {
            conn.execute(
                "UPDATE configs SET name = ?1, request_file = ?2, profile_name = ?3,
                        concurrent_conns = ?4, total_requests = ?5, ramp_up_secs = ?6,
                        duration_secs = ?7, timeout_secs = ?8
                 WHERE id = ?9",
                params![
                    config.name,
                    config.request_file,
                    config.profile_name,
                    config.concurrent_conns,
                    config.total_requests as i64,
                    config.ramp_up_secs as i64,
                    config.duration_secs as i64,
                    config.timeout_secs as i64,
                    config.id,
                ],
            )
            .map(|_| config.id)
        };

        match result {
            Ok(id) => {
                config.id = id;
                debug!(config_id = id, name = %config.name, "Saved config");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateName {
                name: config.name.clone(),
                profile: config.profile_name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_config(&self, id: i64) -> Result<StressConfig, StoreError> {
        self.lock()
            .query_row(
                "SELECT id, name, request_file, profile_name, concurrent_conns,
                        total_requests, ramp_up_secs, duration_secs, timeout_secs
                 FROM configs WHERE id = ?1",
                params![id],
                row_to_config,
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "config",
                id,
            })
    }

    pub fn get_config_by_name(
        &self,
        name: &str,
        profile_name: &str,
    ) -> Result<Option<StressConfig>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                "SELECT id, name, request_file, profile_name, concurrent_conns,
                        total_requests, ramp_up_secs, duration_secs, timeout_secs
                 FROM configs WHERE name = ?1 AND profile_name = ?2",
                params![name, profile_name],
                row_to_config,
            )
            .optional()?)
    }

    pub fn list_configs(&self, profile_name: &str) -> Result<Vec<StressConfig>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, request_file, profile_name, concurrent_conns,
                    total_requests, ramp_up_secs, duration_secs, timeout_secs
             FROM configs WHERE profile_name = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![profile_name], row_to_config)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn delete_config(&self, id: i64) -> Result<(), StoreError> {
        let deleted = self
            .lock()
            .execute("DELETE FROM configs WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                entity: "config",
                id,
            });
        }
        Ok(())
    }

    // ── Runs ─────────────────────────────────────────────────────────────

    /// Inserts the run with status `running` and assigns its id.
    pub fn create_run(&self, run: &mut Run) -> Result<(), StoreError> {
        run.status = RunStatus::Running;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO runs (config_id, config_name, request_file, profile_name,
                               started_at, completed_at, status, total_sent, total_completed,
                               total_errors, total_validation_errors, avg_duration_ms,
                               min_duration_ms, max_duration_ms, p50_duration_ms,
                               p95_duration_ms, p99_duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                run.config_id,
                run.config_name,
                run.request_file,
                run.profile_name,
                run.started_at,
                run.completed_at,
                run.status.as_str(),
                run.total_sent as i64,
                run.total_completed as i64,
                run.total_errors as i64,
                run.total_validation_errors as i64,
                run.avg_duration_ms,
                run.min_duration_ms as i64,
                run.max_duration_ms as i64,
                run.p50_duration_ms as i64,
                run.p95_duration_ms as i64,
                run.p99_duration_ms as i64,
            ],
        )?;
        run.id = conn.last_insert_rowid();
        debug!(run_id = run.id, config = %run.config_name, "Created run");
        Ok(())
    }

    /// Overwrites the run's summary fields in one statement.
    pub fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let updated = self.lock().execute(
            "UPDATE runs SET completed_at = ?1, status = ?2, total_sent = ?3,
                    total_completed = ?4, total_errors = ?5, total_validation_errors = ?6,
                    avg_duration_ms = ?7, min_duration_ms = ?8, max_duration_ms = ?9,
                    p50_duration_ms = ?10, p95_duration_ms = ?11, p99_duration_ms = ?12
             WHERE id = ?13",
            params![
                run.completed_at,
                run.status.as_str(),
                run.total_sent as i64,
                run.total_completed as i64,
                run.total_errors as i64,
                run.total_validation_errors as i64,
                run.avg_duration_ms,
                run.min_duration_ms as i64,
                run.max_duration_ms as i64,
                run.p50_duration_ms as i64,
                run.p95_duration_ms as i64,
                run.p99_duration_ms as i64,
                run.id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                id: run.id,
            });
        }
        Ok(())
    }

    pub fn get_run(&self, id: i64) -> Result<Run, StoreError> {
        self.lock()
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                row_to_run,
            )
            .optional()?
            .ok_or(StoreError::NotFound { entity: "run", id })
    }

    /// Runs for one profile, newest first. `limit <= 0` means no limit.
    pub fn list_runs(&self, profile_name: &str, limit: i64) -> Result<Vec<Run>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE profile_name = ?1
             ORDER BY started_at DESC LIMIT ?2"
        ))?;
        let limit = if limit <= 0 { -1 } else { limit };
        let rows = stmt.query_map(params![profile_name, limit], row_to_run)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Deletes the run; its metrics go with it via the cascade.
    pub fn delete_run(&self, id: i64) -> Result<(), StoreError> {
        let deleted = self
            .lock()
            .execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound { entity: "run", id });
        }
        Ok(())
    }

    // ── Metrics ──────────────────────────────────────────────────────────

    pub fn save_metric(&self, metric: &Metric) -> Result<(), StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(METRIC_INSERT)?;
        insert_metric(&mut stmt, metric)?;
        Ok(())
    }

    /// Inserts the whole batch in one transaction; nothing is committed on
    /// error.
    pub fn save_metrics_batch(&self, metrics: &[Metric]) -> Result<(), StoreError> {
        if metrics.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(METRIC_INSERT)?;
            for metric in metrics {
                insert_metric(&mut stmt, metric)?;
            }
        }
        tx.commit()?;
        debug!(count = metrics.len(), "Flushed metrics batch");
        Ok(())
    }

    /// All metrics of a run, ordered by elapsed time since test start.
    pub fn get_metrics(&self, run_id: i64) -> Result<Vec<Metric>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, timestamp, elapsed_ms, status_code, duration_ms,
                    request_size, response_size, error_message, validation_error
             FROM metrics WHERE run_id = ?1 ORDER BY elapsed_ms",
        )?;
        let rows = stmt.query_map(params![run_id], row_to_metric)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

const RUN_COLUMNS: &str = "id, config_id, config_name, request_file, profile_name, started_at,
    completed_at, status, total_sent, total_completed, total_errors,
    total_validation_errors, avg_duration_ms, min_duration_ms, max_duration_ms,
    p50_duration_ms, p95_duration_ms, p99_duration_ms";

const METRIC_INSERT: &str = "INSERT INTO metrics (run_id, timestamp, elapsed_ms, status_code,
    duration_ms, request_size, response_size, error_message, validation_error)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

fn insert_metric(stmt: &mut rusqlite::Statement<'_>, m: &Metric) -> rusqlite::Result<usize> {
    stmt.execute(params![
        m.run_id,
        m.timestamp,
        m.elapsed_ms as i64,
        i64::from(m.status_code),
        m.duration_ms as i64,
        m.request_size as i64,
        m.response_size as i64,
        m.error_message,
        m.validation_error,
    ])
}

/// Applies all schema steps the database has not seen yet.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS configs (
                 id               INTEGER PRIMARY KEY AUTOINCREMENT,
                 name             TEXT NOT NULL,
                 request_file     TEXT NOT NULL,
                 profile_name     TEXT NOT NULL DEFAULT '',
                 concurrent_conns INTEGER NOT NULL,
                 total_requests   INTEGER NOT NULL,
                 ramp_up_secs     INTEGER NOT NULL DEFAULT 0,
                 duration_secs    INTEGER NOT NULL DEFAULT 0,
                 timeout_secs     INTEGER NOT NULL DEFAULT 0,
                 UNIQUE(name, profile_name)
             );

             CREATE TABLE IF NOT EXISTS runs (
                 id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                 config_id               INTEGER REFERENCES configs(id) ON DELETE SET NULL,
                 config_name             TEXT NOT NULL,
                 request_file            TEXT NOT NULL,
                 profile_name            TEXT NOT NULL DEFAULT '',
                 started_at              TEXT NOT NULL,
                 completed_at            TEXT,
                 status                  TEXT NOT NULL,
                 total_sent              INTEGER NOT NULL DEFAULT 0,
                 total_completed         INTEGER NOT NULL DEFAULT 0,
                 total_errors            INTEGER NOT NULL DEFAULT 0,
                 total_validation_errors INTEGER NOT NULL DEFAULT 0,
                 avg_duration_ms         REAL NOT NULL DEFAULT 0,
                 min_duration_ms         INTEGER NOT NULL DEFAULT 0,
                 max_duration_ms         INTEGER NOT NULL DEFAULT 0,
                 p50_duration_ms         INTEGER NOT NULL DEFAULT 0,
                 p95_duration_ms         INTEGER NOT NULL DEFAULT 0,
                 p99_duration_ms         INTEGER NOT NULL DEFAULT 0
             );

             CREATE TABLE IF NOT EXISTS metrics (
                 id               INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id           INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                 timestamp        TEXT NOT NULL,
                 elapsed_ms       INTEGER NOT NULL,
                 status_code      INTEGER NOT NULL DEFAULT 0,
                 duration_ms      INTEGER NOT NULL DEFAULT 0,
                 request_size     INTEGER NOT NULL DEFAULT 0,
                 response_size    INTEGER NOT NULL DEFAULT 0,
                 error_message    TEXT,
                 validation_error TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC);
             CREATE INDEX IF NOT EXISTS idx_runs_config_id ON runs(config_id);
             CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
             CREATE INDEX IF NOT EXISTS idx_metrics_run_id ON metrics(run_id);
             CREATE INDEX IF NOT EXISTS idx_metrics_run_timestamp ON metrics(run_id, timestamp);
             CREATE INDEX IF NOT EXISTS idx_metrics_run_elapsed ON metrics(run_id, elapsed_ms);",
        )?;
    }

    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        debug!(from = version, to = SCHEMA_VERSION, "Applied store migrations");
    }

    Ok(())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn row_to_config(row: &Row<'_>) -> rusqlite::Result<StressConfig> {
    Ok(StressConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        request_file: row.get(2)?,
        profile_name: row.get(3)?,
        concurrent_conns: row.get(4)?,
        total_requests: row.get::<_, i64>(5)? as u64,
        ramp_up_secs: row.get::<_, i64>(6)? as u64,
        duration_secs: row.get::<_, i64>(7)? as u64,
        timeout_secs: row.get::<_, i64>(8)? as u64,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status_str: String = row.get(7)?;
    let status = RunStatus::parse(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Run {
        id: row.get(0)?,
        config_id: row.get(1)?,
        config_name: row.get(2)?,
        request_file: row.get(3)?,
        profile_name: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        status,
        total_sent: row.get::<_, i64>(8)? as u64,
        total_completed: row.get::<_, i64>(9)? as u64,
        total_errors: row.get::<_, i64>(10)? as u64,
        total_validation_errors: row.get::<_, i64>(11)? as u64,
        avg_duration_ms: row.get(12)?,
        min_duration_ms: row.get::<_, i64>(13)? as u64,
        max_duration_ms: row.get::<_, i64>(14)? as u64,
        p50_duration_ms: row.get::<_, i64>(15)? as u64,
        p95_duration_ms: row.get::<_, i64>(16)? as u64,
        p99_duration_ms: row.get::<_, i64>(17)? as u64,
    })
}

fn row_to_metric(row: &Row<'_>) -> rusqlite::Result<Metric> {
    Ok(Metric {
        id: row.get(0)?,
        run_id: row.get(1)?,
        timestamp: row.get(2)?,
        elapsed_ms: row.get::<_, i64>(3)? as u64,
        status_code: row.get::<_, i64>(4)? as u16,
        duration_ms: row.get::<_, i64>(5)? as u64,
        request_size: row.get::<_, i64>(6)? as u64,
        response_size: row.get::<_, i64>(7)? as u64,
        error_message: row.get(8)?,
        validation_error: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_and_migrate() {
        let store = StoreManager::open_in_memory().unwrap();
        assert!(store.list_configs("").unwrap().is_empty());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Cancelled,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RunStatus::parse("exploded").is_err());
    }
}
