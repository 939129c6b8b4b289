//! SQLite persistence for runs, checkpoints, and lifecycle events.
//!
//! Three tables back the monitor contract: `pf_runs` (one row per flow
//! execution), `pf_checkpoints` (store snapshot after each node), and
//! `pf_events` (ordered event log). The database runs in WAL mode with a
//! single mutex-guarded writer connection per process; every read opens its
//! own short-lived connection, so monitor polling never blocks the writer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::store::Store;

const MIGRATION: &str = r#"
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS pf_runs (
    run_id      TEXT PRIMARY KEY,
    flow_name   TEXT NOT NULL DEFAULT '',
    status      TEXT NOT NULL DEFAULT 'running',
    started_at  REAL NOT NULL,
    ended_at    REAL,
    total_steps INTEGER,
    error       TEXT
);

CREATE TABLE IF NOT EXISTS pf_checkpoints (
    run_id      TEXT NOT NULL,
    step        INTEGER NOT NULL,
    node_name   TEXT NOT NULL,
    store_json  TEXT NOT NULL,
    created_at  REAL NOT NULL,
    PRIMARY KEY (run_id, step)
);

CREATE TABLE IF NOT EXISTS pf_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL,
    event       TEXT NOT NULL,
    node_name   TEXT,
    action      TEXT,
    elapsed_ms  REAL,
    error       TEXT,
    created_at  REAL NOT NULL
);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wall time as REAL unix seconds, the resolution the run tables store.
pub(crate) fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(FlowError::Malformed(format!("unknown run status '{other}'"))),
        }
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|err: FlowError| FromSqlError::Other(Box::new(err)))
    }
}

/// One `pf_runs` row.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub flow_name: String,
    pub status: RunStatus,
    pub started_at: f64,
    pub ended_at: Option<f64>,
    pub total_steps: Option<i64>,
    pub error: Option<String>,
}

/// One `pf_events` row.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub run_id: String,
    pub event: String,
    pub node_name: Option<String>,
    pub action: Option<String>,
    pub elapsed_ms: Option<f64>,
    pub error: Option<String>,
    pub created_at: f64,
}

/// One `pf_checkpoints` row.
#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub run_id: String,
    pub step: i64,
    pub node_name: String,
    pub store_json: String,
    pub created_at: f64,
}

/// SQLite-backed log of workflow runs, checkpoints, and events.
///
/// Cloning shares the writer connection; every clone may be used from any
/// thread.
#[derive(Clone)]
pub struct WorkflowDB {
    path: PathBuf,
    writer: Arc<Mutex<Connection>>,
}

impl WorkflowDB {
    /// Open (or create) the database, applying the additive schema migration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // The pragma returns its new value as a row, so it cannot go
        // through execute_batch.
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(MIGRATION)?;
        debug!(path = %path.display(), journal_mode = %journal_mode, "workflow database ready");
        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reader(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    // ── Runs ─────────────────────────────────────────────────────────────

    /// Insert a new run row with status `running`. Idempotent on `run_id`.
    pub fn create_run(&self, run_id: &str, flow_name: &str, started_at: f64) -> Result<()> {
        self.writer().execute(
            "INSERT OR IGNORE INTO pf_runs (run_id, flow_name, status, started_at)
             VALUES (?1, ?2, 'running', ?3)",
            params![run_id, flow_name, started_at],
        )?;
        debug!(run_id = %run_id, flow = %flow_name, "run created");
        Ok(())
    }

    /// Update run fields; `None` leaves the stored value untouched.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        ended_at: Option<f64>,
        total_steps: Option<u64>,
        error: Option<&str>,
    ) -> Result<()> {
        self.writer().execute(
            "UPDATE pf_runs
             SET status = ?2,
                 ended_at = COALESCE(?3, ended_at),
                 total_steps = COALESCE(?4, total_steps),
                 error = COALESCE(?5, error)
             WHERE run_id = ?1",
            params![
                run_id,
                status.to_string(),
                ended_at,
                total_steps.map(|steps| steps as i64),
                error
            ],
        )?;
        Ok(())
    }

    /// Fetch a single run row.
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRow>> {
        let conn = self.reader()?;
        let row = conn
            .query_row(
                "SELECT run_id, flow_name, status, started_at, ended_at, total_steps, error
                 FROM pf_runs WHERE run_id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most-recent runs, newest first by `started_at`.
    pub fn list_runs(&self, limit: Option<usize>) -> Result<Vec<RunRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, flow_name, status, started_at, ended_at, total_steps, error
             FROM pf_runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(params![limit], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Remove a run and all of its checkpoints and events.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM pf_events WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM pf_checkpoints WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM pf_runs WHERE run_id = ?1", params![run_id])?;
        tx.commit()?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────────

    /// Append a lifecycle event.
    pub fn insert_event(
        &self,
        run_id: &str,
        event: &str,
        node_name: Option<&str>,
        action: Option<&str>,
        elapsed_ms: Option<f64>,
        error: Option<&str>,
    ) -> Result<()> {
        self.writer().execute(
            "INSERT INTO pf_events (run_id, event, node_name, action, elapsed_ms, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![run_id, event, node_name, action, elapsed_ms, error, now_ts()],
        )?;
        Ok(())
    }

    /// All events for a run, ordered by insertion id.
    pub fn get_events(&self, run_id: &str) -> Result<Vec<EventRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, event, node_name, action, elapsed_ms, error, created_at
             FROM pf_events WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    event: row.get(2)?,
                    node_name: row.get(3)?,
                    action: row.get(4)?,
                    elapsed_ms: row.get(5)?,
                    error: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Checkpoints ──────────────────────────────────────────────────────

    /// Persist a store snapshot for a step. Re-writing the same step
    /// replaces the previous checkpoint.
    pub fn write_checkpoint(
        &self,
        run_id: &str,
        step: u64,
        node_name: &str,
        store_json: &str,
    ) -> Result<()> {
        self.writer().execute(
            "INSERT OR REPLACE INTO pf_checkpoints (run_id, step, node_name, store_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, step as i64, node_name, store_json, now_ts()],
        )?;
        debug!(run_id = %run_id, step, node = %node_name, "checkpoint saved");
        Ok(())
    }

    /// Commit one completed step atomically: the step checkpoint, the
    /// `node_end` event, and the run's `total_steps` land in a single
    /// transaction, so a reader that sees the event also sees the
    /// checkpoint.
    pub fn record_step(
        &self,
        run_id: &str,
        step: u64,
        node_name: &str,
        store_json: &str,
        action: &str,
        elapsed_ms: f64,
    ) -> Result<()> {
        let now = now_ts();
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO pf_checkpoints (run_id, step, node_name, store_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, step as i64, node_name, store_json, now],
        )?;
        tx.execute(
            "INSERT INTO pf_events (run_id, event, node_name, action, elapsed_ms, created_at)
             VALUES (?1, 'node_end', ?2, ?3, ?4, ?5)",
            params![run_id, node_name, action, elapsed_ms, now],
        )?;
        tx.execute(
            "UPDATE pf_runs SET total_steps = ?2 WHERE run_id = ?1",
            params![run_id, (step + 1) as i64],
        )?;
        tx.commit()?;
        debug!(run_id = %run_id, step, node = %node_name, action = %action, "step recorded");
        Ok(())
    }

    /// All checkpoints for a run, ordered by step.
    pub fn get_checkpoints(&self, run_id: &str) -> Result<Vec<CheckpointRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, step, node_name, store_json, created_at
             FROM pf_checkpoints WHERE run_id = ?1 ORDER BY step",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(CheckpointRow {
                    run_id: row.get(0)?,
                    step: row.get(1)?,
                    node_name: row.get(2)?,
                    store_json: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Rebuild the [`Store`] saved at `(run_id, step)`, schema included.
    pub fn load_checkpoint(&self, run_id: &str, step: u64) -> Result<Store> {
        let conn = self.reader()?;
        let store_json: Option<String> = conn
            .query_row(
                "SELECT store_json FROM pf_checkpoints WHERE run_id = ?1 AND step = ?2",
                params![run_id, step as i64],
                |row| row.get(0),
            )
            .optional()?;
        match store_json {
            Some(json) => Store::from_json(&json),
            None => Err(FlowError::MissingKey {
                scope: format!("run '{run_id}'"),
                key: format!("checkpoint step {step}"),
            }),
        }
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        flow_name: row.get(1)?,
        status: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        total_steps: row.get(5)?,
        error: row.get(6)?,
    })
}

impl fmt::Debug for WorkflowDB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDB")
            .field("path", &self.path)
            .finish()
    }
}
