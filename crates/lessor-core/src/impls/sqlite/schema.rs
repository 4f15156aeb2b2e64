//! Schema - テーブル定義とマイグレーション
//!
//! `schema_migrations` にバージョンを記録し、足りない分だけ適用する。

use chrono::Utc;
use rusqlite::{Connection, params};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::domain::LeaseError;

pub const SCHEMA_VERSION: i64 = 2;

/// Busy timeout handed to SQLite itself; retries beyond it are ours.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Open (or create) a database file and bring its schema up to date.
pub fn open_connection(path: impl AsRef<Path>) -> Result<Connection, LeaseError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path).map_err(|e| {
        LeaseError::BackendUnavailable(format!(
            "cannot open sqlite database at {}: {e}",
            path.display()
        ))
    })?;
    configure(&conn)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    ensure_schema(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema (tests, dry runs).
pub fn open_in_memory() -> Result<Connection, LeaseError> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    ensure_schema(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<(), LeaseError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.set_prepared_statement_cache_capacity(64);
    Ok(())
}

pub fn ensure_schema(conn: &Connection) -> Result<(), LeaseError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at INTEGER NOT NULL
        );
        "#,
    )?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |r| r.get(0),
    )?;
    if current > SCHEMA_VERSION {
        return Err(LeaseError::BackendUnavailable(format!(
            "database schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if current < 1 {
        apply_v1(conn)?;
        record(conn, 1, "tasks_leases_events")?;
    }
    if current < 2 {
        apply_v2(conn)?;
        record(conn, 2, "file_reservations_heartbeats_queue")?;
    }
    debug!(from = current, to = SCHEMA_VERSION, "sqlite schema ready");
    Ok(())
}

fn record(conn: &Connection, version: i64, name: &str) -> Result<(), LeaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![version, name, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

fn apply_v1(conn: &Connection) -> Result<(), LeaseError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
          id TEXT PRIMARY KEY,
          state TEXT NOT NULL,
          priority INTEGER NOT NULL DEFAULT 100,
          attempts INTEGER NOT NULL DEFAULT 0,
          payload_json TEXT NOT NULL DEFAULT '{}',
          created_at INTEGER NOT NULL,
          updated_at INTEGER NOT NULL,
          policy_label TEXT NOT NULL DEFAULT 'private',
          resource_kind TEXT NOT NULL DEFAULT 'task'
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_ready
          ON tasks(state, priority, created_at);

        CREATE TABLE IF NOT EXISTS leases (
          task_id TEXT PRIMARY KEY REFERENCES tasks(id),
          agent_id TEXT NOT NULL,
          lease_expires_at INTEGER NOT NULL,
          attempt INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_leases_expiry ON leases(lease_expires_at);

        CREATE TABLE IF NOT EXISTS events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          task_id TEXT NOT NULL,
          ts INTEGER NOT NULL,
          kind TEXT NOT NULL,
          data_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id, ts, id);
        CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
        CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
        "#,
    )?;
    Ok(())
}

fn apply_v2(conn: &Connection) -> Result<(), LeaseError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS file_reservations (
          id TEXT PRIMARY KEY,
          file_path TEXT NOT NULL UNIQUE,
          agent_id TEXT NOT NULL,
          created_at INTEGER NOT NULL,
          expires_at INTEGER NOT NULL,
          status TEXT NOT NULL,
          reason TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_file_reservations_expiry
          ON file_reservations(status, expires_at);

        CREATE TABLE IF NOT EXISTS heartbeats (
          agent_id TEXT PRIMARY KEY,
          role TEXT,
          task_id TEXT,
          phase TEXT,
          safe_to_interrupt INTEGER NOT NULL DEFAULT 1,
          last_seen INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS message_queue (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          id TEXT NOT NULL UNIQUE,
          enqueued_at INTEGER NOT NULL,
          body_json TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
