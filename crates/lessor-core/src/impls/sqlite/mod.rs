//! SQLite backend - トランザクションで相互排他を保証する正本
//!
//! 時刻はすべて epoch ミリ秒（INTEGER）で保存する。

pub mod runtime_state;
pub mod schema;

pub use self::runtime_state::SqliteRuntimeState;
pub use self::schema::{open_connection, open_in_memory};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{LeaseError, Task, TaskId, TaskState};

/// One connection per adapter instance; its statement cache lives with it.
pub type SharedConnection = Arc<Mutex<Connection>>;

pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

pub fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>, LeaseError> {
    conn.lock()
        .map_err(|_| LeaseError::BackendUnavailable("sqlite connection lock poisoned".to_string()))
}

pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) const TASK_COLUMNS: &str =
    "id, state, priority, attempts, payload_json, created_at, updated_at, policy_label";

/// Raw task row; mapped into `Task` outside the rusqlite closure so that
/// parse errors surface as `LeaseError`s.
pub(crate) struct TaskRow {
    id: String,
    state: String,
    priority: i64,
    attempts: i64,
    payload_json: String,
    created_at: i64,
    updated_at: i64,
    policy_label: String,
}

impl TaskRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            state: row.get(1)?,
            priority: row.get(2)?,
            attempts: row.get(3)?,
            payload_json: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            policy_label: row.get(7)?,
        })
    }

    pub(crate) fn into_task(self) -> Result<Task, LeaseError> {
        let state = self
            .state
            .parse::<TaskState>()
            .map_err(|e| LeaseError::Validation(format!("corrupt task row {}: {e}", self.id)))?;
        Ok(Task {
            id: TaskId::parse(self.id)?,
            state,
            priority: self.priority,
            attempts: self.attempts,
            payload: serde_json::from_str(&self.payload_json)?,
            created_at: from_ms(self.created_at),
            updated_at: from_ms(self.updated_at),
            policy_label: self.policy_label,
        })
    }
}

pub(crate) fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>, LeaseError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let row = conn
        .prepare_cached(&sql)?
        .query_row(params![id], TaskRow::from_row)
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

/// Current `(state, attempts)` of a row, if it exists.
pub(crate) fn load_state(conn: &Connection, id: &str) -> Result<Option<(TaskState, i64)>, LeaseError> {
    let row: Option<(String, i64)> = conn
        .prepare_cached("SELECT state, attempts FROM tasks WHERE id = ?1")?
        .query_row(params![id], |r| Ok((r.get(0)?, r.get(1)?)))
        .optional()?;
    match row {
        None => Ok(None),
        Some((state, attempts)) => {
            let state = state.parse::<TaskState>().map_err(|e| {
                LeaseError::Validation(format!("corrupt task row {id}: {e}"))
            })?;
            Ok(Some((state, attempts)))
        }
    }
}

/// Current lease row on a resource: `(agent_id, lease_expires_at, attempt)`.
pub(crate) fn load_lease(
    conn: &Connection,
    resource_id: &str,
) -> Result<Option<(String, DateTime<Utc>, i64)>, LeaseError> {
    let row: Option<(String, i64, i64)> = conn
        .prepare_cached("SELECT agent_id, lease_expires_at, attempt FROM leases WHERE task_id = ?1")?
        .query_row(params![resource_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .optional()?;
    Ok(row.map(|(agent, expires, attempt)| (agent, from_ms(expires), attempt)))
}
