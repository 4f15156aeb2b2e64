//! EventLog - 追記専用の型付き監査ログ
//!
//! ベストエフォート：書き込み失敗はログに出して握りつぶし、読み込み失敗は空を返す。
//! リースの正しさはこのログに依存しない。
//!
//! `&Connection` を受け取るので、スケジューラのトランザクション内
//! （`Transaction` は `Connection` に deref する）でも単独でも使える。

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use tracing::warn;

use crate::domain::lease::SYNTHETIC_PREFIX;
use crate::domain::{EventKind, EventPayload, EventRecord, LeaseError};

const EVENT_COLUMNS: &str = "id, task_id, ts, kind, data_json";

pub struct EventLog<'c> {
    conn: &'c Connection,
}

impl<'c> EventLog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Append a typed event. Returns the new row id, or `None` if the write failed.
    pub fn append(&self, resource_id: &str, ts: DateTime<Utc>, payload: EventPayload) -> Option<i64> {
        let (kind, data) = match payload.into_parts() {
            Ok(parts) => parts,
            Err(err) => {
                warn!(resource_id, error = %err, "event payload could not be serialized");
                return None;
            }
        };
        self.insert(resource_id, ts, kind, &data)
    }

    /// Append untyped data after checking it against the payload shape of `kind`.
    pub fn append_raw(
        &self,
        resource_id: &str,
        ts: DateTime<Utc>,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Option<i64> {
        match EventPayload::from_parts(kind, data) {
            Ok(payload) => self.append(resource_id, ts, payload),
            Err(err) => {
                warn!(resource_id, %kind, error = %err, "rejected event with invalid payload");
                None
            }
        }
    }

    fn insert(
        &self,
        resource_id: &str,
        ts: DateTime<Utc>,
        kind: EventKind,
        data: &serde_json::Value,
    ) -> Option<i64> {
        let result = self
            .conn
            .prepare_cached(
                "INSERT INTO events (task_id, ts, kind, data_json) VALUES (?1, ?2, ?3, ?4)",
            )
            .and_then(|mut stmt| {
                stmt.execute(params![
                    resource_id,
                    ts.timestamp_millis(),
                    kind.as_str(),
                    data.to_string()
                ])
            });
        match result {
            Ok(_) => Some(self.conn.last_insert_rowid()),
            Err(err) => {
                warn!(resource_id, %kind, error = %err, "failed to append event");
                None
            }
        }
    }

    /// Events of one resource, oldest first (ts, then id on ties).
    pub fn task_events(&self, resource_id: &str) -> Vec<EventRecord> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE task_id = ?1 ORDER BY ts ASC, id ASC"
        );
        self.query(&sql, params![resource_id])
    }

    /// Latest events across all resources, newest first.
    pub fn all_events(&self, limit: usize) -> Vec<EventRecord> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY ts DESC, id DESC LIMIT ?1");
        self.query(&sql, params![limit_param(limit)])
    }

    /// Latest events of one kind, newest first.
    pub fn events_by_kind(&self, kind: EventKind, limit: usize) -> Vec<EventRecord> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE kind = ?1 ORDER BY ts DESC, id DESC LIMIT ?2"
        );
        self.query(&sql, params![kind.as_str(), limit_param(limit)])
    }

    /// Events with `start <= ts <= end`, oldest first.
    pub fn events_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<EventRecord> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE ts >= ?1 AND ts <= ?2 ORDER BY ts ASC, id ASC"
        );
        self.query(&sql, params![start.timestamp_millis(), end.timestamp_millis()])
    }

    /// Delete events of synthetic (file) resources older than `cutoff`.
    ///
    /// Task events are never pruned.
    pub fn prune_synthetic_before(&self, cutoff: DateTime<Utc>) -> Result<usize, LeaseError> {
        let deleted = self
            .conn
            .prepare_cached("DELETE FROM events WHERE substr(task_id, 1, ?1) = ?2 AND ts < ?3")?
            .execute(params![
                SYNTHETIC_PREFIX.len() as i64,
                SYNTHETIC_PREFIX,
                cutoff.timestamp_millis()
            ])?;
        Ok(deleted)
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Vec<EventRecord> {
        let result = self.conn.prepare_cached(sql).and_then(|mut stmt| {
            stmt.query_map(params, record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
        });
        match result {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "event query failed");
                Vec::new()
            }
        }
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        resource_id: row.get(1)?,
        ts: row.get(2)?,
        kind: row.get(3)?,
        data_json: row.get(4)?,
    })
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
