//! LeaseScheduler - タスクの排他的な払い出しとライフサイクル
//!
//! すべての操作は `BEGIN IMMEDIATE` トランザクション 1 つの中で完結する。
//! 書き込みロックを最初に取るので、同じリソースを 2 人が同時に確保することはない。
//!
//! ライフサイクルイベント（CLAIMED / LEASED / RUNNING / VERIFYING / COMMITTED / ERROR）を
//! 出すのはこのモジュールだけ。上位層（Coordinator など）は再送しない。
//!
//! ロック競合（`LeaseError::Busy`）はそのまま呼び出し側へ返す。
//! リトライは RuntimeState アダプタの責務。

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::events::{ClaimData, ErrorData, LeaseExpiredData, StateChangeData};
use crate::domain::lease::{SYNTHETIC_FILE_LEASE, extended_expiry, lease_expiry, renewal_expiry};
use crate::domain::task::DEFAULT_POLICY_LABEL;
use crate::domain::{
    AgentId, Claim, EventPayload, ExpiryPolicy, Lease, LeaseError, LeaseRequest, NewTask,
    ReclaimedLease, ResourceRef, Task, TaskFailure, TaskId, TaskState, assert_transition,
};
use crate::event_log::EventLog;
use crate::impls::sqlite::{
    SharedConnection, TASK_COLUMNS, TaskRow, from_ms, load_lease, load_state, load_task, lock,
    to_ms,
};
use crate::observability::RuntimeStatus;
use crate::ports::Clock;
use crate::ports::runtime_state::HEARTBEAT_STALE_AFTER;
use crate::reservation::foreign_reservation;

/// Lease TTL used by `pick_next_task`.
pub const DEFAULT_TTL: Duration = Duration::seconds(30);

#[derive(Clone)]
pub struct LeaseScheduler {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl LeaseScheduler {
    pub fn new(conn: SharedConnection, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            clock,
            default_ttl: DEFAULT_TTL,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction; commit on `Ok`.
    pub(crate) fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, LeaseError>,
    ) -> Result<T, LeaseError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ========================================
    // タスクの登録・参照
    // ========================================

    /// Register a new task in READY.
    pub fn create_task(&self, new_task: NewTask) -> Result<Task, LeaseError> {
        let now = self.clock.now();
        self.transaction(|tx| {
            if load_state(tx, new_task.id.as_str())?.is_some() {
                return Err(LeaseError::Validation(format!(
                    "task {} already exists",
                    new_task.id
                )));
            }
            tx.prepare_cached(
                "INSERT INTO tasks (id, state, priority, attempts, payload_json, created_at, updated_at, policy_label, resource_kind)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5, ?6, 'task')",
            )?
            .execute(params![
                new_task.id.as_str(),
                TaskState::Ready.as_str(),
                new_task.priority,
                new_task.payload.to_string(),
                to_ms(now),
                new_task.policy_label,
            ])?;
            debug!(task_id = %new_task.id, priority = new_task.priority, "task created");
            load_task(tx, new_task.id.as_str())?
                .ok_or_else(|| LeaseError::NotFound(new_task.id.to_string()))
        })
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Option<Task>, LeaseError> {
        let conn = lock(&self.conn)?;
        load_task(&conn, id.as_str())
    }

    // ========================================
    // 払い出し
    // ========================================

    /// Sweep expired leases, then lease the best READY task to `agent_id`.
    ///
    /// Best = lowest `priority`, then earliest `created_at`. `None` when
    /// nothing is READY.
    pub fn reserve(&self, agent_id: &AgentId, ttl: Duration) -> Result<Option<Claim>, LeaseError> {
        let now = self.clock.now();
        let expires_at = lease_expiry(ttl, now)?;
        self.transaction(|tx| {
            reclaim_in(tx, now)?;
            claim_next_in(tx, agent_id, expires_at, now)
        })
    }

    /// `reserve` with the default TTL.
    pub fn pick_next_task(&self, agent_id: &AgentId) -> Result<Option<Claim>, LeaseError> {
        self.reserve(agent_id, self.default_ttl)
    }

    /// Lease one specific resource.
    ///
    /// Re-acquiring one's own lease extends it; a live foreign lease fails with
    /// `Conflict`. File paths are stored as synthetic task rows.
    pub fn acquire(&self, request: &LeaseRequest) -> Result<Lease, LeaseError> {
        request.resource.validate()?;
        let now = self.clock.now();
        let expires_at = lease_expiry(request.ttl, now)?;
        self.transaction(|tx| {
            reclaim_in(tx, now)?;
            acquire_in(tx, request, expires_at, now)
        })
    }

    /// Drop the caller's lease on `resource`. Returns false when the caller
    /// holds nothing there.
    pub fn release(&self, resource: &ResourceRef, agent_id: &str) -> Result<bool, LeaseError> {
        let now = self.clock.now();
        self.transaction(|tx| release_in(tx, resource, agent_id, now))
    }

    // ========================================
    // 更新
    // ========================================

    /// Extend the lease of `(task_id, agent_id)`.
    ///
    /// Does not look at the current expiry, so an expired but not yet
    /// reclaimed lease is revived. Prefer `renew_checked`.
    pub fn renew(&self, task_id: &TaskId, agent_id: &AgentId, ttl: Duration) -> Result<bool, LeaseError> {
        let now = self.clock.now();
        let Some(expires_at) = renewal_expiry(task_id.as_str(), agent_id.as_str(), ttl, now)? else {
            return Ok(false);
        };
        let conn = lock(&self.conn)?;
        let changed = conn
            .prepare_cached(
                "UPDATE leases SET lease_expires_at = ?1 WHERE task_id = ?2 AND agent_id = ?3",
            )?
            .execute(params![to_ms(expires_at), task_id.as_str(), agent_id.as_str()])?;
        Ok(changed > 0)
    }

    /// Extend an unexpired lease held by `agent_id` on `resource`.
    ///
    /// Empty ids are an error. Non-positive or overflowing TTLs, a missing
    /// `(resource, agent)` lease and an expired lease all return `Ok(false)`.
    pub fn renew_checked(
        &self,
        resource: &ResourceRef,
        agent_id: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let now = self.clock.now();
        let key = resource.storage_key();
        if renewal_expiry(&key, agent_id, ttl, now)?.is_none() {
            debug!(resource = %resource, agent_id, "renew rejected: bad ttl");
            return Ok(false);
        }
        let conn = lock(&self.conn)?;
        renew_checked_in(&conn, &key, agent_id, ttl, now)
    }

    // ========================================
    // 状態遷移
    // ========================================

    pub fn start(&self, task_id: &TaskId) -> Result<(), LeaseError> {
        self.advance(task_id, None, TaskState::Running)
    }

    pub fn verifying(&self, task_id: &TaskId) -> Result<(), LeaseError> {
        self.advance(task_id, None, TaskState::Verifying)
    }

    pub fn committed(&self, task_id: &TaskId) -> Result<(), LeaseError> {
        self.advance(task_id, None, TaskState::Committed)
    }

    /// `start` / `verifying` / `committed` on behalf of `agent_id`.
    ///
    /// The task must be under a live lease held by `agent_id`, otherwise
    /// `NotOwned` is returned and nothing is written. `to` other than
    /// RUNNING / VERIFYING / COMMITTED is a validation error.
    pub fn advance_held(&self, task_id: &TaskId, agent_id: &str, to: TaskState) -> Result<(), LeaseError> {
        match to {
            TaskState::Running | TaskState::Verifying | TaskState::Committed => {
                self.advance(task_id, Some(agent_id), to)
            }
            other => Err(LeaseError::Validation(format!(
                "{other} is not reachable by an agent message"
            ))),
        }
    }

    /// COMMITTED → DONE. The lease is no longer needed.
    pub fn complete(&self, task_id: &TaskId) -> Result<(), LeaseError> {
        let now = self.clock.now();
        self.transaction(|tx| {
            let from = current_state(tx, task_id)?;
            set_state(tx, task_id.as_str(), from, TaskState::Done, now)?;
            delete_lease(tx, task_id.as_str())?;
            debug!(task_id = %task_id, "task done");
            Ok(())
        })
    }

    /// ROLLBACK → READY (`retry`) or DEAD.
    pub fn resolve_rollback(&self, task_id: &TaskId, retry: bool) -> Result<TaskState, LeaseError> {
        let now = self.clock.now();
        let to = if retry { TaskState::Ready } else { TaskState::Dead };
        self.transaction(|tx| {
            let from = current_state(tx, task_id)?;
            set_state(tx, task_id.as_str(), from, to, now)?;
            delete_lease(tx, task_id.as_str())?;
            debug!(task_id = %task_id, to = %to, "rollback resolved");
            Ok(to)
        })
    }

    fn advance(&self, task_id: &TaskId, holder: Option<&str>, to: TaskState) -> Result<(), LeaseError> {
        let now = self.clock.now();
        self.transaction(|tx| {
            let from = current_state(tx, task_id)?;
            if let Some(agent_id) = holder {
                ensure_held(tx, task_id.as_str(), agent_id, now)?;
            }
            set_state(tx, task_id.as_str(), from, to, now)?;
            let change = StateChangeData { from, to };
            let payload = match to {
                TaskState::Running => EventPayload::Running(change),
                TaskState::Verifying => EventPayload::Verifying(change),
                _ => EventPayload::Committed(change),
            };
            EventLog::new(tx).append(task_id.as_str(), now, payload);
            debug!(task_id = %task_id, from = %from, to = %to, "task advanced");
            Ok(())
        })
    }

    /// Record a task failure.
    ///
    /// The ERROR event is always written. Unless `context.retryable == true`
    /// the task then moves to ROLLBACK; when that edge is illegal from the
    /// current state, the event is kept, the state is left alone and the
    /// violation is returned.
    pub fn error(
        &self,
        task_id: &TaskId,
        failure: &TaskFailure,
        context: serde_json::Value,
    ) -> Result<TaskState, LeaseError> {
        let now = self.clock.now();
        let retryable = context.get("retryable").and_then(serde_json::Value::as_bool) == Some(true);
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        EventLog::new(&tx).append(
            task_id.as_str(),
            now,
            EventPayload::Error(ErrorData {
                message: failure.message.clone(),
                name: failure.name.clone(),
                stack: failure.stack.clone(),
                context,
            }),
        );
        let outcome = match load_state(&tx, task_id.as_str())? {
            None => Err(LeaseError::NotFound(task_id.to_string())),
            Some((state, _)) if retryable => Ok(state),
            Some((from, _)) => match assert_transition(from, TaskState::Rollback, task_id.as_str()) {
                Some(violation) => {
                    warn!(%violation, "error left task state unchanged");
                    Err(LeaseError::IllegalTransition(violation))
                }
                None => {
                    write_state(&tx, task_id.as_str(), TaskState::Rollback, now)?;
                    Ok(TaskState::Rollback)
                }
            },
        };
        tx.commit()?;
        outcome
    }

    // ========================================
    // 回収
    // ========================================

    /// Reclaim every lease with `lease_expires_at <= now`.
    ///
    /// Idempotent: a second call with the same `now` reclaims nothing.
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<ReclaimedLease>, LeaseError> {
        self.transaction(|tx| reclaim_in(tx, now))
    }

    pub fn status(&self) -> Result<RuntimeStatus, LeaseError> {
        let now = self.clock.now();
        let conn = lock(&self.conn)?;
        status_in(&conn, now)
    }
}

// ========================================
// トランザクション内ヘルパ（アダプタと共有）
// ========================================

fn current_state(conn: &Connection, task_id: &TaskId) -> Result<TaskState, LeaseError> {
    load_state(conn, task_id.as_str())?
        .map(|(state, _)| state)
        .ok_or_else(|| LeaseError::NotFound(task_id.to_string()))
}

/// Validate and persist `from → to`.
fn set_state(
    conn: &Connection,
    id: &str,
    from: TaskState,
    to: TaskState,
    now: DateTime<Utc>,
) -> Result<(), LeaseError> {
    if let Some(violation) = assert_transition(from, to, id) {
        return Err(LeaseError::IllegalTransition(violation));
    }
    write_state(conn, id, to, now)
}

fn write_state(conn: &Connection, id: &str, to: TaskState, now: DateTime<Utc>) -> Result<(), LeaseError> {
    conn.prepare_cached("UPDATE tasks SET state = ?1, updated_at = ?2 WHERE id = ?3")?
        .execute(params![to.as_str(), to_ms(now), id])?;
    Ok(())
}

fn delete_lease(conn: &Connection, resource_id: &str) -> Result<usize, LeaseError> {
    Ok(conn
        .prepare_cached("DELETE FROM leases WHERE task_id = ?1")?
        .execute(params![resource_id])?)
}

/// Lease a row that currently has no lease. Emits CLAIMED and LEASED.
fn claim_row(
    conn: &Connection,
    id: &str,
    agent_id: &AgentId,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<i64, LeaseError> {
    let (from, attempts) =
        load_state(conn, id)?.ok_or_else(|| LeaseError::NotFound(id.to_string()))?;
    if let Some(violation) = assert_transition(from, TaskState::Leased, id) {
        return Err(LeaseError::IllegalTransition(violation));
    }
    let attempt = attempts + 1;
    conn.prepare_cached(
        "UPDATE tasks SET state = ?1, attempts = ?2, updated_at = ?3 WHERE id = ?4",
    )?
    .execute(params![TaskState::Leased.as_str(), attempt, to_ms(now), id])?;
    conn.prepare_cached(
        "INSERT INTO leases (task_id, agent_id, lease_expires_at, attempt) VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![id, agent_id.as_str(), to_ms(expires_at), attempt])?;

    let log = EventLog::new(conn);
    let data = ClaimData {
        agent_id: agent_id.to_string(),
        attempt,
    };
    log.append(id, now, EventPayload::Claimed(data.clone()));
    log.append(id, now, EventPayload::Leased(data));
    debug!(resource_id = id, agent_id = %agent_id, attempt, "lease granted");
    Ok(attempt)
}

pub(crate) fn claim_next_in(
    conn: &Connection,
    agent_id: &AgentId,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<Claim>, LeaseError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE state = 'READY' AND resource_kind = 'task'
         ORDER BY priority ASC, created_at ASC, id ASC
         LIMIT 1"
    );
    let row = conn
        .prepare_cached(&sql)?
        .query_row([], TaskRow::from_row)
        .optional()?;
    let Some(candidate) = row.map(TaskRow::into_task).transpose()? else {
        return Ok(None);
    };

    let attempt = claim_row(conn, candidate.id.as_str(), agent_id, expires_at, now)?;
    let task = load_task(conn, candidate.id.as_str())?
        .ok_or_else(|| LeaseError::NotFound(candidate.id.to_string()))?;
    Ok(Some(Claim {
        task,
        attempt,
        lease_expires_at: expires_at,
    }))
}

/// Synthetic task row standing in for a file path.
fn ensure_held(conn: &Connection, key: &str, agent_id: &str, now: DateTime<Utc>) -> Result<(), LeaseError> {
    match load_lease(conn, key)? {
        Some((holder, expires_at, _)) if holder == agent_id && expires_at > now => Ok(()),
        Some((holder, expires_at, _)) if expires_at > now => Err(LeaseError::NotOwned {
            resource: key.to_string(),
            holder,
        }),
        _ => Err(LeaseError::NotOwned {
            resource: key.to_string(),
            holder: "none".to_string(),
        }),
    }
}

fn ensure_synthetic_row(
    conn: &Connection,
    id: &str,
    file_path: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), LeaseError> {
    let payload = json!({
        "type": SYNTHETIC_FILE_LEASE,
        "file_path": file_path,
        "reason": reason,
    });
    conn.prepare_cached(
        "INSERT INTO tasks (id, state, priority, attempts, payload_json, created_at, updated_at, policy_label, resource_kind)
         VALUES (?1, 'READY', 0, 0, ?2, ?3, ?3, ?4, 'file')
         ON CONFLICT(id) DO UPDATE SET payload_json = excluded.payload_json",
    )?
    .execute(params![id, payload.to_string(), to_ms(now), DEFAULT_POLICY_LABEL])?;
    Ok(())
}

pub(crate) fn acquire_in(
    conn: &Connection,
    request: &LeaseRequest,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Lease, LeaseError> {
    let key = request.resource.storage_key();
    if let ResourceRef::FilePath(path) = &request.resource
        && let Some(conflict) = foreign_reservation(conn, path, request.agent_id.as_str(), now)?
    {
        return Err(conflict.into_error());
    }
    // 直前に回収済みなので、残っている行はすべて有効
    match load_lease(conn, &key)? {
        Some((holder, current, attempt)) if holder == request.agent_id.as_str() => {
            let extended = current.max(expires_at);
            conn.prepare_cached("UPDATE leases SET lease_expires_at = ?1 WHERE task_id = ?2")?
                .execute(params![to_ms(extended), key])?;
            debug!(resource = %request.resource, agent_id = %request.agent_id, "lease extended");
            Ok(Lease {
                resource: request.resource.clone(),
                agent_id: request.agent_id.clone(),
                lease_expires_at: extended,
                attempt,
            })
        }
        Some((holder, current, _)) => Err(LeaseError::Conflict {
            resource: request.resource.to_string(),
            holder,
            expires_at: current,
        }),
        None => {
            if let ResourceRef::FilePath(path) = &request.resource {
                ensure_synthetic_row(conn, &key, path, request.reason.as_deref(), now)?;
            }
            let attempt = claim_row(conn, &key, &request.agent_id, expires_at, now)?;
            Ok(Lease {
                resource: request.resource.clone(),
                agent_id: request.agent_id.clone(),
                lease_expires_at: expires_at,
                attempt,
            })
        }
    }
}

pub(crate) fn release_in(
    conn: &Connection,
    resource: &ResourceRef,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, LeaseError> {
    let key = resource.storage_key();
    match load_lease(conn, &key)? {
        Some((holder, _, _)) if holder == agent_id => {
            delete_lease(conn, &key)?;
            reset_to_ready(conn, &key, now)?;
            debug!(resource = %resource, agent_id, "lease released");
            Ok(true)
        }
        _ => Ok(false),
    }
}

pub(crate) fn renew_checked_in(
    conn: &Connection,
    key: &str,
    agent_id: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<bool, LeaseError> {
    let Some((holder, current, _)) = load_lease(conn, key)? else {
        return Ok(false);
    };
    if holder != agent_id || current <= now {
        return Ok(false);
    }
    let Some(expires_at) = extended_expiry(current, now, ttl) else {
        return Ok(false);
    };
    // 読み取り後に他の書き込みが入っていたら何もしない
    let changed = conn
        .prepare_cached(
            "UPDATE leases SET lease_expires_at = ?1
             WHERE task_id = ?2 AND agent_id = ?3 AND lease_expires_at = ?4",
        )?
        .execute(params![to_ms(expires_at), key, agent_id, to_ms(current)])?;
    Ok(changed > 0)
}

/// LEASED / RUNNING rows go back to READY; other states keep theirs.
fn reset_to_ready(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<(), LeaseError> {
    if let Some((state, _)) = load_state(conn, id)?
        && matches!(state, TaskState::Leased | TaskState::Running)
        && assert_transition(state, TaskState::Ready, id).is_none()
    {
        write_state(conn, id, TaskState::Ready, now)?;
    }
    Ok(())
}

pub(crate) fn reclaim_in(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<ReclaimedLease>, LeaseError> {
    let expired: Vec<(String, String, i64, i64)> = conn
        .prepare_cached(
            "SELECT task_id, agent_id, lease_expires_at, attempt FROM leases
             WHERE lease_expires_at <= ?1 ORDER BY lease_expires_at ASC, task_id ASC",
        )?
        .query_map(params![to_ms(now)], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let log = EventLog::new(conn);
    let mut reclaimed = Vec::with_capacity(expired.len());
    for (resource_id, agent_id, expires_ms, attempt) in expired {
        let overdue_ms = to_ms(now) - expires_ms;
        let policy = ExpiryPolicy::for_overdue(Duration::milliseconds(overdue_ms));
        reset_to_ready(conn, &resource_id, now)?;
        delete_lease(conn, &resource_id)?;
        log.append(
            &resource_id,
            now,
            EventPayload::LeaseExpired(LeaseExpiredData {
                agent_id: agent_id.clone(),
                attempt,
                lease_expires_at: expires_ms,
                overdue_ms,
                policy,
            }),
        );
        reclaimed.push(ReclaimedLease {
            resource_id,
            agent_id,
            attempt,
            lease_expires_at: from_ms(expires_ms),
            overdue_ms,
            policy,
        });
    }
    if !reclaimed.is_empty() {
        info!(count = reclaimed.len(), "reclaimed expired leases");
    }
    Ok(reclaimed)
}

pub(crate) fn status_in(conn: &Connection, now: DateTime<Utc>) -> Result<RuntimeStatus, LeaseError> {
    let mut status = RuntimeStatus::default();
    let per_state: Vec<(String, i64)> = conn
        .prepare_cached(
            "SELECT state, COUNT(*) FROM tasks WHERE resource_kind = 'task' GROUP BY state",
        )?
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    for (state, count) in per_state {
        status.tasks.insert(state, count_usize(count));
    }

    let count = |sql: &str, param: i64| -> Result<usize, LeaseError> {
        let n: i64 = conn.prepare_cached(sql)?.query_row(params![param], |r| r.get(0))?;
        Ok(count_usize(n))
    };
    let now_ms = to_ms(now);
    status.active_leases = count(
        "SELECT COUNT(*) FROM leases l JOIN tasks t ON t.id = l.task_id
         WHERE t.resource_kind = 'task' AND l.lease_expires_at > ?1",
        now_ms,
    )?;
    status.active_file_reservations = count(
        "SELECT COUNT(*) FROM leases l JOIN tasks t ON t.id = l.task_id
         WHERE t.resource_kind = 'file' AND l.lease_expires_at > ?1",
        now_ms,
    )? + count(
        "SELECT COUNT(*) FROM file_reservations WHERE status = 'active' AND expires_at > ?1",
        now_ms,
    )?;
    status.live_heartbeats = count(
        "SELECT COUNT(*) FROM heartbeats WHERE last_seen > ?1",
        to_ms(now - HEARTBEAT_STALE_AFTER),
    )?;
    let queued: i64 = conn
        .prepare_cached("SELECT COUNT(*) FROM message_queue")?
        .query_row([], |r| r.get(0))?;
    status.queued_messages = count_usize(queued);
    Ok(status)
}

fn count_usize(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}
