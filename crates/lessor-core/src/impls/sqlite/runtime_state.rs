//! SqliteRuntimeState - トランザクション backend
//!
//! 各操作は `spawn_blocking` 上で 1 トランザクションとして実行する。
//! `LeaseError::Busy`（ロック競合）だけを `RetryPolicy` に従って再試行し、
//! 待ちは `tokio::time::sleep`（スピンしない）。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use ulid::Ulid;

use super::{from_ms, lock, open_connection, open_in_memory, shared, to_ms};
use crate::domain::{
    Heartbeat, Lease, LeaseError, LeaseRequest, ProtocolMessage, QueuedMessage, ResourceRef,
};
use crate::event_log::EventLog;
use crate::observability::RuntimeStatus;
use crate::ports::runtime_state::{HEARTBEAT_STALE_AFTER, SYNTHETIC_EVENT_RETENTION};
use crate::ports::{BackendKind, Clock, RefreshReport, RuntimeState};
use crate::retry::RetryPolicy;
use crate::scheduler::{LeaseScheduler, reclaim_in};

pub struct SqliteRuntimeState {
    scheduler: LeaseScheduler,
    retry: RetryPolicy,
}

impl SqliteRuntimeState {
    pub fn new(scheduler: LeaseScheduler) -> Self {
        Self {
            scheduler,
            retry: RetryPolicy::default_busy(),
        }
    }

    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, LeaseError> {
        let conn = open_connection(path)?;
        Ok(Self::new(LeaseScheduler::new(shared(conn), clock)))
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, LeaseError> {
        Ok(Self::new(LeaseScheduler::new(shared(open_in_memory()?), clock)))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.scheduler = self.scheduler.with_default_ttl(ttl);
        self
    }

    /// The scheduler behind this adapter (same connection).
    pub fn scheduler(&self) -> &LeaseScheduler {
        &self.scheduler
    }

    /// Run a blocking store operation, retrying only on lock contention.
    async fn with_retry<T, F>(&self, op: &'static str, f: F) -> Result<T, LeaseError>
    where
        T: Send + 'static,
        F: Fn(&LeaseScheduler) -> Result<T, LeaseError> + Clone + Send + 'static,
    {
        let mut retry = 0;
        loop {
            let scheduler = self.scheduler.clone();
            let attempt = f.clone();
            let result = tokio::task::spawn_blocking(move || attempt(&scheduler))
                .await
                .map_err(|e| LeaseError::BackendUnavailable(format!("{op}: blocking task failed: {e}")))?;
            match result {
                Err(err) if err.is_retryable() && retry < self.retry.max_retries => {
                    retry += 1;
                    let delay = self.retry.jittered_delay(retry);
                    warn!(op, retry, delay_ms = delay.as_millis() as u64, error = %err, "store busy, backing off");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl RuntimeState for SqliteRuntimeState {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn enqueue(&self, message: ProtocolMessage) -> Result<QueuedMessage, LeaseError> {
        self.with_retry("enqueue", move |s| {
            let queued = QueuedMessage {
                id: format!("msg-{}", Ulid::new()),
                enqueued_at: s.now(),
                message: message.clone(),
            };
            let conn = lock(s.connection())?;
            enqueue_in(&conn, &queued)?;
            Ok(queued)
        })
        .await
    }

    async fn dequeue(&self) -> Result<Option<QueuedMessage>, LeaseError> {
        self.with_retry("dequeue", |s| s.transaction(|tx| dequeue_in(tx)))
            .await
    }

    async fn acquire_lease(&self, request: LeaseRequest) -> Result<Lease, LeaseError> {
        self.with_retry("acquire_lease", move |s| s.acquire(&request))
            .await
    }

    async fn release_lease(&self, resource: &ResourceRef, agent_id: &str) -> Result<bool, LeaseError> {
        let resource = resource.clone();
        let agent_id = agent_id.to_string();
        self.with_retry("release_lease", move |s| s.release(&resource, &agent_id))
            .await
    }

    async fn upsert_heartbeat(&self, heartbeat: Heartbeat) -> Result<(), LeaseError> {
        if heartbeat.agent_id.trim().is_empty() {
            return Err(LeaseError::Validation(
                "agent_id must be a non-empty string".to_string(),
            ));
        }
        self.with_retry("upsert_heartbeat", move |s| {
            let conn = lock(s.connection())?;
            upsert_heartbeat_in(&conn, &heartbeat)
        })
        .await
    }

    async fn refresh(&self) -> Result<RefreshReport, LeaseError> {
        let report = self
            .with_retry("refresh", |s| {
                let now = s.now();
                s.transaction(|tx| {
                    let leases_expired = reclaim_in(tx, now)?.len();
                    let heartbeats_pruned = tx
                        .prepare_cached("DELETE FROM heartbeats WHERE last_seen < ?1")?
                        .execute(params![to_ms(now - HEARTBEAT_STALE_AFTER)])?;
                    let events_pruned =
                        EventLog::new(tx).prune_synthetic_before(now - SYNTHETIC_EVENT_RETENTION)?;
                    Ok(RefreshReport {
                        leases_expired,
                        heartbeats_pruned,
                        events_pruned,
                    })
                })
            })
            .await?;
        debug!(?report, "sqlite runtime refreshed");
        Ok(report)
    }

    async fn renew(&self, resource: &ResourceRef, agent_id: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let resource = resource.clone();
        let agent_id = agent_id.to_string();
        self.with_retry("renew", move |s| s.renew_checked(&resource, &agent_id, ttl))
            .await
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<usize, LeaseError> {
        self.with_retry("expire_leases", move |s| Ok(s.reclaim_expired(now)?.len()))
            .await
    }

    async fn status(&self) -> Result<RuntimeStatus, LeaseError> {
        self.with_retry("status", |s| s.status()).await
    }
}

fn enqueue_in(conn: &Connection, queued: &QueuedMessage) -> Result<(), LeaseError> {
    conn.prepare_cached(
        "INSERT INTO message_queue (id, enqueued_at, body_json) VALUES (?1, ?2, ?3)",
    )?
    .execute(params![
        queued.id,
        to_ms(queued.enqueued_at),
        serde_json::to_string(&queued.message)?
    ])?;
    debug!(id = %queued.id, kind = queued.message.type_name(), "message enqueued");
    Ok(())
}

fn dequeue_in(conn: &Connection) -> Result<Option<QueuedMessage>, LeaseError> {
    let row: Option<(i64, String, i64, String)> = conn
        .prepare_cached(
            "SELECT seq, id, enqueued_at, body_json FROM message_queue ORDER BY seq ASC LIMIT 1",
        )?
        .query_row([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .optional()?;
    let Some((seq, id, enqueued_at, body)) = row else {
        return Ok(None);
    };
    conn.prepare_cached("DELETE FROM message_queue WHERE seq = ?1")?
        .execute(params![seq])?;
    Ok(Some(QueuedMessage {
        id,
        enqueued_at: from_ms(enqueued_at),
        message: serde_json::from_str(&body)?,
    }))
}

fn upsert_heartbeat_in(conn: &Connection, heartbeat: &Heartbeat) -> Result<(), LeaseError> {
    conn.prepare_cached(
        "INSERT INTO heartbeats (agent_id, role, task_id, phase, safe_to_interrupt, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(agent_id) DO UPDATE SET
           role = excluded.role,
           task_id = excluded.task_id,
           phase = excluded.phase,
           safe_to_interrupt = excluded.safe_to_interrupt,
           last_seen = excluded.last_seen",
    )?
    .execute(params![
        heartbeat.agent_id,
        heartbeat.role,
        heartbeat.task_id,
        heartbeat.phase,
        heartbeat.safe_to_interrupt,
        to_ms(heartbeat.last_seen),
    ])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::ClaimData;
    use crate::domain::{AgentId, EventPayload, NewTask, TaskId, synthetic_id};
    use crate::impls::sqlite::load_lease;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn aid(id: &str) -> AgentId {
        AgentId::parse(id).unwrap()
    }

    fn setup() -> (SqliteRuntimeState, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        (SqliteRuntimeState::in_memory(clock.clone()).unwrap(), clock)
    }

    fn file_request(path: &str, agent: &str, secs: i64) -> LeaseRequest {
        LeaseRequest::new(ResourceRef::file(path), aid(agent), Duration::seconds(secs))
    }

    #[tokio::test]
    async fn file_lease_conflict_names_holder_and_expiry() {
        let (runtime, clock) = setup();
        runtime.acquire_lease(file_request("/f.txt", "agent-a", 60)).await.unwrap();

        clock.set(t0() + Duration::seconds(10));
        let err = runtime
            .acquire_lease(file_request("/f.txt", "agent-b", 60))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "/f.txt is leased by agent-a until 2024-01-01T12:01:00.000Z"
        );

        clock.set(t0() + Duration::seconds(61));
        let lease = runtime.acquire_lease(file_request("/f.txt", "agent-b", 60)).await.unwrap();
        assert_eq!(lease.agent_id.as_str(), "agent-b");
    }

    #[tokio::test]
    async fn renew_follows_strict_rules() {
        let (runtime, clock) = setup();
        let resource = ResourceRef::file("/f.txt");
        runtime.acquire_lease(file_request("/f.txt", "agent-a", 10)).await.unwrap();

        assert!(runtime.renew(&resource, "agent-a", Duration::seconds(10)).await.unwrap());
        assert!(!runtime.renew(&resource, "agent-b", Duration::seconds(10)).await.unwrap());
        assert!(!runtime.renew(&resource, "agent-a", Duration::zero()).await.unwrap());
        assert!(!runtime.renew(&resource, "agent-a", Duration::MAX).await.unwrap());
        assert!(runtime.renew(&resource, "", Duration::seconds(1)).await.is_err());

        // renewed once, so the lease runs until t0 + 20s
        clock.advance(Duration::seconds(21));
        assert!(!runtime.renew(&resource, "agent-a", Duration::seconds(10)).await.unwrap());
    }

    #[tokio::test]
    async fn short_renew_still_moves_expiry_forward() {
        let (runtime, _) = setup();
        let resource = ResourceRef::file("/f.txt");
        let lease = runtime.acquire_lease(file_request("/f.txt", "agent-a", 60)).await.unwrap();

        assert!(runtime.renew(&resource, "agent-a", Duration::seconds(1)).await.unwrap());
        let conn = lock(runtime.scheduler().connection()).unwrap();
        let (_, expires, _) = load_lease(&conn, &resource.storage_key()).unwrap().unwrap();
        assert_eq!(expires, lease.lease_expires_at + Duration::seconds(1));
    }

    #[tokio::test]
    async fn release_then_expire() {
        let (runtime, clock) = setup();
        let resource = ResourceRef::file("/f.txt");
        runtime.acquire_lease(file_request("/f.txt", "agent-a", 10)).await.unwrap();
        assert!(!runtime.release_lease(&resource, "agent-b").await.unwrap());
        assert!(runtime.release_lease(&resource, "agent-a").await.unwrap());

        runtime.acquire_lease(file_request("/g.txt", "agent-a", 1)).await.unwrap();
        clock.advance(Duration::seconds(2));
        assert_eq!(runtime.expire_leases(clock.now()).await.unwrap(), 1);
        assert_eq!(runtime.expire_leases(clock.now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let (runtime, _) = setup();
        for agent in ["a", "b"] {
            runtime
                .enqueue(ProtocolMessage::TaskClaim {
                    agent_id: agent.to_string(),
                    ttl_ms: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(runtime.status().await.unwrap().queued_messages, 2);

        let first = runtime.dequeue().await.unwrap().unwrap();
        assert_eq!(first.message.agent_id(), "a");
        let second = runtime.dequeue().await.unwrap().unwrap();
        assert_eq!(second.message.agent_id(), "b");
        assert!(runtime.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_prunes_stale_heartbeats_and_old_synthetic_events() {
        let (runtime, _) = setup();
        runtime
            .upsert_heartbeat(Heartbeat::new("old", t0() - Duration::minutes(20)))
            .await
            .unwrap();
        runtime
            .upsert_heartbeat(Heartbeat::new("fresh", t0()).with_phase("editing", false))
            .await
            .unwrap();
        {
            let conn = lock(runtime.scheduler().connection()).unwrap();
            let log = EventLog::new(&conn);
            let claimed = EventPayload::Claimed(ClaimData {
                agent_id: "a".to_string(),
                attempt: 1,
            });
            log.append(&synthetic_id("/old"), t0() - Duration::days(8), claimed.clone());
            log.append("T1", t0() - Duration::days(8), claimed);
        }

        let report = runtime.refresh().await.unwrap();
        assert_eq!(report.heartbeats_pruned, 1);
        assert_eq!(report.events_pruned, 1);
        assert_eq!(report.leases_expired, 0);
        assert_eq!(runtime.status().await.unwrap().live_heartbeats, 1);

        // idempotent
        assert_eq!(runtime.refresh().await.unwrap(), RefreshReport::default());
    }

    #[tokio::test]
    async fn heartbeat_upsert_overwrites() {
        let (runtime, _) = setup();
        runtime.upsert_heartbeat(Heartbeat::new("a", t0())).await.unwrap();
        runtime
            .upsert_heartbeat(Heartbeat::new("a", t0()).with_task("T1"))
            .await
            .unwrap();
        let conn = lock(runtime.scheduler().connection()).unwrap();
        let (count, task): (i64, Option<String>) = conn
            .query_row("SELECT COUNT(*), MAX(task_id) FROM heartbeats", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(task.as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn empty_heartbeat_agent_is_rejected() {
        let (runtime, _) = setup();
        assert!(matches!(
            runtime.upsert_heartbeat(Heartbeat::new(" ", t0())).await,
            Err(LeaseError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn task_resources_share_the_scheduler_tables() {
        let (runtime, _) = setup();
        runtime
            .scheduler()
            .create_task(NewTask::new(TaskId::parse("T1").unwrap()))
            .unwrap();
        let resource = ResourceRef::task(TaskId::parse("T1").unwrap());
        let lease = runtime
            .acquire_lease(LeaseRequest::new(resource, aid("a"), Duration::seconds(5)))
            .await
            .unwrap();
        assert_eq!(lease.attempt, 1);
        assert!(runtime.scheduler().pick_next_task(&aid("b")).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_store_is_retried_until_the_writer_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.db");
        let runtime = SqliteRuntimeState::open(&path, Arc::new(crate::ports::SystemClock)).unwrap();

        let holder = open_connection(&path).unwrap();
        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let writer = std::thread::spawn(move || {
            holder.execute_batch("BEGIN IMMEDIATE").unwrap();
            let _ = locked_tx.send(());
            std::thread::sleep(std::time::Duration::from_millis(400));
            holder.execute_batch("COMMIT").unwrap();
        });
        locked_rx.await.unwrap();

        let lease = runtime
            .acquire_lease(file_request("/busy.txt", "agent-a", 30))
            .await
            .unwrap();
        assert_eq!(lease.attempt, 1);
        writer.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_store_without_retries_surfaces_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.db");
        let runtime = SqliteRuntimeState::open(&path, Arc::new(crate::ports::SystemClock))
            .unwrap()
            .with_retry_policy(RetryPolicy::none());

        let holder = open_connection(&path).unwrap();
        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let writer = std::thread::spawn(move || {
            holder.execute_batch("BEGIN IMMEDIATE").unwrap();
            let _ = locked_tx.send(());
            let _ = done_rx.recv();
            holder.execute_batch("COMMIT").unwrap();
        });
        locked_rx.await.unwrap();

        let err = runtime
            .acquire_lease(file_request("/busy.txt", "agent-a", 30))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "expected busy, got {err:?}");
        done_tx.send(()).unwrap();
        writer.join().unwrap();
    }
}
