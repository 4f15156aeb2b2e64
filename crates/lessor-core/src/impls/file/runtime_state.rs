//! FileRuntimeState - データベースなしで動くリース管理
//!
//! タスクもファイルも予約レコードとして保存する（`id` は `ResourceRef::storage_key`）。
//! 取得の線形化は保証しない。同一プロセス内の操作だけは直列化する。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

use super::{HEARTBEATS_FILE, MESSAGE_QUEUE_FILE, RESERVATIONS_FILE, read_document, write_document};
use crate::domain::lease::{
    AcquireDecision, SYNTHETIC_PREFIX, decide_acquire, extended_expiry, lease_expiry, renewal_expiry,
};
use crate::domain::{
    FileReservation, Heartbeat, Lease, LeaseError, LeaseRequest, ProtocolMessage, QueuedMessage,
    ReservationStatus, ResourceRef,
};
use crate::observability::RuntimeStatus;
use crate::ports::runtime_state::{HEARTBEAT_STALE_AFTER, SYNTHETIC_EVENT_RETENTION};
use crate::ports::{BackendKind, Clock, RefreshReport, RuntimeState};

type Reservations = Vec<FileReservation>;
type Heartbeats = BTreeMap<String, Heartbeat>;
type MessageQueue = Vec<QueuedMessage>;

pub struct FileRuntimeState {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    // in-process only; other processes are not excluded
    io: Mutex<()>,
}

impl FileRuntimeState {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
            io: Mutex::new(()),
        }
    }

    /// Create the state directory and check it is writable.
    pub async fn open(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, LeaseError> {
        let state = Self::new(root, clock);
        tokio::fs::create_dir_all(&state.root).await.map_err(|e| {
            LeaseError::BackendUnavailable(format!(
                "cannot create state directory {}: {e}",
                state.root.display()
            ))
        })?;
        Ok(state)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn reservations(&self) -> Result<Reservations, LeaseError> {
        read_document(&self.path(RESERVATIONS_FILE)).await
    }

    async fn save_reservations(&self, reservations: &Reservations) -> Result<(), LeaseError> {
        write_document(&self.path(RESERVATIONS_FILE), reservations).await
    }

    async fn heartbeats(&self) -> Result<Heartbeats, LeaseError> {
        read_document(&self.path(HEARTBEATS_FILE)).await
    }

    async fn queue(&self) -> Result<MessageQueue, LeaseError> {
        read_document(&self.path(MESSAGE_QUEUE_FILE)).await
    }

    async fn expire_locked(&self, now: DateTime<Utc>) -> Result<usize, LeaseError> {
        let mut reservations = self.reservations().await?;
        let expired = expire_in(&mut reservations, now);
        if expired > 0 {
            self.save_reservations(&reservations).await?;
            info!(count = expired, "expired file-backed leases");
        }
        Ok(expired)
    }
}

/// Mark live-but-overdue records expired; returns how many.
fn expire_in(reservations: &mut Reservations, now: DateTime<Utc>) -> usize {
    let mut count = 0;
    for r in reservations.iter_mut() {
        if r.status == ReservationStatus::Active && r.expires_at <= now {
            r.status = ReservationStatus::Expired;
            count += 1;
        }
    }
    count
}

fn display_key(resource: &ResourceRef) -> String {
    match resource {
        ResourceRef::Task(id) => id.to_string(),
        ResourceRef::FilePath(path) => path.clone(),
    }
}

#[async_trait]
impl RuntimeState for FileRuntimeState {
    fn backend(&self) -> BackendKind {
        BackendKind::File
    }

    async fn enqueue(&self, message: ProtocolMessage) -> Result<QueuedMessage, LeaseError> {
        let _guard = self.io.lock().await;
        let mut queue = self.queue().await?;
        let queued = QueuedMessage {
            id: format!("msg-{}", Ulid::new()),
            enqueued_at: self.clock.now(),
            message,
        };
        queue.push(queued.clone());
        write_document(&self.path(MESSAGE_QUEUE_FILE), &queue).await?;
        debug!(id = %queued.id, kind = queued.message.type_name(), "message enqueued");
        Ok(queued)
    }

    async fn dequeue(&self) -> Result<Option<QueuedMessage>, LeaseError> {
        let _guard = self.io.lock().await;
        let mut queue = self.queue().await?;
        if queue.is_empty() {
            return Ok(None);
        }
        let head = queue.remove(0);
        write_document(&self.path(MESSAGE_QUEUE_FILE), &queue).await?;
        Ok(Some(head))
    }

    async fn acquire_lease(&self, request: LeaseRequest) -> Result<Lease, LeaseError> {
        request.resource.validate()?;
        let now = self.clock.now();
        let expires_at = lease_expiry(request.ttl, now)?;
        let key = request.resource.storage_key();
        let agent_id = request.agent_id.as_str();

        let _guard = self.io.lock().await;
        let mut reservations = self.reservations().await?;
        expire_in(&mut reservations, now);
        let index = reservations.iter().position(|r| r.id == key);
        let decision = decide_acquire(index.map(|i| &reservations[i]), agent_id, now, false);

        let lease_expires_at = match decision {
            AcquireDecision::Conflict(conflict) | AcquireDecision::Override(conflict) => {
                return Err(conflict.into_error());
            }
            AcquireDecision::Extend => {
                let Some(current) = index.map(|i| &mut reservations[i]) else {
                    return Err(LeaseError::NotFound(key));
                };
                current.expires_at = current.expires_at.max(expires_at);
                if request.reason.is_some() {
                    current.reason = request.reason.clone();
                }
                current.expires_at
            }
            AcquireDecision::Create | AcquireDecision::TakeOver => {
                let record = FileReservation {
                    id: key.clone(),
                    agent_id: agent_id.to_string(),
                    file_path: display_key(&request.resource),
                    created_at: now,
                    expires_at,
                    status: ReservationStatus::Active,
                    reason: request.reason.clone(),
                };
                match index {
                    Some(i) => reservations[i] = record,
                    None => reservations.push(record),
                }
                expires_at
            }
        };
        self.save_reservations(&reservations).await?;
        debug!(resource = %request.resource, agent_id, "file-backed lease granted");
        Ok(Lease {
            resource: request.resource,
            agent_id: request.agent_id,
            lease_expires_at,
            // attempts are not tracked without a task table
            attempt: 1,
        })
    }

    async fn release_lease(&self, resource: &ResourceRef, agent_id: &str) -> Result<bool, LeaseError> {
        let key = resource.storage_key();
        let _guard = self.io.lock().await;
        let mut reservations = self.reservations().await?;
        let Some(record) = reservations.iter_mut().find(|r| {
            r.id == key && r.agent_id == agent_id && r.status == ReservationStatus::Active
        }) else {
            return Ok(false);
        };
        record.status = ReservationStatus::Released;
        self.save_reservations(&reservations).await?;
        debug!(resource = %resource, agent_id, "file-backed lease released");
        Ok(true)
    }

    async fn upsert_heartbeat(&self, heartbeat: Heartbeat) -> Result<(), LeaseError> {
        if heartbeat.agent_id.trim().is_empty() {
            return Err(LeaseError::Validation(
                "agent_id must be a non-empty string".to_string(),
            ));
        }
        let _guard = self.io.lock().await;
        let mut heartbeats = self.heartbeats().await?;
        heartbeats.insert(heartbeat.agent_id.clone(), heartbeat);
        write_document(&self.path(HEARTBEATS_FILE), &heartbeats).await
    }

    async fn refresh(&self) -> Result<RefreshReport, LeaseError> {
        let now = self.clock.now();
        let _guard = self.io.lock().await;
        let leases_expired = self.expire_locked(now).await?;

        let mut heartbeats = self.heartbeats().await?;
        let before = heartbeats.len();
        let stale_before = now - HEARTBEAT_STALE_AFTER;
        heartbeats.retain(|_, hb| hb.last_seen >= stale_before);
        let heartbeats_pruned = before - heartbeats.len();
        if heartbeats_pruned > 0 {
            write_document(&self.path(HEARTBEATS_FILE), &heartbeats).await?;
        }

        // finished records past retention are dropped to keep the document small
        let mut reservations = self.reservations().await?;
        let before = reservations.len();
        let retain_after = now - SYNTHETIC_EVENT_RETENTION;
        reservations.retain(|r| r.status == ReservationStatus::Active || r.expires_at >= retain_after);
        if reservations.len() != before {
            self.save_reservations(&reservations).await?;
        }

        let report = RefreshReport {
            leases_expired,
            heartbeats_pruned,
            events_pruned: 0,
        };
        debug!(?report, "file runtime refreshed");
        Ok(report)
    }

    async fn renew(&self, resource: &ResourceRef, agent_id: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let now = self.clock.now();
        let key = resource.storage_key();
        if renewal_expiry(&key, agent_id, ttl, now)?.is_none() {
            return Ok(false);
        }
        let _guard = self.io.lock().await;
        let mut reservations = self.reservations().await?;
        let Some(record) = reservations.iter_mut().find(|r| {
            r.id == key
                && r.agent_id == agent_id
                && r.status == ReservationStatus::Active
                && r.expires_at > now
        }) else {
            return Ok(false);
        };
        let Some(expires_at) = extended_expiry(record.expires_at, now, ttl) else {
            return Ok(false);
        };
        record.expires_at = expires_at;
        self.save_reservations(&reservations).await?;
        Ok(true)
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<usize, LeaseError> {
        let _guard = self.io.lock().await;
        self.expire_locked(now).await
    }

    async fn status(&self) -> Result<RuntimeStatus, LeaseError> {
        let now = self.clock.now();
        let _guard = self.io.lock().await;
        let reservations = self.reservations().await?;
        let heartbeats = self.heartbeats().await?;
        let queue = self.queue().await?;

        let live = reservations.iter().filter(|r| r.is_live(now));
        let (files, tasks): (Vec<_>, Vec<_>) = live.partition(|r| r.id.starts_with(SYNTHETIC_PREFIX));
        let stale_before = now - HEARTBEAT_STALE_AFTER;
        Ok(RuntimeStatus {
            tasks: BTreeMap::new(),
            active_leases: tasks.len(),
            active_file_reservations: files.len(),
            live_heartbeats: heartbeats.values().filter(|hb| hb.last_seen > stale_before).count(),
            queued_messages: queue.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentId, TaskId, synthetic_id};
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn request(path: &str, agent: &str, secs: i64) -> LeaseRequest {
        LeaseRequest::new(
            ResourceRef::file(path),
            AgentId::parse(agent).unwrap(),
            Duration::seconds(secs),
        )
    }

    async fn setup() -> (FileRuntimeState, Arc<FixedClock>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));
        let state = FileRuntimeState::open(dir.path().join("state"), clock.clone())
            .await
            .unwrap();
        (state, clock, dir)
    }

    #[tokio::test]
    async fn conflict_then_takeover_after_expiry() {
        let (state, clock, _dir) = setup().await;
        state.acquire_lease(request("/f.txt", "agent-a", 60)).await.unwrap();

        clock.set(t0() + Duration::seconds(10));
        let err = state
            .acquire_lease(request("/f.txt", "agent-b", 60))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "/f.txt is leased by agent-a until 2024-01-01T12:01:00.000Z"
        );

        clock.set(t0() + Duration::seconds(61));
        let lease = state.acquire_lease(request("/f.txt", "agent-b", 60)).await.unwrap();
        assert_eq!(lease.agent_id.as_str(), "agent-b");
    }

    #[tokio::test]
    async fn records_use_storage_keys_and_camel_case_fields() {
        let (state, _, _dir) = setup().await;
        state
            .acquire_lease(request("/f.txt", "agent-a", 60).with_reason("edit"))
            .await
            .unwrap();
        let raw = tokio::fs::read_to_string(state.root().join(RESERVATIONS_FILE))
            .await
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc[0]["id"], synthetic_id("/f.txt"));
        assert_eq!(doc[0]["agentId"], "agent-a");
        assert_eq!(doc[0]["filePath"], "/f.txt");
        assert_eq!(doc[0]["status"], "active");
        assert_eq!(doc[0]["reason"], "edit");
    }

    #[tokio::test]
    async fn state_survives_a_new_instance() {
        let (state, clock, _dir) = setup().await;
        state.acquire_lease(request("/f.txt", "agent-a", 60)).await.unwrap();

        let reopened = FileRuntimeState::new(state.root().to_path_buf(), clock.clone());
        assert!(reopened.acquire_lease(request("/f.txt", "agent-b", 60)).await.is_err());
    }

    #[tokio::test]
    async fn renew_applies_the_same_rules() {
        let (state, clock, _dir) = setup().await;
        let resource = ResourceRef::file("/f.txt");
        state.acquire_lease(request("/f.txt", "agent-a", 10)).await.unwrap();

        assert!(state.renew(&resource, "agent-a", Duration::seconds(20)).await.unwrap());
        assert!(!state.renew(&resource, "agent-b", Duration::seconds(20)).await.unwrap());
        assert!(!state.renew(&resource, "agent-a", Duration::milliseconds(-1)).await.unwrap());
        assert!(!state.renew(&resource, "agent-a", Duration::MAX).await.unwrap());
        assert!(state.renew(&resource, " ", Duration::seconds(1)).await.is_err());

        // 10s + 20s from the original expiry
        clock.advance(Duration::seconds(31));
        assert!(!state.renew(&resource, "agent-a", Duration::seconds(20)).await.unwrap());
    }

    #[tokio::test]
    async fn short_renew_still_moves_expiry_forward() {
        let (state, _clock, _dir) = setup().await;
        let resource = ResourceRef::file("/f.txt");
        let lease = state.acquire_lease(request("/f.txt", "agent-a", 60)).await.unwrap();

        assert!(state.renew(&resource, "agent-a", Duration::seconds(1)).await.unwrap());
        let reservations = state.reservations().await.unwrap();
        let record = reservations
            .iter()
            .find(|r| r.id == resource.storage_key())
            .unwrap();
        assert_eq!(record.expires_at, lease.lease_expires_at + Duration::seconds(1));
    }

    #[tokio::test]
    async fn task_resources_are_leased_too() {
        let (state, _, _dir) = setup().await;
        let resource = ResourceRef::task(TaskId::parse("T1").unwrap());
        let agent = AgentId::parse("a").unwrap();
        state
            .acquire_lease(LeaseRequest::new(resource.clone(), agent, Duration::seconds(5)))
            .await
            .unwrap();
        let status = state.status().await.unwrap();
        assert_eq!(status.active_leases, 1);
        assert_eq!(status.active_file_reservations, 0);
        assert!(state.release_lease(&resource, "a").await.unwrap());
        assert!(!state.release_lease(&resource, "a").await.unwrap());
    }

    #[tokio::test]
    async fn expire_is_idempotent() {
        let (state, clock, _dir) = setup().await;
        state.acquire_lease(request("/f.txt", "agent-a", 1)).await.unwrap();
        clock.advance(Duration::seconds(2));
        assert_eq!(state.expire_leases(clock.now()).await.unwrap(), 1);
        assert_eq!(state.expire_leases(clock.now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refresh_prunes_stale_heartbeats() {
        let (state, clock, _dir) = setup().await;
        state
            .upsert_heartbeat(Heartbeat::new("old", t0() - Duration::minutes(16)))
            .await
            .unwrap();
        state.upsert_heartbeat(Heartbeat::new("new", t0())).await.unwrap();
        state.acquire_lease(request("/f.txt", "agent-a", 1)).await.unwrap();
        clock.advance(Duration::seconds(5));

        let report = state.refresh().await.unwrap();
        assert_eq!(report.heartbeats_pruned, 1);
        assert_eq!(report.leases_expired, 1);
        assert_eq!(state.refresh().await.unwrap(), RefreshReport::default());
        assert_eq!(state.status().await.unwrap().live_heartbeats, 1);
    }

    #[tokio::test]
    async fn queue_round_trips_in_order() {
        let (state, _, _dir) = setup().await;
        for path in ["/a", "/b"] {
            state
                .enqueue(ProtocolMessage::FileRelease {
                    agent_id: "x".to_string(),
                    file_path: path.to_string(),
                })
                .await
                .unwrap();
        }
        let first = state.dequeue().await.unwrap().unwrap();
        assert!(matches!(first.message, ProtocolMessage::FileRelease { ref file_path, .. } if file_path == "/a"));
        assert!(state.dequeue().await.unwrap().is_some());
        assert!(state.dequeue().await.unwrap().is_none());
    }
}
