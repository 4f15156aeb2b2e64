//! ReservationManager - ファイルパスの予約
//!
//! スケジューラと同じ排他規律を任意の文字列キー（ファイルパス）に適用する。
//! キューはない：呼び出し側は特定のパスを指定して確保する。
//!
//! - 他人の有効な予約があれば fail closed（保持者と期限付きの Conflict）
//! - 自分の予約なら延長、期限切れ / 非アクティブなら引き継ぐ
//! - 上書きは `allow_override` が設定されている場合だけ
//!
//! 期限切れの掃除は `spawn_cleanup` のタイマーで回す。

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::domain::events::LeaseExpiredData;
use crate::domain::lease::{AcquireDecision, decide_acquire, lease_expiry};
use crate::domain::{
    AgentId, ConflictInfo, EventPayload, ExpiryPolicy, FileReservation, LeaseError,
    ReservationCheckResult, ReservationStatus, synthetic_id,
};
use crate::event_log::EventLog;
use crate::impls::sqlite::{SharedConnection, from_ms, load_lease, lock, to_ms};
use crate::ports::Clock;

const RESERVATION_COLUMNS: &str = "id, agent_id, file_path, created_at, expires_at, status, reason";

/// Request for `acquire_lease`.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireLease {
    pub file_path: String,
    pub duration: Duration,
    pub reason: Option<String>,

    /// Take over a foreign live reservation. Honoured only when the manager
    /// was built with `allow_override`.
    pub override_conflict: bool,
}

impl AcquireLease {
    pub fn new(file_path: impl Into<String>, duration: Duration) -> Self {
        Self {
            file_path: file_path.into(),
            duration,
            reason: None,
            override_conflict: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn overriding(mut self) -> Self {
        self.override_conflict = true;
        self
    }
}

/// File reservations of one agent.
#[derive(Clone)]
pub struct ReservationManager {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
    agent_id: AgentId,
    allow_override: bool,
}

impl ReservationManager {
    pub fn new(conn: SharedConnection, clock: Arc<dyn Clock>, agent_id: AgentId) -> Self {
        Self {
            conn,
            clock,
            agent_id,
            allow_override: false,
        }
    }

    pub fn with_allow_override(mut self, allow: bool) -> Self {
        self.allow_override = allow;
        self
    }

    /// Same store and settings, acting as another agent.
    pub fn for_agent(&self, agent_id: AgentId) -> Self {
        Self {
            agent_id,
            ..self.clone()
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn acquire_lease(&self, request: AcquireLease) -> Result<FileReservation, LeaseError> {
        if request.file_path.trim().is_empty() {
            return Err(LeaseError::Validation(
                "file path must be a non-empty string".to_string(),
            ));
        }
        let now = self.clock.now();
        let expires_at = lease_expiry(request.duration, now)?;
        if request.override_conflict && !self.allow_override {
            warn!(
                agent_id = %self.agent_id,
                file_path = %request.file_path,
                "override requested but not permitted"
            );
        }
        let override_authorized = request.override_conflict && self.allow_override;

        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // RuntimeState で取られた同じパスのリースも有効な保持とみなす
        if let Some(conflict) =
            foreign_synthetic_lease(&tx, &request.file_path, self.agent_id.as_str(), now)?
        {
            return Err(conflict.into_error());
        }
        let existing = load_reservation(&tx, &request.file_path)?;
        let decision = decide_acquire(existing.as_ref(), self.agent_id.as_str(), now, override_authorized);

        let reservation = match (decision, existing) {
            (AcquireDecision::Conflict(conflict), _) => return Err(conflict.into_error()),
            (AcquireDecision::Extend, Some(mut current)) => {
                current.expires_at = current.expires_at.max(expires_at);
                if request.reason.is_some() {
                    current.reason = request.reason;
                }
                tx.prepare_cached(
                    "UPDATE file_reservations SET expires_at = ?1, reason = ?2 WHERE id = ?3",
                )?
                .execute(params![to_ms(current.expires_at), current.reason, current.id])?;
                debug!(file_path = %current.file_path, agent_id = %self.agent_id, "reservation extended");
                current
            }
            (decision, existing) => {
                if let AcquireDecision::Override(conflict) = &decision {
                    warn!(
                        file_path = %conflict.file_path,
                        holder = %conflict.holder,
                        agent_id = %self.agent_id,
                        "overriding active reservation"
                    );
                }
                let reservation = FileReservation {
                    id: format!("resv-{}", Ulid::new()),
                    agent_id: self.agent_id.to_string(),
                    file_path: request.file_path,
                    created_at: now,
                    expires_at,
                    status: ReservationStatus::Active,
                    reason: request.reason,
                };
                if existing.is_some() {
                    tx.prepare_cached("DELETE FROM file_reservations WHERE file_path = ?1")?
                        .execute(params![reservation.file_path])?;
                }
                tx.prepare_cached(
                    "INSERT INTO file_reservations (id, agent_id, file_path, created_at, expires_at, status, reason)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?
                .execute(params![
                    reservation.id,
                    reservation.agent_id,
                    reservation.file_path,
                    to_ms(reservation.created_at),
                    to_ms(reservation.expires_at),
                    reservation.status.as_str(),
                    reservation.reason,
                ])?;
                debug!(file_path = %reservation.file_path, agent_id = %self.agent_id, "reservation created");
                reservation
            }
        };
        tx.commit()?;
        Ok(reservation)
    }

    /// Mark the caller's reservation released. Not owning it is a no-op.
    pub fn release_lease(&self, file_path: &str) -> Result<bool, LeaseError> {
        let conn = lock(&self.conn)?;
        let changed = conn
            .prepare_cached(
                "UPDATE file_reservations SET status = 'released'
                 WHERE file_path = ?1 AND agent_id = ?2 AND status = 'active'",
            )?
            .execute(params![file_path, self.agent_id.as_str()])?;
        if changed > 0 {
            debug!(file_path, agent_id = %self.agent_id, "reservation released");
        }
        Ok(changed > 0)
    }

    /// Extend from `max(current expiry, now)` by `additional`.
    pub fn renew_lease(&self, file_path: &str, additional: Duration) -> Result<FileReservation, LeaseError> {
        if additional <= Duration::zero() {
            return Err(LeaseError::Validation(format!(
                "renewal must be positive, got {}ms",
                additional.num_milliseconds()
            )));
        }
        let now = self.clock.now();
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut current = load_reservation(&tx, file_path)?
            .ok_or_else(|| LeaseError::NotFound(file_path.to_string()))?;
        if current.agent_id != self.agent_id.as_str() {
            return Err(LeaseError::NotOwned {
                resource: file_path.to_string(),
                holder: current.agent_id,
            });
        }
        if current.status != ReservationStatus::Active {
            return Err(LeaseError::Inactive(file_path.to_string()));
        }
        current.expires_at = current
            .expires_at
            .max(now)
            .checked_add_signed(additional)
            .ok_or_else(|| LeaseError::Validation("renewal overflows timestamp range".to_string()))?;
        tx.prepare_cached("UPDATE file_reservations SET expires_at = ?1 WHERE id = ?2")?
            .execute(params![to_ms(current.expires_at), current.id])?;
        tx.commit()?;
        Ok(current)
    }

    pub fn get(&self, file_path: &str) -> Result<Option<FileReservation>, LeaseError> {
        let conn = lock(&self.conn)?;
        load_reservation(&conn, file_path)
    }

    /// Live reservations or file leases held by anyone other than the caller on `file_paths`.
    pub fn check_conflicts<S: AsRef<str>>(&self, file_paths: &[S]) -> Result<Vec<ConflictInfo>, LeaseError> {
        let now = self.clock.now();
        let conn = lock(&self.conn)?;
        let mut conflicts = Vec::new();
        let agent_id = self.agent_id.as_str();
        for path in file_paths {
            let path = path.as_ref();
            conflicts.extend(foreign_reservation(&conn, path, agent_id, now)?);
            conflicts.extend(foreign_synthetic_lease(&conn, path, agent_id, now)?);
        }
        Ok(conflicts)
    }

    /// Conflicts plus the configured override permission, for an approval step.
    pub fn perform_reservation_check<S: AsRef<str>>(
        &self,
        staged_files: &[S],
    ) -> Result<ReservationCheckResult, LeaseError> {
        Ok(ReservationCheckResult {
            conflicts: self.check_conflicts(staged_files)?,
            allow_override: self.allow_override,
        })
    }

    /// Mark every active reservation past its expiry as expired.
    ///
    /// Each one gets a LEASE_EXPIRED event under the path's synthetic id.
    pub fn cleanup_expired_leases(&self) -> Result<usize, LeaseError> {
        let now = self.clock.now();
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM file_reservations
             WHERE status = 'active' AND expires_at <= ?1"
        );
        let expired: Vec<FileReservation> = tx
            .prepare_cached(&sql)?
            .query_map(params![to_ms(now)], reservation_from_row)?
            .collect::<rusqlite::Result<_>>()?;

        let log = EventLog::new(&tx);
        for reservation in &expired {
            tx.prepare_cached("UPDATE file_reservations SET status = 'expired' WHERE id = ?1")?
                .execute(params![reservation.id])?;
            let overdue = now - reservation.expires_at;
            log.append(
                &synthetic_id(&reservation.file_path),
                now,
                EventPayload::LeaseExpired(LeaseExpiredData {
                    agent_id: reservation.agent_id.clone(),
                    // reservations are not retried, so there is no attempt count
                    attempt: 0,
                    lease_expires_at: to_ms(reservation.expires_at),
                    overdue_ms: overdue.num_milliseconds(),
                    policy: ExpiryPolicy::for_overdue(overdue),
                }),
            );
        }
        tx.commit()?;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired file reservations");
        }
        Ok(expired.len())
    }

    /// Run `cleanup_expired_leases` every `interval` until shut down.
    pub fn spawn_cleanup(&self, interval: std::time::Duration) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // handle dropped
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                let sweeper = manager.clone();
                match tokio::task::spawn_blocking(move || sweeper.cleanup_expired_leases()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(error = %err, "reservation cleanup failed"),
                    Err(err) => warn!(error = %err, "reservation cleanup task panicked"),
                }
            }
        });
        CleanupHandle { shutdown_tx, join }
    }
}

/// Handle of a running cleanup timer.
/// - `request_shutdown` でループが止まる（実行中の掃除は最後まで走る）
pub struct CleanupHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl CleanupHandle {
    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

/// Live reservation on `file_path` held by anyone but `agent_id`.
pub(crate) fn foreign_reservation(
    conn: &Connection,
    file_path: &str,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<ConflictInfo>, LeaseError> {
    Ok(load_reservation(conn, file_path)?
        .filter(|r| r.is_live(now) && r.agent_id != agent_id)
        .map(|r| ConflictInfo::from(&r)))
}

/// Live lease on the path's synthetic row held by anyone but `agent_id`.
fn foreign_synthetic_lease(
    conn: &Connection,
    file_path: &str,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<ConflictInfo>, LeaseError> {
    Ok(load_lease(conn, &synthetic_id(file_path))?
        .filter(|(holder, expires_at, _)| *expires_at > now && holder != agent_id)
        .map(|(holder, expires_at, _)| ConflictInfo {
            file_path: file_path.to_string(),
            holder,
            expires_at,
            reason: None,
        }))
}

fn load_reservation(conn: &Connection, file_path: &str) -> Result<Option<FileReservation>, LeaseError> {
    let sql = format!("SELECT {RESERVATION_COLUMNS} FROM file_reservations WHERE file_path = ?1");
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![file_path], reservation_from_row)
        .optional()?)
}

fn reservation_from_row(row: &Row<'_>) -> rusqlite::Result<FileReservation> {
    let status: String = row.get(5)?;
    Ok(FileReservation {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        file_path: row.get(2)?,
        created_at: from_ms(row.get(3)?),
        expires_at: from_ms(row.get(4)?),
        status: ReservationStatus::parse(&status),
        reason: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;
    use crate::impls::sqlite::{open_in_memory, shared};
    use crate::domain::{LeaseRequest, ResourceRef};
    use crate::ports::FixedClock;
    use crate::scheduler::LeaseScheduler;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn aid(id: &str) -> AgentId {
        AgentId::parse(id).unwrap()
    }

    fn setup() -> (ReservationManager, ReservationManager, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let a = ReservationManager::new(shared(open_in_memory().unwrap()), clock.clone(), aid("agent-a"));
        let b = a.for_agent(aid("agent-b"));
        (a, b, clock)
    }

    #[test]
    fn foreign_live_reservation_conflicts_until_expiry() {
        let (a, b, clock) = setup();
        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();

        clock.set(t0() + Duration::seconds(10));
        let err = b
            .acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap_err();
        match &err {
            LeaseError::Conflict { holder, expires_at, .. } => {
                assert_eq!(holder, "agent-a");
                assert_eq!(*expires_at, t0() + Duration::seconds(60));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("agent-a"));
        assert!(err.to_string().contains("2024-01-01T12:01:00.000Z"));

        clock.set(t0() + Duration::seconds(61));
        let taken = b
            .acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();
        assert_eq!(taken.agent_id, "agent-b");
    }

    #[test]
    fn own_reservation_is_extended_not_duplicated() {
        let (a, _, clock) = setup();
        let first = a
            .acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)).with_reason("refactor"))
            .unwrap();
        clock.advance(Duration::seconds(30));
        let second = a
            .acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.expires_at, t0() + Duration::seconds(90));
        assert_eq!(second.reason.as_deref(), Some("refactor"));
    }

    #[test]
    fn released_reservation_can_be_taken_over() {
        let (a, b, _) = setup();
        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();
        assert!(a.release_lease("/f.txt").unwrap());
        let taken = b
            .acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();
        assert_eq!(taken.status, ReservationStatus::Active);
        assert_eq!(taken.agent_id, "agent-b");
    }

    #[test]
    fn release_by_non_owner_is_a_noop() {
        let (a, b, _) = setup();
        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();
        assert!(!b.release_lease("/f.txt").unwrap());
        assert!(!b.release_lease("/missing").unwrap());
        assert_eq!(
            a.get("/f.txt").unwrap().unwrap().status,
            ReservationStatus::Active
        );
    }

    #[test]
    fn override_requires_permission() {
        let (a, b, _) = setup();
        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();

        let denied = b.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)).overriding());
        assert!(matches!(denied, Err(LeaseError::Conflict { .. })));

        let permitted = b.clone().with_allow_override(true);
        let taken = permitted
            .acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)).overriding())
            .unwrap();
        assert_eq!(taken.agent_id, "agent-b");
    }

    fn scheduler_on(manager: &ReservationManager, clock: &Arc<FixedClock>) -> LeaseScheduler {
        LeaseScheduler::new(manager.conn.clone(), clock.clone())
    }

    fn file_request(agent: &str) -> LeaseRequest {
        LeaseRequest::new(ResourceRef::file("/f.txt"), aid(agent), Duration::seconds(60))
    }

    #[test]
    fn runtime_file_lease_blocks_reservation_and_check() {
        let (a, b, clock) = setup();
        let scheduler = scheduler_on(&a, &clock);
        scheduler.acquire(&file_request("agent-a")).unwrap();

        let err = b
            .acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap_err();
        assert!(matches!(&err, LeaseError::Conflict { holder, .. } if holder == "agent-a"));

        // override only applies to reservations
        let permitted = b.clone().with_allow_override(true);
        let denied = permitted.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)).overriding());
        assert!(matches!(denied, Err(LeaseError::Conflict { .. })));

        let conflicts = b.check_conflicts(&["/f.txt"]).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].holder, "agent-a");
        assert!(a.check_conflicts(&["/f.txt"]).unwrap().is_empty());

        // the holder itself may still reserve the same path
        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();

        clock.set(t0() + Duration::seconds(61));
        assert!(b.check_conflicts(&["/f.txt"]).unwrap().is_empty());
    }

    #[test]
    fn reservation_blocks_runtime_file_lease() {
        let (a, _, clock) = setup();
        let scheduler = scheduler_on(&a, &clock);
        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();

        let err = scheduler.acquire(&file_request("agent-b")).unwrap_err();
        match err {
            LeaseError::Conflict { holder, expires_at, .. } => {
                assert_eq!(holder, "agent-a");
                assert_eq!(expires_at, t0() + Duration::seconds(60));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        scheduler.acquire(&file_request("agent-a")).unwrap();

        assert!(a.release_lease("/f.txt").unwrap());
        assert!(scheduler.release(&ResourceRef::file("/f.txt"), "agent-a").unwrap());
        let lease = scheduler.acquire(&file_request("agent-b")).unwrap();
        assert_eq!(lease.agent_id.as_str(), "agent-b");
    }

    #[test]
    fn renew_extends_from_later_of_expiry_and_now() {
        let (a, _, clock) = setup();
        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();

        let renewed = a.renew_lease("/f.txt", Duration::seconds(30)).unwrap();
        assert_eq!(renewed.expires_at, t0() + Duration::seconds(90));

        clock.set(t0() + Duration::seconds(200));
        let renewed = a.renew_lease("/f.txt", Duration::seconds(30)).unwrap();
        assert_eq!(renewed.expires_at, t0() + Duration::seconds(230));
    }

    #[test]
    fn renew_errors() {
        let (a, b, _) = setup();
        assert!(matches!(
            a.renew_lease("/nope", Duration::seconds(1)),
            Err(LeaseError::NotFound(_))
        ));

        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(60)))
            .unwrap();
        assert!(matches!(
            b.renew_lease("/f.txt", Duration::seconds(1)),
            Err(LeaseError::NotOwned { holder, .. }) if holder == "agent-a"
        ));

        a.release_lease("/f.txt").unwrap();
        assert!(matches!(
            a.renew_lease("/f.txt", Duration::seconds(1)),
            Err(LeaseError::Inactive(_))
        ));
    }

    #[test]
    fn conflict_check_excludes_own_and_expired() {
        let (a, b, clock) = setup();
        a.acquire_lease(AcquireLease::new("/a.rs", Duration::seconds(60)))
            .unwrap();
        a.acquire_lease(AcquireLease::new("/short.rs", Duration::seconds(5)))
            .unwrap();
        b.acquire_lease(AcquireLease::new("/b.rs", Duration::seconds(60)))
            .unwrap();
        clock.advance(Duration::seconds(10));

        let conflicts = b
            .check_conflicts(&["/a.rs", "/b.rs", "/short.rs", "/free.rs"])
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].file_path, "/a.rs");
        assert_eq!(conflicts[0].holder, "agent-a");

        let check = b.perform_reservation_check(&["/a.rs"]).unwrap();
        assert!(check.has_conflicts());
        assert!(!check.allow_override);
        assert!(a.perform_reservation_check(&["/a.rs"]).unwrap().is_clear());
    }

    #[test]
    fn cleanup_marks_expired_and_logs_once() {
        let (a, _, clock) = setup();
        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(5)))
            .unwrap();
        a.acquire_lease(AcquireLease::new("/g.txt", Duration::seconds(500)))
            .unwrap();
        clock.advance(Duration::seconds(6));

        assert_eq!(a.cleanup_expired_leases().unwrap(), 1);
        assert_eq!(a.cleanup_expired_leases().unwrap(), 0);
        assert_eq!(
            a.get("/f.txt").unwrap().unwrap().status,
            ReservationStatus::Expired
        );

        let conn = lock(&a.conn).unwrap();
        let events = EventLog::new(&conn).task_events(&synthetic_id("/f.txt"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind().unwrap(), EventKind::LeaseExpired);
    }

    #[test]
    fn rejects_empty_path_and_bad_duration() {
        let (a, _, _) = setup();
        assert!(matches!(
            a.acquire_lease(AcquireLease::new(" ", Duration::seconds(5))),
            Err(LeaseError::Validation(_))
        ));
        assert!(matches!(
            a.acquire_lease(AcquireLease::new("/f", Duration::zero())),
            Err(LeaseError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_timer_sweeps_until_shutdown() {
        let (a, _, clock) = setup();
        a.acquire_lease(AcquireLease::new("/f.txt", Duration::seconds(1)))
            .unwrap();
        clock.advance(Duration::seconds(2));

        let handle = a.spawn_cleanup(std::time::Duration::from_millis(10));
        let mut expired = false;
        for _ in 0..100 {
            if a.get("/f.txt").unwrap().map(|r| r.status) == Some(ReservationStatus::Expired) {
                expired = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        handle.shutdown_and_join().await;
        assert!(expired);
    }
}
