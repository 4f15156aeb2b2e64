//! Coordinator - プロトコルメッセージの振り分け
//!
//! 薄い層：メッセージをスケジューラ / RuntimeState に渡すだけ。
//! ライフサイクルイベントは出さない（スケジューラが唯一の発行元）。
//! ここで記録するのはハートビート更新失敗のようなリース健全性イベントだけ。
//!
//! TASK_START / TASK_VERIFYING / TASK_COMMIT は送信元エージェントが
//! 有効なリースを持っている場合だけ受け付ける。

use chrono::Duration;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::events::HeartbeatRenewFailureData;
use crate::domain::{
    AgentId, Claim, EventPayload, Heartbeat, Lease, LeaseError, LeaseRequest, ProtocolMessage,
    ResourceRef, TaskFailure, TaskId, TaskState, ttl_from_millis,
};
use crate::event_log::EventLog;
use crate::impls::sqlite::lock;
use crate::ports::RuntimeState;
use crate::scheduler::LeaseScheduler;

/// What a dispatched message did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Claimed { claim: Option<Claim> },
    Advanced { task_id: TaskId, state: TaskState },
    ErrorRecorded { task_id: TaskId, state: TaskState },
    HeartbeatRecorded { renewed: Option<bool> },
    FileReserved { lease: Lease },
    FileReleased { released: bool },
}

pub struct Coordinator {
    scheduler: LeaseScheduler,
    runtime: Arc<dyn RuntimeState>,
}

impl Coordinator {
    pub fn new(scheduler: LeaseScheduler, runtime: Arc<dyn RuntimeState>) -> Self {
        Self { scheduler, runtime }
    }

    /// Run a scheduler call off the async executor.
    async fn blocking<T, F>(&self, f: F) -> Result<T, LeaseError>
    where
        T: Send + 'static,
        F: FnOnce(&LeaseScheduler) -> Result<T, LeaseError> + Send + 'static,
    {
        let scheduler = self.scheduler.clone();
        tokio::task::spawn_blocking(move || f(&scheduler))
            .await
            .map_err(|e| LeaseError::BackendUnavailable(format!("scheduler task failed: {e}")))?
    }

    /// Hand the next READY task to `agent_id`.
    ///
    /// CLAIMED is written by the scheduler; nothing is logged here.
    pub async fn claim_next_task(
        &self,
        agent_id: &AgentId,
        ttl: Option<Duration>,
    ) -> Result<Option<Claim>, LeaseError> {
        let agent_id = agent_id.clone();
        self.blocking(move |s| match ttl {
            Some(ttl) => s.reserve(&agent_id, ttl),
            None => s.pick_next_task(&agent_id),
        })
        .await
    }

    pub async fn dispatch(&self, message: ProtocolMessage) -> Result<DispatchOutcome, LeaseError> {
        debug!(kind = message.type_name(), agent_id = message.agent_id(), "dispatching");
        match message {
            ProtocolMessage::TaskClaim { agent_id, ttl_ms } => {
                let agent_id = AgentId::parse(agent_id)?;
                let ttl = ttl_ms.map(ttl_from_millis).transpose()?;
                let claim = self.claim_next_task(&agent_id, ttl).await?;
                Ok(DispatchOutcome::Claimed { claim })
            }
            ProtocolMessage::TaskStart { agent_id, task_id } => {
                self.advance(agent_id, task_id, TaskState::Running).await
            }
            ProtocolMessage::TaskVerifying { agent_id, task_id } => {
                self.advance(agent_id, task_id, TaskState::Verifying).await
            }
            ProtocolMessage::TaskCommit { agent_id, task_id } => {
                self.advance(agent_id, task_id, TaskState::Committed).await
            }
            ProtocolMessage::TaskError {
                agent_id,
                task_id,
                message,
                retryable,
            } => {
                let task_id = TaskId::parse(task_id)?;
                let id = task_id.clone();
                let failure = TaskFailure::new("TaskError", message);
                let context = json!({ "retryable": retryable, "agent_id": agent_id });
                let state = self
                    .blocking(move |s| s.error(&id, &failure, context))
                    .await?;
                Ok(DispatchOutcome::ErrorRecorded { task_id, state })
            }
            ProtocolMessage::Heartbeat {
                agent_id,
                task_id,
                ttl_ms,
            } => self.heartbeat(agent_id, task_id, ttl_ms).await,
            ProtocolMessage::FileReserve {
                agent_id,
                file_path,
                ttl_ms,
                reason,
            } => {
                let mut request = LeaseRequest::new(
                    ResourceRef::file(file_path),
                    AgentId::parse(agent_id)?,
                    ttl_from_millis(ttl_ms)?,
                );
                request.reason = reason;
                let lease = self.runtime.acquire_lease(request).await?;
                Ok(DispatchOutcome::FileReserved { lease })
            }
            ProtocolMessage::FileRelease {
                agent_id,
                file_path,
            } => {
                let released = self
                    .runtime
                    .release_lease(&ResourceRef::file(file_path), &agent_id)
                    .await?;
                Ok(DispatchOutcome::FileReleased { released })
            }
        }
    }

    /// Dispatch queued messages oldest first, up to `limit`.
    ///
    /// A message that fails is logged and dropped; the rest still run.
    pub async fn drain_queue(&self, limit: usize) -> Result<Vec<DispatchOutcome>, LeaseError> {
        let mut outcomes = Vec::new();
        while outcomes.len() < limit {
            let Some(queued) = self.runtime.dequeue().await? else {
                break;
            };
            match self.dispatch(queued.message).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(id = %queued.id, error = %err, "queued message failed"),
            }
        }
        Ok(outcomes)
    }

    async fn advance(
        &self,
        agent_id: String,
        task_id: String,
        to: TaskState,
    ) -> Result<DispatchOutcome, LeaseError> {
        let task_id = TaskId::parse(task_id)?;
        let id = task_id.clone();
        self.blocking(move |s| s.advance_held(&id, &agent_id, to)).await?;
        Ok(DispatchOutcome::Advanced { task_id, state: to })
    }

    async fn heartbeat(
        &self,
        agent_id: String,
        task_id: Option<String>,
        ttl_ms: Option<i64>,
    ) -> Result<DispatchOutcome, LeaseError> {
        let ttl = ttl_ms.map(ttl_from_millis).transpose()?;
        let mut heartbeat = Heartbeat::new(agent_id.clone(), self.scheduler.now());
        if let Some(task_id) = &task_id {
            heartbeat = heartbeat.with_task(task_id.clone());
        }
        self.runtime.upsert_heartbeat(heartbeat).await?;

        let (Some(task_id), Some(ttl)) = (task_id, ttl) else {
            return Ok(DispatchOutcome::HeartbeatRecorded { renewed: None });
        };
        let resource = ResourceRef::task(TaskId::parse(task_id.clone())?);
        let renewed = self
            .runtime
            .renew(&resource, &agent_id, ttl)
            .await?;
        if !renewed {
            warn!(%task_id, %agent_id, "heartbeat could not renew lease");
            let now = self.scheduler.now();
            self.blocking(move |s| {
                let conn = lock(s.connection())?;
                EventLog::new(&conn).append(
                    &task_id,
                    now,
                    EventPayload::HeartbeatRenewFailure(HeartbeatRenewFailureData {
                        agent_id,
                        reason: "no live lease for this agent".to_string(),
                    }),
                );
                Ok(())
            })
            .await?;
        }
        Ok(DispatchOutcome::HeartbeatRecorded {
            renewed: Some(renewed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKind, NewTask};
    use crate::impls::sqlite::SqliteRuntimeState;
    use crate::ports::FixedClock;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Coordinator, LeaseScheduler, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let runtime = SqliteRuntimeState::in_memory(clock.clone()).unwrap();
        let scheduler = runtime.scheduler().clone();
        (
            Coordinator::new(scheduler.clone(), Arc::new(runtime)),
            scheduler,
            clock,
        )
    }

    fn count(scheduler: &LeaseScheduler, kind: EventKind) -> usize {
        let conn = lock(scheduler.connection()).unwrap();
        EventLog::new(&conn).events_by_kind(kind, 100).len()
    }

    #[tokio::test]
    async fn task_claim_logs_claimed_exactly_once() {
        let (coordinator, scheduler, _) = setup();
        scheduler
            .create_task(NewTask::new(TaskId::parse("T1").unwrap()))
            .unwrap();

        let outcome = coordinator
            .dispatch(ProtocolMessage::TaskClaim {
                agent_id: "agent-a".to_string(),
                ttl_ms: Some(30_000),
            })
            .await
            .unwrap();
        let DispatchOutcome::Claimed { claim: Some(claim) } = outcome else {
            panic!("expected a claim, got {outcome:?}");
        };
        assert_eq!(claim.task.id.as_str(), "T1");
        assert_eq!(count(&scheduler, EventKind::Claimed), 1);
        assert_eq!(count(&scheduler, EventKind::Leased), 1);
    }

    #[tokio::test]
    async fn lifecycle_messages_drive_the_state_machine() {
        let (coordinator, scheduler, _) = setup();
        scheduler
            .create_task(NewTask::new(TaskId::parse("T1").unwrap()))
            .unwrap();
        coordinator
            .claim_next_task(&AgentId::parse("a").unwrap(), None)
            .await
            .unwrap();

        for message in [
            ProtocolMessage::TaskStart {
                agent_id: "a".to_string(),
                task_id: "T1".to_string(),
            },
            ProtocolMessage::TaskVerifying {
                agent_id: "a".to_string(),
                task_id: "T1".to_string(),
            },
            ProtocolMessage::TaskCommit {
                agent_id: "a".to_string(),
                task_id: "T1".to_string(),
            },
        ] {
            coordinator.dispatch(message).await.unwrap();
        }
        for kind in [EventKind::Running, EventKind::Verifying, EventKind::Committed] {
            assert_eq!(count(&scheduler, kind), 1, "{kind}");
        }
    }

    #[tokio::test]
    async fn illegal_message_order_is_rejected() {
        let (coordinator, scheduler, _) = setup();
        scheduler
            .create_task(NewTask::new(TaskId::parse("T1").unwrap()))
            .unwrap();
        coordinator
            .claim_next_task(&AgentId::parse("a").unwrap(), None)
            .await
            .unwrap();
        let err = coordinator
            .dispatch(ProtocolMessage::TaskCommit {
                agent_id: "a".to_string(),
                task_id: "T1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn lifecycle_messages_from_other_agents_are_refused() {
        let (coordinator, scheduler, _) = setup();
        scheduler
            .create_task(NewTask::new(TaskId::parse("T1").unwrap()))
            .unwrap();
        coordinator
            .claim_next_task(&AgentId::parse("a").unwrap(), None)
            .await
            .unwrap();

        let err = coordinator
            .dispatch(ProtocolMessage::TaskStart {
                agent_id: "b".to_string(),
                task_id: "T1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::NotOwned { ref holder, .. } if holder == "a"));
        assert_eq!(count(&scheduler, EventKind::Running), 0);
        assert_eq!(
            scheduler
                .get_task(&TaskId::parse("T1").unwrap())
                .unwrap()
                .unwrap()
                .state,
            TaskState::Leased
        );
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_a_validation_error() {
        let (coordinator, scheduler, _) = setup();
        scheduler
            .create_task(NewTask::new(TaskId::parse("T1").unwrap()))
            .unwrap();

        for message in [
            ProtocolMessage::TaskClaim {
                agent_id: "a".to_string(),
                ttl_ms: Some(i64::MIN),
            },
            ProtocolMessage::FileReserve {
                agent_id: "a".to_string(),
                file_path: "/f.txt".to_string(),
                ttl_ms: i64::MIN,
                reason: None,
            },
            ProtocolMessage::Heartbeat {
                agent_id: "a".to_string(),
                task_id: Some("T1".to_string()),
                ttl_ms: Some(i64::MIN),
            },
        ] {
            let err = coordinator.dispatch(message).await.unwrap_err();
            assert!(matches!(err, LeaseError::Validation(_)), "{err:?}");
        }
        assert_eq!(count(&scheduler, EventKind::Claimed), 0);
    }

    #[tokio::test]
    async fn heartbeat_renews_or_records_failure() {
        let (coordinator, scheduler, clock) = setup();
        scheduler
            .create_task(NewTask::new(TaskId::parse("T1").unwrap()))
            .unwrap();
        coordinator
            .claim_next_task(&AgentId::parse("a").unwrap(), Some(Duration::seconds(10)))
            .await
            .unwrap();

        let beat = |agent: &str| ProtocolMessage::Heartbeat {
            agent_id: agent.to_string(),
            task_id: Some("T1".to_string()),
            ttl_ms: Some(10_000),
        };
        assert_eq!(
            coordinator.dispatch(beat("a")).await.unwrap(),
            DispatchOutcome::HeartbeatRecorded { renewed: Some(true) }
        );

        clock.advance(Duration::seconds(30));
        assert_eq!(
            coordinator.dispatch(beat("a")).await.unwrap(),
            DispatchOutcome::HeartbeatRecorded { renewed: Some(false) }
        );
        assert_eq!(count(&scheduler, EventKind::HeartbeatRenewFailure), 1);
    }

    #[tokio::test]
    async fn file_messages_go_through_the_runtime() {
        let (coordinator, _, _) = setup();
        let outcome = coordinator
            .dispatch(ProtocolMessage::FileReserve {
                agent_id: "a".to_string(),
                file_path: "/f.txt".to_string(),
                ttl_ms: 60_000,
                reason: Some("edit".to_string()),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::FileReserved { .. }));

        let conflict = coordinator
            .dispatch(ProtocolMessage::FileReserve {
                agent_id: "b".to_string(),
                file_path: "/f.txt".to_string(),
                ttl_ms: 60_000,
                reason: None,
            })
            .await;
        assert!(matches!(conflict, Err(LeaseError::Conflict { .. })));

        let released = coordinator
            .dispatch(ProtocolMessage::FileRelease {
                agent_id: "a".to_string(),
                file_path: "/f.txt".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(released, DispatchOutcome::FileReleased { released: true });
    }

    #[tokio::test]
    async fn drain_runs_queued_messages_in_order() {
        let clock = Arc::new(FixedClock::new(t0()));
        let runtime = Arc::new(SqliteRuntimeState::in_memory(clock.clone()).unwrap());
        let scheduler = runtime.scheduler().clone();
        let coordinator = Coordinator::new(scheduler.clone(), runtime.clone());
        scheduler
            .create_task(NewTask::new(TaskId::parse("T1").unwrap()))
            .unwrap();

        runtime
            .enqueue(ProtocolMessage::TaskClaim {
                agent_id: "a".to_string(),
                ttl_ms: None,
            })
            .await
            .unwrap();
        runtime
            .enqueue(ProtocolMessage::TaskCommit {
                agent_id: "a".to_string(),
                task_id: "T1".to_string(),
            })
            .await
            .unwrap();
        runtime
            .enqueue(ProtocolMessage::TaskStart {
                agent_id: "a".to_string(),
                task_id: "T1".to_string(),
            })
            .await
            .unwrap();

        // the out-of-order commit fails and is skipped
        let outcomes = coordinator.drain_queue(10).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[1], DispatchOutcome::Advanced { state: TaskState::Running, .. }));
        assert_eq!(count(&scheduler, EventKind::Claimed), 1);
    }
}
