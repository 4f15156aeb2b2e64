//! Events - 監査ログの型付きイベント
//!
//! `kind` は閉じたタグ集合。各 kind のペイロード形状は固定で、
//! 書き込み前に `EventPayload::from_parts` で検証する（型ガード）。

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::lease::ExpiryPolicy;
use super::TaskState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    // task lifecycle
    Claimed,
    /// Legacy alias of CLAIMED, still emitted for older consumers.
    Leased,
    Running,
    Verifying,
    Committed,
    Error,

    // lease health
    HeartbeatRenewFailure,
    HeartbeatMissed,
    LeaseExpired,

    // load / backpressure
    QuotaExceeded,
    QuotaWarning,
    RateLimited,
    TaskThrottled,
    TaskQueued,
    TaskDeferred,
    TaskDropped,
    BackpressureDetected,
    PerformanceThreshold,

    // supervision
    AgentStarted,
    AgentStopped,
    AgentHealthCheck,
    SupervisorDecision,
    SupervisorAction,
    SupervisorThresholdBreach,
    SupervisorAgentIntervention,

    // security
    SecurityViolation,
    SecurityBoundaryVerification,
    SecurityEffectivenessUpdated,
    SecurityPolicyUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 29] = [
        EventKind::Claimed,
        EventKind::Leased,
        EventKind::Running,
        EventKind::Verifying,
        EventKind::Committed,
        EventKind::Error,
        EventKind::HeartbeatRenewFailure,
        EventKind::HeartbeatMissed,
        EventKind::LeaseExpired,
        EventKind::QuotaExceeded,
        EventKind::QuotaWarning,
        EventKind::RateLimited,
        EventKind::TaskThrottled,
        EventKind::TaskQueued,
        EventKind::TaskDeferred,
        EventKind::TaskDropped,
        EventKind::BackpressureDetected,
        EventKind::PerformanceThreshold,
        EventKind::AgentStarted,
        EventKind::AgentStopped,
        EventKind::AgentHealthCheck,
        EventKind::SupervisorDecision,
        EventKind::SupervisorAction,
        EventKind::SupervisorThresholdBreach,
        EventKind::SupervisorAgentIntervention,
        EventKind::SecurityViolation,
        EventKind::SecurityBoundaryVerification,
        EventKind::SecurityEffectivenessUpdated,
        EventKind::SecurityPolicyUpdated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Claimed => "CLAIMED",
            EventKind::Leased => "LEASED",
            EventKind::Running => "RUNNING",
            EventKind::Verifying => "VERIFYING",
            EventKind::Committed => "COMMITTED",
            EventKind::Error => "ERROR",
            EventKind::HeartbeatRenewFailure => "HEARTBEAT_RENEW_FAILURE",
            EventKind::HeartbeatMissed => "HEARTBEAT_MISSED",
            EventKind::LeaseExpired => "LEASE_EXPIRED",
            EventKind::QuotaExceeded => "QUOTA_EXCEEDED",
            EventKind::QuotaWarning => "QUOTA_WARNING",
            EventKind::RateLimited => "RATE_LIMITED",
            EventKind::TaskThrottled => "TASK_THROTTLED",
            EventKind::TaskQueued => "TASK_QUEUED",
            EventKind::TaskDeferred => "TASK_DEFERRED",
            EventKind::TaskDropped => "TASK_DROPPED",
            EventKind::BackpressureDetected => "BACKPRESSURE_DETECTED",
            EventKind::PerformanceThreshold => "PERFORMANCE_THRESHOLD",
            EventKind::AgentStarted => "AGENT_STARTED",
            EventKind::AgentStopped => "AGENT_STOPPED",
            EventKind::AgentHealthCheck => "AGENT_HEALTH_CHECK",
            EventKind::SupervisorDecision => "SUPERVISOR_DECISION",
            EventKind::SupervisorAction => "SUPERVISOR_ACTION",
            EventKind::SupervisorThresholdBreach => "SUPERVISOR_THRESHOLD_BREACH",
            EventKind::SupervisorAgentIntervention => "SUPERVISOR_AGENT_INTERVENTION",
            EventKind::SecurityViolation => "SECURITY_VIOLATION",
            EventKind::SecurityBoundaryVerification => "SECURITY_BOUNDARY_VERIFICATION",
            EventKind::SecurityEffectivenessUpdated => "SECURITY_EFFECTIVENESS_UPDATED",
            EventKind::SecurityPolicyUpdated => "SECURITY_POLICY_UPDATED",
        }
    }

    /// Kinds owned by the lease scheduler; nobody else may emit them.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            EventKind::Claimed
                | EventKind::Leased
                | EventKind::Running
                | EventKind::Verifying
                | EventKind::Committed
                | EventKind::Error
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

// ========================================
// ペイロード定義（kind ごとに固定）
// ========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimData {
    pub agent_id: String,
    pub attempt: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeData {
    pub from: TaskState,
    pub to: TaskState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
    pub name: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRenewFailureData {
    pub agent_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMissedData {
    pub agent_id: String,
    pub last_seen_ms: i64,
    pub missed_for_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseExpiredData {
    pub agent_id: String,
    pub attempt: i64,
    pub lease_expires_at: i64,
    pub overdue_ms: i64,
    pub policy: ExpiryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaData {
    pub quota: String,
    pub used: f64,
    pub limit: f64,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitedData {
    pub agent_id: String,
    pub retry_after_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleData {
    pub reason: String,
    pub delay_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedData {
    pub queue_depth: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredData {
    pub reason: String,
    pub until_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedData {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureData {
    pub queue_depth: i64,
    pub threshold: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdData {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStartedData {
    pub agent_id: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStoppedData {
    pub agent_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckData {
    pub agent_id: String,
    pub healthy: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorDecisionData {
    pub decision: String,
    pub rationale: String,
    #[serde(default)]
    pub target_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorActionData {
    pub action: String,
    #[serde(default)]
    pub target_agent: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionData {
    pub agent_id: String,
    pub intervention: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityViolationData {
    pub violation: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryVerificationData {
    pub boundary: String,
    pub passed: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessData {
    pub score: f64,
    #[serde(default)]
    pub previous: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdatedData {
    pub policy: String,
    pub version: String,
}

/// Typed event payload; the serde tag is the stored `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    Claimed(ClaimData),
    Leased(ClaimData),
    Running(StateChangeData),
    Verifying(StateChangeData),
    Committed(StateChangeData),
    Error(ErrorData),
    HeartbeatRenewFailure(HeartbeatRenewFailureData),
    HeartbeatMissed(HeartbeatMissedData),
    LeaseExpired(LeaseExpiredData),
    QuotaExceeded(QuotaData),
    QuotaWarning(QuotaData),
    RateLimited(RateLimitedData),
    TaskThrottled(ThrottleData),
    TaskQueued(QueuedData),
    TaskDeferred(DeferredData),
    TaskDropped(DroppedData),
    BackpressureDetected(BackpressureData),
    PerformanceThreshold(ThresholdData),
    AgentStarted(AgentStartedData),
    AgentStopped(AgentStoppedData),
    AgentHealthCheck(HealthCheckData),
    SupervisorDecision(SupervisorDecisionData),
    SupervisorAction(SupervisorActionData),
    SupervisorThresholdBreach(ThresholdData),
    SupervisorAgentIntervention(InterventionData),
    SecurityViolation(SecurityViolationData),
    SecurityBoundaryVerification(BoundaryVerificationData),
    SecurityEffectivenessUpdated(EffectivenessData),
    SecurityPolicyUpdated(PolicyUpdatedData),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Claimed(_) => EventKind::Claimed,
            EventPayload::Leased(_) => EventKind::Leased,
            EventPayload::Running(_) => EventKind::Running,
            EventPayload::Verifying(_) => EventKind::Verifying,
            EventPayload::Committed(_) => EventKind::Committed,
            EventPayload::Error(_) => EventKind::Error,
            EventPayload::HeartbeatRenewFailure(_) => EventKind::HeartbeatRenewFailure,
            EventPayload::HeartbeatMissed(_) => EventKind::HeartbeatMissed,
            EventPayload::LeaseExpired(_) => EventKind::LeaseExpired,
            EventPayload::QuotaExceeded(_) => EventKind::QuotaExceeded,
            EventPayload::QuotaWarning(_) => EventKind::QuotaWarning,
            EventPayload::RateLimited(_) => EventKind::RateLimited,
            EventPayload::TaskThrottled(_) => EventKind::TaskThrottled,
            EventPayload::TaskQueued(_) => EventKind::TaskQueued,
            EventPayload::TaskDeferred(_) => EventKind::TaskDeferred,
            EventPayload::TaskDropped(_) => EventKind::TaskDropped,
            EventPayload::BackpressureDetected(_) => EventKind::BackpressureDetected,
            EventPayload::PerformanceThreshold(_) => EventKind::PerformanceThreshold,
            EventPayload::AgentStarted(_) => EventKind::AgentStarted,
            EventPayload::AgentStopped(_) => EventKind::AgentStopped,
            EventPayload::AgentHealthCheck(_) => EventKind::AgentHealthCheck,
            EventPayload::SupervisorDecision(_) => EventKind::SupervisorDecision,
            EventPayload::SupervisorAction(_) => EventKind::SupervisorAction,
            EventPayload::SupervisorThresholdBreach(_) => EventKind::SupervisorThresholdBreach,
            EventPayload::SupervisorAgentIntervention(_) => {
                EventKind::SupervisorAgentIntervention
            }
            EventPayload::SecurityViolation(_) => EventKind::SecurityViolation,
            EventPayload::SecurityBoundaryVerification(_) => {
                EventKind::SecurityBoundaryVerification
            }
            EventPayload::SecurityEffectivenessUpdated(_) => {
                EventKind::SecurityEffectivenessUpdated
            }
            EventPayload::SecurityPolicyUpdated(_) => EventKind::SecurityPolicyUpdated,
        }
    }

    /// Type guard: accept `data` only if it has the fixed shape for `kind`.
    pub fn from_parts(kind: EventKind, data: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "kind": kind.as_str(), "data": data }))
    }

    /// Split into the stored `(kind, data)` pair.
    pub fn into_parts(self) -> Result<(EventKind, serde_json::Value), serde_json::Error> {
        let kind = self.kind();
        let mut tagged = serde_json::to_value(self)?;
        let data = tagged
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok((kind, data))
    }
}

/// True when `data` is a valid payload for `kind`.
pub fn is_valid_payload(kind: EventKind, data: &serde_json::Value) -> bool {
    EventPayload::from_parts(kind, data.clone()).is_ok()
}

/// A stored event row, exactly as persisted.
///
/// `kind` and `data_json` stay raw so that rows written by older or buggy
/// producers can still be listed and formatted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub resource_id: String,
    pub ts: i64,
    pub kind: String,
    pub data_json: String,
}

impl EventRecord {
    pub fn kind(&self) -> Result<EventKind, UnknownEventKind> {
        self.kind.parse()
    }

    pub fn data(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.data_json)
    }

    pub fn payload(&self) -> Option<EventPayload> {
        let kind = self.kind().ok()?;
        EventPayload::from_parts(kind, self.data().ok()?).ok()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.ts).single()
    }
}
