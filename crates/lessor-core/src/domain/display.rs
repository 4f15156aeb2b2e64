//! Display - イベントの表示用整形（純粋関数）
//!
//! 壊れたペイロードでも panic せず、error 重大度の要約に落とす。

use serde::{Deserialize, Serialize};

use super::errors::iso;
use super::events::{EventPayload, EventRecord};
use super::lease::ExpiryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDisplay {
    pub kind: String,
    /// ISO-8601.
    pub timestamp: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub severity: Severity,
}

pub fn format_event(record: &EventRecord) -> EventDisplay {
    let timestamp = record
        .timestamp()
        .map(|ts| iso(&ts))
        .unwrap_or_else(|| record.ts.to_string());

    let data = match record.data() {
        Ok(data) => data,
        Err(err) => {
            return EventDisplay {
                kind: record.kind.clone(),
                timestamp,
                summary: format!("invalid event data for {}", record.resource_id),
                details: Some(serde_json::json!({ "parse_error": err.to_string() })),
                severity: Severity::Error,
            };
        }
    };

    let Ok(kind) = record.kind() else {
        return EventDisplay {
            kind: record.kind.clone(),
            timestamp,
            summary: format!("unrecognized event {} on {}", record.kind, record.resource_id),
            details: Some(data),
            severity: Severity::Warning,
        };
    };

    let payload = match EventPayload::from_parts(kind, data.clone()) {
        Ok(payload) => payload,
        Err(err) => {
            return EventDisplay {
                kind: record.kind.clone(),
                timestamp,
                summary: format!("invalid event data for {} ({kind})", record.resource_id),
                details: Some(serde_json::json!({ "parse_error": err.to_string(), "raw": data })),
                severity: Severity::Error,
            };
        }
    };

    let (summary, severity) = summarize(&record.resource_id, &payload);
    EventDisplay {
        kind: kind.as_str().to_string(),
        timestamp,
        summary,
        details: Some(data),
        severity,
    }
}

fn summarize(id: &str, payload: &EventPayload) -> (String, Severity) {
    use EventPayload as P;
    use Severity::*;
    match payload {
        P::Claimed(d) | P::Leased(d) => (
            format!("{id} claimed by {} (attempt {})", d.agent_id, d.attempt),
            Info,
        ),
        P::Running(d) => (format!("{id} started running ({} -> {})", d.from, d.to), Info),
        P::Verifying(d) => (format!("{id} is verifying ({} -> {})", d.from, d.to), Info),
        P::Committed(d) => (format!("{id} committed ({} -> {})", d.from, d.to), Info),
        P::Error(d) => (format!("{id} failed: {}: {}", d.name, d.message), Error),
        P::HeartbeatRenewFailure(d) => (
            format!("{} could not renew {id}: {}", d.agent_id, d.reason),
            Warning,
        ),
        P::HeartbeatMissed(d) => (
            format!("{} missed heartbeat for {}ms", d.agent_id, d.missed_for_ms),
            Warning,
        ),
        P::LeaseExpired(d) => {
            let severity = match d.policy {
                ExpiryPolicy::ReadyForRetry => Warning,
                ExpiryPolicy::RequiresManualIntervention => Error,
            };
            (
                format!(
                    "lease on {id} held by {} expired {}ms ago",
                    d.agent_id, d.overdue_ms
                ),
                severity,
            )
        }
        P::QuotaExceeded(d) => (
            format!("quota {} exceeded: {}/{}", d.quota, d.used, d.limit),
            Error,
        ),
        P::QuotaWarning(d) => (
            format!("quota {} nearing limit: {}/{}", d.quota, d.used, d.limit),
            Warning,
        ),
        P::RateLimited(d) => (
            format!("{} rate limited, retry after {}ms", d.agent_id, d.retry_after_ms),
            Warning,
        ),
        P::TaskThrottled(d) => (
            format!("{id} throttled for {}ms: {}", d.delay_ms, d.reason),
            Warning,
        ),
        P::TaskQueued(d) => (format!("{id} queued (depth {})", d.queue_depth), Info),
        P::TaskDeferred(d) => (format!("{id} deferred: {}", d.reason), Info),
        P::TaskDropped(d) => (format!("{id} dropped: {}", d.reason), Error),
        P::BackpressureDetected(d) => (
            format!("backpressure: depth {} over {}", d.queue_depth, d.threshold),
            Warning,
        ),
        P::PerformanceThreshold(d) => (
            format!("{} at {} crossed {}", d.metric, d.value, d.threshold),
            Warning,
        ),
        P::AgentStarted(d) => (format!("agent {} started", d.agent_id), Info),
        P::AgentStopped(d) => (format!("agent {} stopped", d.agent_id), Info),
        P::AgentHealthCheck(d) if d.healthy => {
            (format!("agent {} healthy", d.agent_id), Info)
        }
        P::AgentHealthCheck(d) => (format!("agent {} unhealthy", d.agent_id), Warning),
        P::SupervisorDecision(d) => (
            format!("supervisor decided {}: {}", d.decision, d.rationale),
            Info,
        ),
        P::SupervisorAction(d) => (format!("supervisor action {}", d.action), Info),
        P::SupervisorThresholdBreach(d) => (
            format!("supervisor threshold {} breached: {} > {}", d.metric, d.value, d.threshold),
            Warning,
        ),
        P::SupervisorAgentIntervention(d) => (
            format!("intervention on {}: {} ({})", d.agent_id, d.intervention, d.reason),
            Warning,
        ),
        P::SecurityViolation(d) => (format!("security violation: {}", d.violation), Critical),
        P::SecurityBoundaryVerification(d) if d.passed => {
            (format!("boundary {} verified", d.boundary), Info)
        }
        P::SecurityBoundaryVerification(d) => {
            (format!("boundary {} verification failed", d.boundary), Error)
        }
        P::SecurityEffectivenessUpdated(d) => {
            (format!("security effectiveness now {}", d.score), Info)
        }
        P::SecurityPolicyUpdated(d) => (
            format!("security policy {} updated to {}", d.policy, d.version),
            Info,
        ),
    }
}
