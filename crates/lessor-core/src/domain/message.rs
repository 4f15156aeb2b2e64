//! Message - エージェントから届くプロトコルメッセージとハートビート

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound protocol message, routed by the coordinator or parked in the
/// message queue by `RuntimeState::enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolMessage {
    TaskClaim {
        agent_id: String,
        #[serde(default)]
        ttl_ms: Option<i64>,
    },
    TaskStart {
        agent_id: String,
        task_id: String,
    },
    TaskVerifying {
        agent_id: String,
        task_id: String,
    },
    TaskCommit {
        agent_id: String,
        task_id: String,
    },
    TaskError {
        agent_id: String,
        task_id: String,
        message: String,
        #[serde(default)]
        retryable: bool,
    },
    Heartbeat {
        agent_id: String,
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        ttl_ms: Option<i64>,
    },
    FileReserve {
        agent_id: String,
        file_path: String,
        ttl_ms: i64,
        #[serde(default)]
        reason: Option<String>,
    },
    FileRelease {
        agent_id: String,
        file_path: String,
    },
}

impl ProtocolMessage {
    pub fn agent_id(&self) -> &str {
        match self {
            ProtocolMessage::TaskClaim { agent_id, .. }
            | ProtocolMessage::TaskStart { agent_id, .. }
            | ProtocolMessage::TaskVerifying { agent_id, .. }
            | ProtocolMessage::TaskCommit { agent_id, .. }
            | ProtocolMessage::TaskError { agent_id, .. }
            | ProtocolMessage::Heartbeat { agent_id, .. }
            | ProtocolMessage::FileReserve { agent_id, .. }
            | ProtocolMessage::FileRelease { agent_id, .. } => agent_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolMessage::TaskClaim { .. } => "TASK_CLAIM",
            ProtocolMessage::TaskStart { .. } => "TASK_START",
            ProtocolMessage::TaskVerifying { .. } => "TASK_VERIFYING",
            ProtocolMessage::TaskCommit { .. } => "TASK_COMMIT",
            ProtocolMessage::TaskError { .. } => "TASK_ERROR",
            ProtocolMessage::Heartbeat { .. } => "HEARTBEAT",
            ProtocolMessage::FileReserve { .. } => "FILE_RESERVE",
            ProtocolMessage::FileRelease { .. } => "FILE_RELEASE",
        }
    }
}

/// A message parked in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
    pub message: ProtocolMessage,
}

/// Liveness signal for dashboards. Lease correctness never depends on it.
///
/// `phase` / `safe_to_interrupt` let a supervisor decide whether it may stop
/// the agent right now (e.g. not in the middle of a write or commit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub agent_id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default = "default_safe_to_interrupt")]
    pub safe_to_interrupt: bool,
    pub last_seen: DateTime<Utc>,
}

fn default_safe_to_interrupt() -> bool {
    true
}

impl Heartbeat {
    pub fn new(agent_id: impl Into<String>, last_seen: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: None,
            task_id: None,
            phase: None,
            safe_to_interrupt: true,
            last_seen,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>, safe_to_interrupt: bool) -> Self {
        self.phase = Some(phase.into());
        self.safe_to_interrupt = safe_to_interrupt;
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_use_type_tag() {
        let msg: ProtocolMessage =
            serde_json::from_value(json!({"type": "TASK_CLAIM", "agent_id": "a"})).unwrap();
        assert_eq!(
            msg,
            ProtocolMessage::TaskClaim {
                agent_id: "a".to_string(),
                ttl_ms: None
            }
        );
        assert_eq!(msg.type_name(), "TASK_CLAIM");
        assert_eq!(msg.agent_id(), "a");
    }

    #[test]
    fn heartbeat_defaults_to_interruptible() {
        let hb: Heartbeat = serde_json::from_value(
            json!({"agentId": "a", "lastSeen": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        assert!(hb.safe_to_interrupt);
        assert_eq!(hb.phase, None);
    }
}
