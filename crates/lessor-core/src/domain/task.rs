use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskState};

/// Default scheduling priority (lower runs first).
pub const DEFAULT_PRIORITY: i64 = 100;

/// Default visibility scope for new tasks.
pub const DEFAULT_POLICY_LABEL: &str = "private";

/// A unit of work as stored in the `tasks` table.
///
/// Created READY by whatever produces work, mutated only by the scheduler,
/// never deleted (DONE / DEAD rows stay for audit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    pub priority: i64,

    /// Incremented on every (re)claim, never decreases.
    pub attempts: i64,

    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub policy_label: String,
}

/// Producer-side description of a task to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub id: TaskId,
    pub priority: i64,
    pub payload: serde_json::Value,
    pub policy_label: String,
}

impl NewTask {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            priority: DEFAULT_PRIORITY,
            payload: serde_json::json!({}),
            policy_label: DEFAULT_POLICY_LABEL.to_string(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_policy_label(mut self, label: impl Into<String>) -> Self {
        self.policy_label = label.into();
        self
    }
}

/// Result of a successful `reserve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub task: Task,
    pub attempt: i64,
    pub lease_expires_at: DateTime<Utc>,
}

/// Error details reported through `LeaseScheduler::error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,
    pub name: String,
    pub stack: Option<String>,
}

impl TaskFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl<E: std::error::Error> From<&E> for TaskFailure {
    fn from(err: &E) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            name: std::any::type_name::<E>().to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_uses_defaults() {
        let task = NewTask::new(TaskId::parse("T1").unwrap());
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.policy_label, "private");
        assert_eq!(task.payload, serde_json::json!({}));
    }

    #[test]
    fn failure_from_error_keeps_message() {
        let io = std::io::Error::other("disk full");
        let failure = TaskFailure::from(&io);
        assert_eq!(failure.message, "disk full");
        assert!(failure.name.contains("io::error::Error"));
    }
}
