//! State - タスクの状態
//!
//! 遷移の合法性は `domain::transition` だけが定義する。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// TaskState はタスクの状態を表現
///
/// # 状態遷移
/// - READY -> LEASED -> RUNNING -> VERIFYING -> COMMITTED -> DONE
/// - VERIFYING -> ROLLBACK -> READY | DEAD
/// - LEASED / RUNNING -> READY (lease 期限切れの回収)
/// - READY -> DEAD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Ready to be claimed.
    Ready,

    /// Claimed by an agent, lease issued.
    Leased,

    /// The holder has started working on it.
    Running,

    Verifying,
    Committed,
    Rollback,

    /// Terminal: finished.
    Done,

    /// Terminal: given up.
    Dead,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Ready,
        TaskState::Leased,
        TaskState::Running,
        TaskState::Verifying,
        TaskState::Committed,
        TaskState::Rollback,
        TaskState::Done,
        TaskState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Leased => "LEASED",
            TaskState::Running => "RUNNING",
            TaskState::Verifying => "VERIFYING",
            TaskState::Committed => "COMMITTED",
            TaskState::Rollback => "ROLLBACK",
            TaskState::Done => "DONE",
            TaskState::Dead => "DEAD",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Dead)
    }

    /// Is this task eligible for `reserve`?
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskState::Ready)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task state: {0}")]
pub struct UnknownTaskState(pub String);

impl FromStr for TaskState {
    type Err = UnknownTaskState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownTaskState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_agree() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
            assert_eq!(state.to_string(), state.as_str());
        }
    }

    #[test]
    fn unknown_state_is_rejected() {
        let err = "PAUSED".parse::<TaskState>().unwrap_err();
        assert_eq!(err, UnknownTaskState("PAUSED".to_string()));
    }

    #[test]
    fn serde_uses_screaming_case() {
        let json = serde_json::to_string(&TaskState::Verifying).unwrap();
        assert_eq!(json, "\"VERIFYING\"");
    }

    #[test]
    fn only_done_and_dead_are_terminal() {
        let terminal: Vec<_> = TaskState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![TaskState::Done, TaskState::Dead]);
    }
}
