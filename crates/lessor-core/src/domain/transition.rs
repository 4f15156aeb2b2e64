//! Transition - 状態遷移の検証（純粋関数）
//!
//! This is the only place transition legality is defined. Callers persist a
//! state change only after `assert_transition` returns `None`.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::TaskState;

/// A rejected state change, returned (never thrown) by [`assert_transition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionViolation {
    pub id: String,
    pub from: TaskState,
    pub to: TaskState,
    pub reason: String,
}

impl fmt::Display for TransitionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}: {} -> {}", self.reason, self.id, self.from, self.to)
    }
}

/// Legal successors of `from`.
pub fn allowed_targets(from: TaskState) -> &'static [TaskState] {
    use TaskState::*;
    match from {
        Ready => &[Leased, Dead],
        Leased => &[Running, Ready],
        Running => &[Verifying, Ready],
        Verifying => &[Committed, Rollback],
        Committed => &[Done],
        Rollback => &[Ready, Dead],
        Done | Dead => &[],
    }
}

pub fn is_legal(from: TaskState, to: TaskState) -> bool {
    allowed_targets(from).contains(&to)
}

/// Validate `from -> to` for task `id`.
///
/// Returns `None` when the edge is legal. Never panics; the caller decides
/// whether a violation is fatal.
pub fn assert_transition(from: TaskState, to: TaskState, id: &str) -> Option<TransitionViolation> {
    if is_legal(from, to) {
        return None;
    }
    Some(TransitionViolation {
        id: id.to_string(),
        from,
        to,
        reason: "illegal transition".to_string(),
    })
}
