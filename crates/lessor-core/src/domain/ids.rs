//! Domain identifiers (strongly-typed IDs).
//!
//! Task / agent の ID は外部から渡される任意の文字列（安定・一意）。
//! Phantom type パターンで `TaskId` と `AgentId` を混同できないようにしつつ、
//! 実装は `Id<T>` に一本化している。
//!
//! 新規生成する場合は ULID を使う（時刻でソート可能・調整なしで分散生成可能）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

use super::errors::LeaseError;

/// IdMarker は各 ID 型のマーカー trait
///
/// `generate()` で使うプレフィックスと、エラーメッセージ用の名前を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
    fn label() -> &'static str;
}

/// ジェネリック ID 型（中身は空でない文字列）
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Validate and wrap an externally supplied id.
    ///
    /// Empty or whitespace-only ids are malformed input.
    pub fn parse(value: impl Into<String>) -> Result<Self, LeaseError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(LeaseError::Validation(format!(
                "{} must be a non-empty string",
                T::label()
            )));
        }
        Ok(Self {
            value,
            _marker: PhantomData,
        })
    }

    /// ULID ベースの新しい ID（例: "task-01HV..."）
    pub fn generate() -> Self {
        Self {
            value: format!("{}{}", T::prefix(), Ulid::new()),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

// derive だと T にも境界が付いてしまうので手書き
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", T::label(), self.value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> AsRef<str> for Id<T> {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }

    fn label() -> &'static str {
        "task_id"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Agent {}

impl IdMarker for Agent {
    fn prefix() -> &'static str {
        "agent-"
    }

    fn label() -> &'static str {
        "agent_id"
    }
}

/// Identifier of a Task (unit of work).
pub type TaskId = Id<Task>;

/// Identifier of an Agent (independent worker process).
pub type AgentId = Id<Agent>;
