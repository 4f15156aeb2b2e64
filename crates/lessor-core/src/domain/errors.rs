//! Errors - エラー型と分類
//!
//! リース操作は正しさに直結するので明示的に失敗を返す。
//! イベントログ側の失敗はここには来ない（ログに出して握りつぶす）。

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::ErrorCode;
use thiserror::Error;

use super::transition::TransitionViolation;

/// ErrorKind は失敗の運用分類
///
/// - Conflict: 他エージェントが保持中（自動リトライしない、呼び出し側が判断）
/// - Validation: 入力不正（書き込み前に拒否）
/// - Transient: 一時的なロック競合（バックオフ付きリトライ対象）
/// - Infrastructure: バックエンド障害・設定不備
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    Validation,
    Transient,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("{resource} is leased by {holder} until {}", iso(.expires_at))]
    Conflict {
        resource: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0}")]
    IllegalTransition(TransitionViolation),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{resource} is not owned by the caller (holder: {holder})")]
    NotOwned { resource: String, holder: String },

    #[error("reservation is not active: {0}")]
    Inactive(String),

    #[error("store is busy: {0}")]
    Busy(String),

    #[error("sqlite: {0}")]
    Storage(rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("runtime backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl LeaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LeaseError::Conflict { .. } | LeaseError::NotOwned { .. } => ErrorKind::Conflict,
            LeaseError::Validation(_)
            | LeaseError::IllegalTransition(_)
            | LeaseError::NotFound(_)
            | LeaseError::Inactive(_) => ErrorKind::Validation,
            LeaseError::Busy(_) => ErrorKind::Transient,
            LeaseError::Storage(_)
            | LeaseError::Io(_)
            | LeaseError::Json(_)
            | LeaseError::BackendUnavailable(_) => ErrorKind::Infrastructure,
        }
    }

    /// Only lock contention is retried automatically.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<rusqlite::Error> for LeaseError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                LeaseError::Busy(err.to_string())
            }
            _ => LeaseError::Storage(err),
        }
    }
}

pub(crate) fn iso(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn conflict_names_holder_and_iso_expiry() {
        let expires_at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();
        let err = LeaseError::Conflict {
            resource: "/f.txt".to_string(),
            holder: "agent-a".to_string(),
            expires_at,
        };
        assert_eq!(
            err.to_string(),
            "/f.txt is leased by agent-a until 2024-01-01T12:01:00.000Z"
        );
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn busy_sqlite_errors_are_transient() {
        let raw = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let err = LeaseError::from(raw);
        assert!(matches!(err, LeaseError::Busy(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn other_sqlite_errors_are_infrastructure() {
        let err = LeaseError::from(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
    }
}
