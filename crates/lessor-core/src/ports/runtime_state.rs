//! RuntimeState port - リース状態の統一インターフェース
//!
//! 2 つのバックエンドが同じ操作を提供する：
//! - **SQLite**（トランザクション）: 同一リソースの取得は線形化可能
//! - **File**（JSON ドキュメント）: read-modify-write のみ、ロックなし。
//!   読み込みと書き込みの間に競合ウィンドウがある（弱い保証）
//!
//! 厳密な相互排他が必要な呼び出し側は SQLite を選ぶこと。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Heartbeat, Lease, LeaseError, LeaseRequest, ProtocolMessage, QueuedMessage, ResourceRef};
use crate::observability::RuntimeStatus;

/// How long a heartbeat stays relevant.
pub const HEARTBEAT_STALE_AFTER: Duration = Duration::minutes(15);

/// Retention for events of synthetic (non-task) resources.
pub const SYNTHETIC_EVENT_RETENTION: Duration = Duration::days(7);

/// What a `refresh` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub leases_expired: usize,
    pub heartbeats_pruned: usize,
    pub events_pruned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    File,
}

#[async_trait]
pub trait RuntimeState: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Park a protocol message for later processing.
    async fn enqueue(&self, message: ProtocolMessage) -> Result<QueuedMessage, LeaseError>;

    /// Pop the oldest queued message.
    async fn dequeue(&self) -> Result<Option<QueuedMessage>, LeaseError>;

    /// Lease a specific resource.
    ///
    /// Fails closed with `LeaseError::Conflict` (holder + expiry) when another
    /// agent holds an unexpired lease. Re-acquiring one's own lease extends it.
    async fn acquire_lease(&self, request: LeaseRequest) -> Result<Lease, LeaseError>;

    /// Release a lease held by `agent_id`. Returns false when there was
    /// nothing of the caller's to release.
    async fn release_lease(&self, resource: &ResourceRef, agent_id: &str) -> Result<bool, LeaseError>;

    async fn upsert_heartbeat(&self, heartbeat: Heartbeat) -> Result<(), LeaseError>;

    /// Idempotent maintenance: expire leases, prune stale heartbeats and old
    /// synthetic events.
    async fn refresh(&self) -> Result<RefreshReport, LeaseError>;

    /// Extend the lease on `resource` held by `agent_id`.
    ///
    /// Empty ids are an error; a non-positive / overflowing TTL, a missing
    /// `(resource, agent)` lease or an already expired lease yield `Ok(false)`.
    async fn renew(&self, resource: &ResourceRef, agent_id: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Reclaim every lease expired at `now`; returns how many.
    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<usize, LeaseError>;

    async fn status(&self) -> Result<RuntimeStatus, LeaseError>;
}
