//! Lease - 時間制限付きの排他的な確保
//!
//! タスクとファイルパスの両方を同じ規律で扱う。
//! `ResourceRef` が「何を確保しているか」の直和型。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::errors::LeaseError;
use super::{AgentId, TaskId};

/// Prefix of synthetic keys for non-task resources.
pub const SYNTHETIC_PREFIX: &str = "file_";

/// Payload tag written on synthetic task rows.
pub const SYNTHETIC_FILE_LEASE: &str = "synthetic_file_lease";

const SYNTHETIC_HASH_CHARS: usize = 16;

/// `"file_" + first 16 hex chars of sha256(key)`.
///
/// Deterministic, so every agent computes the same row id for the same path.
/// 64 bits of hash: collisions are accepted as negligible per deployment.
pub fn synthetic_id(key: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    format!("{SYNTHETIC_PREFIX}{}", &digest[..SYNTHETIC_HASH_CHARS])
}

/// What a lease is held on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum ResourceRef {
    Task(TaskId),
    FilePath(String),
}

impl ResourceRef {
    pub fn task(id: TaskId) -> Self {
        ResourceRef::Task(id)
    }

    pub fn file(path: impl Into<String>) -> Self {
        ResourceRef::FilePath(path.into())
    }

    /// Row id used in single-table storage.
    pub fn storage_key(&self) -> String {
        match self {
            ResourceRef::Task(id) => id.as_str().to_string(),
            ResourceRef::FilePath(path) => synthetic_id(path),
        }
    }

    /// Value of the `resource_kind` discriminant column.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ResourceRef::Task(_) => "task",
            ResourceRef::FilePath(_) => "file",
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, ResourceRef::FilePath(_))
    }

    pub fn validate(&self) -> Result<(), LeaseError> {
        match self {
            ResourceRef::Task(_) => Ok(()),
            ResourceRef::FilePath(path) if path.trim().is_empty() => Err(
                LeaseError::Validation("file path must be a non-empty string".to_string()),
            ),
            ResourceRef::FilePath(_) => Ok(()),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Task(id) => write!(f, "task {id}"),
            ResourceRef::FilePath(path) => f.write_str(path),
        }
    }
}

/// An exclusive, time-boxed claim (one row per resource at most).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub resource: ResourceRef,
    pub agent_id: AgentId,
    pub lease_expires_at: DateTime<Utc>,

    /// Attempt count of the underlying row at claim time.
    pub attempt: i64,
}

impl Lease {
    /// A lease with `lease_expires_at <= now` is expired even before it is deleted.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }
}

/// Request to lease a specific resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub resource: ResourceRef,
    pub agent_id: AgentId,
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    #[serde(default)]
    pub reason: Option<String>,
}

mod duration_ms {
    use chrono::Duration;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(ttl.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = i64::deserialize(d)?;
        Duration::try_milliseconds(ms)
            .ok_or_else(|| D::Error::custom(format!("ttl_ms out of range: {ms}")))
    }
}

impl LeaseRequest {
    pub fn new(resource: ResourceRef, agent_id: AgentId, ttl: Duration) -> Self {
        Self {
            resource,
            agent_id,
            ttl,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "active" => ReservationStatus::Active,
            "released" => ReservationStatus::Released,
            _ => ReservationStatus::Expired,
        }
    }
}

/// File-path specialization of a lease.
///
/// Field names follow the reservations document layout (`agentId`, `filePath`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReservation {
    pub id: String,
    pub agent_id: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ReservationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FileReservation {
    /// Holds the path right now.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at > now
    }
}

/// A reservation held by someone else on a requested path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub file_path: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl From<&FileReservation> for ConflictInfo {
    fn from(r: &FileReservation) -> Self {
        Self {
            file_path: r.file_path.clone(),
            holder: r.agent_id.clone(),
            expires_at: r.expires_at,
            reason: r.reason.clone(),
        }
    }
}

impl ConflictInfo {
    pub fn into_error(self) -> LeaseError {
        LeaseError::Conflict {
            resource: self.file_path,
            holder: self.holder,
            expires_at: self.expires_at,
        }
    }
}

/// Pre-flight result handed to an approval workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationCheckResult {
    pub conflicts: Vec<ConflictInfo>,
    pub allow_override: bool,
}

impl ReservationCheckResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Staging may proceed without asking anyone.
    pub fn is_clear(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// What to do with an acquire request given the current reservation.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireDecision {
    Create,
    Extend,
    TakeOver,
    Override(ConflictInfo),
    Conflict(ConflictInfo),
}

/// Shared acquire rule for every reservation backend.
///
/// - none → create
/// - own → extend
/// - foreign + expired/inactive → take over
/// - foreign + live → conflict, unless an authorized override was requested
pub fn decide_acquire(
    existing: Option<&FileReservation>,
    agent_id: &str,
    now: DateTime<Utc>,
    override_authorized: bool,
) -> AcquireDecision {
    let Some(existing) = existing else {
        return AcquireDecision::Create;
    };
    if !existing.is_live(now) {
        return AcquireDecision::TakeOver;
    }
    if existing.agent_id == agent_id {
        return AcquireDecision::Extend;
    }
    let conflict = ConflictInfo::from(existing);
    if override_authorized {
        AcquireDecision::Override(conflict)
    } else {
        AcquireDecision::Conflict(conflict)
    }
}

/// Validate a renewal request and compute the new expiry.
///
/// - empty ids → `Err(Validation)` (malformed input)
/// - `ttl <= 0` or an expiry past the representable range → `Ok(None)`
/// - otherwise `Ok(Some(now + ttl))`
pub fn renewal_expiry(
    task_id: &str,
    agent_id: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, LeaseError> {
    if task_id.trim().is_empty() {
        return Err(LeaseError::Validation(
            "task_id must be a non-empty string".to_string(),
        ));
    }
    if agent_id.trim().is_empty() {
        return Err(LeaseError::Validation(
            "agent_id must be a non-empty string".to_string(),
        ));
    }
    if ttl <= Duration::zero() {
        return Ok(None);
    }
    Ok(now.checked_add_signed(ttl))
}

/// Expiry after renewing a live lease: `max(current, now) + ttl`.
///
/// Never earlier than `current` for a positive `ttl`; `None` past the
/// representable range.
pub fn extended_expiry(
    current: DateTime<Utc>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Option<DateTime<Utc>> {
    current.max(now).checked_add_signed(ttl)
}

/// TTL from wire milliseconds. Values chrono cannot represent are rejected.
pub fn ttl_from_millis(ms: i64) -> Result<Duration, LeaseError> {
    Duration::try_milliseconds(ms)
        .ok_or_else(|| LeaseError::Validation(format!("ttl_ms out of range: {ms}")))
}

/// TTL used for lease acquisition; zero / negative TTLs are malformed.
pub fn lease_expiry(ttl: Duration, now: DateTime<Utc>) -> Result<DateTime<Utc>, LeaseError> {
    if ttl <= Duration::zero() {
        return Err(LeaseError::Validation(format!(
            "ttl must be positive, got {}ms",
            ttl.num_milliseconds()
        )));
    }
    now.checked_add_signed(ttl)
        .ok_or_else(|| LeaseError::Validation("lease expiry overflows timestamp range".to_string()))
}

/// Policy hint attached to LEASE_EXPIRED events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    ReadyForRetry,
    RequiresManualIntervention,
}

/// Overdue longer than this and a human should look at it.
pub const MANUAL_INTERVENTION_AFTER: Duration = Duration::minutes(10);

impl ExpiryPolicy {
    pub fn for_overdue(overdue: Duration) -> Self {
        if overdue > MANUAL_INTERVENTION_AFTER {
            ExpiryPolicy::RequiresManualIntervention
        } else {
            ExpiryPolicy::ReadyForRetry
        }
    }
}

/// One lease removed by a reclamation sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReclaimedLease {
    pub resource_id: String,
    pub agent_id: String,
    pub attempt: i64,
    pub lease_expires_at: DateTime<Utc>,
    pub overdue_ms: i64,
    pub policy: ExpiryPolicy,
}
