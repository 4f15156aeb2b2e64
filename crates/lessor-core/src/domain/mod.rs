//! Domain model (ids, states, leases, events, messages).
//!
//! ここは副作用なし。永続化は `impls`、調停は `scheduler` / `reservation` が担う。

pub mod display;
pub mod errors;
pub mod events;
pub mod ids;
pub mod lease;
pub mod message;
pub mod state;
pub mod task;
pub mod transition;

pub use self::display::{EventDisplay, Severity, format_event};
pub use self::errors::{ErrorKind, LeaseError};
pub use self::events::{EventKind, EventPayload, EventRecord};
pub use self::ids::{AgentId, TaskId};
pub use self::lease::{
    ConflictInfo, ExpiryPolicy, FileReservation, Lease, LeaseRequest, ReclaimedLease,
    ReservationCheckResult, ReservationStatus, ResourceRef, synthetic_id, ttl_from_millis,
};
pub use self::message::{Heartbeat, ProtocolMessage, QueuedMessage};
pub use self::state::TaskState;
pub use self::task::{Claim, NewTask, Task, TaskFailure};
pub use self::transition::{TransitionViolation, assert_transition};
