use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time snapshot of the shared runtime state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    /// Task rows per state (synthetic file rows excluded).
    pub tasks: BTreeMap<String, usize>,
    pub active_leases: usize,
    pub active_file_reservations: usize,
    pub live_heartbeats: usize,
    pub queued_messages: usize,
}

impl RuntimeStatus {
    pub fn tasks_in(&self, state: crate::domain::TaskState) -> usize {
        self.tasks.get(state.as_str()).copied().unwrap_or(0)
    }
}
