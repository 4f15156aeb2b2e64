use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{ENV_DB_PATH, ENV_RUNTIME, ENV_STATE_DIR, RuntimeConfig, RuntimeMode};
use crate::domain::LeaseError;
use crate::impls::file::FileRuntimeState;
use crate::impls::sqlite::SqliteRuntimeState;
use crate::ports::{Clock, RuntimeState};

/// Open the first backend in `config.modes` that can be opened.
///
/// Failures of earlier modes are logged and the next one is tried. When none
/// opens, the error lists every attempt and how to fix the configuration.
pub async fn open_runtime_state(
    config: &RuntimeConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn RuntimeState>, LeaseError> {
    let mut failures = Vec::new();
    for mode in &config.modes {
        let opened: Result<Arc<dyn RuntimeState>, LeaseError> = match mode {
            RuntimeMode::Sqlite => open_sqlite(config, Arc::clone(&clock))
                .await
                .map(|s| Arc::new(s) as Arc<dyn RuntimeState>),
            RuntimeMode::File => FileRuntimeState::open(&config.state_dir, Arc::clone(&clock))
                .await
                .map(|s| Arc::new(s) as Arc<dyn RuntimeState>),
        };
        match opened {
            Ok(state) => {
                info!(mode = %mode, "runtime backend ready");
                return Ok(state);
            }
            Err(err) => {
                warn!(mode = %mode, error = %err, "runtime backend unavailable, trying next");
                failures.push(format!("{mode}: {err}"));
            }
        }
    }
    Err(LeaseError::BackendUnavailable(format!(
        "no runtime backend could be opened ({}). Check {ENV_RUNTIME}, make sure {ENV_DB_PATH} \
         or {ENV_STATE_DIR} points to a writable location, or switch {ENV_RUNTIME}=file",
        failures.join("; ")
    )))
}

/// Open the transactional backend regardless of the mode list.
pub async fn open_sqlite(
    config: &RuntimeConfig,
    clock: Arc<dyn Clock>,
) -> Result<SqliteRuntimeState, LeaseError> {
    let path = config.db_path.clone();
    let ttl = config.default_ttl;
    tokio::task::spawn_blocking(move || SqliteRuntimeState::open(path, clock))
        .await
        .map_err(|e| LeaseError::BackendUnavailable(format!("sqlite open task failed: {e}")))?
        .map(|state| state.with_default_ttl(ttl))
}
