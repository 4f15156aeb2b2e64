//! Config - 環境変数からのランタイム設定
//!
//! | 変数 | 既定値 |
//! |---|---|
//! | `LESSOR_RUNTIME` | `sqlite,file`（先に開けたものを使う） |
//! | `LESSOR_DB_PATH` | `.lessor/runtime.db` |
//! | `LESSOR_STATE_DIR` | `.lessor/state` |
//! | `LESSOR_VERBOSE` | off |
//! | `LESSOR_ALLOW_OVERRIDE` | off |
//! | `LESSOR_DEFAULT_TTL_MS` | `30000` |

use chrono::Duration;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

use crate::domain::LeaseError;
use crate::scheduler::DEFAULT_TTL;

pub const ENV_RUNTIME: &str = "LESSOR_RUNTIME";
pub const ENV_DB_PATH: &str = "LESSOR_DB_PATH";
pub const ENV_STATE_DIR: &str = "LESSOR_STATE_DIR";
pub const ENV_VERBOSE: &str = "LESSOR_VERBOSE";
pub const ENV_ALLOW_OVERRIDE: &str = "LESSOR_ALLOW_OVERRIDE";
pub const ENV_DEFAULT_TTL_MS: &str = "LESSOR_DEFAULT_TTL_MS";

pub const DEFAULT_DB_PATH: &str = ".lessor/runtime.db";
pub const DEFAULT_STATE_DIR: &str = ".lessor/state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Transactional SQLite store.
    Sqlite,
    /// JSON documents, weaker guarantees.
    File,
}

impl RuntimeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeMode::Sqlite => "sqlite",
            RuntimeMode::File => "file",
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown runtime mode: {0}")]
pub struct UnknownRuntimeMode(pub String);

impl FromStr for RuntimeMode {
    type Err = UnknownRuntimeMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "db" | "transactional" => Ok(RuntimeMode::Sqlite),
            "file" | "json" => Ok(RuntimeMode::File),
            other => Err(UnknownRuntimeMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Backends to try, in order.
    pub modes: Vec<RuntimeMode>,
    pub db_path: PathBuf,
    pub state_dir: PathBuf,
    pub verbose: bool,
    pub allow_override: bool,
    pub default_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            modes: vec![RuntimeMode::Sqlite, RuntimeMode::File],
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            verbose: false,
            allow_override: false,
            default_ttl: DEFAULT_TTL,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, LeaseError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LeaseError> {
        let mut config = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(raw) = value(ENV_RUNTIME) {
            config.modes = parse_modes(&raw)?;
        }
        if let Some(path) = value(ENV_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(dir) = value(ENV_STATE_DIR) {
            config.state_dir = PathBuf::from(dir);
        }
        config.verbose = value(ENV_VERBOSE).is_some_and(|v| is_truthy(&v));
        config.allow_override = value(ENV_ALLOW_OVERRIDE).is_some_and(|v| is_truthy(&v));
        if let Some(raw) = value(ENV_DEFAULT_TTL_MS) {
            let ms: i64 = raw.trim().parse().map_err(|_| {
                LeaseError::Validation(format!("{ENV_DEFAULT_TTL_MS} must be an integer, got {raw:?}"))
            })?;
            if ms <= 0 {
                return Err(LeaseError::Validation(format!(
                    "{ENV_DEFAULT_TTL_MS} must be positive, got {ms}"
                )));
            }
            config.default_ttl = Duration::milliseconds(ms);
        }
        Ok(config)
    }
}

/// Comma-separated fallback list. Unknown entries are skipped with a warning;
/// a list with nothing usable is an error.
pub fn parse_modes(raw: &str) -> Result<Vec<RuntimeMode>, LeaseError> {
    let mut modes = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.parse::<RuntimeMode>() {
            Ok(mode) if !modes.contains(&mode) => modes.push(mode),
            Ok(_) => {}
            Err(err) => warn!(%err, "ignoring unsupported runtime mode"),
        }
    }
    if modes.is_empty() {
        return Err(LeaseError::BackendUnavailable(format!(
            "{ENV_RUNTIME}={raw:?} names no supported runtime; use a comma-separated list of \
             'sqlite' (aliases: db, transactional) and 'file' (alias: json)"
        )));
    }
    Ok(modes)
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
