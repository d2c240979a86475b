//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default workspace directory name, relative to the current directory.
pub const DEFAULT_ROOT_NAME: &str = "_gridlab_";

/// How worker slots are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Each worker is a tokio task awaiting its child process.
    #[default]
    Task,
    /// Each worker owns a dedicated blocking OS thread.
    Thread,
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "thread" => Ok(Self::Thread),
            other => Err(ConfigError::InvalidValue {
                key: "execution_mode".to_string(),
                message: format!("expected task or thread, got {other:?}"),
            }),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

/// Where tasks live on disk.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Workspace root; tasks are stored under `<root>/tasks`.
    pub root: PathBuf,
}

impl WorkspaceConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Read `GRIDLAB_ROOT`, falling back to `./_gridlab_`.
    pub fn from_env() -> Self {
        let root = std::env::var("GRIDLAB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join(DEFAULT_ROOT_NAME)
            });
        Self { root }
    }

    /// Directory holding one sub-directory per task.
    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_NAME)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size; the only concurrency control.
    pub max_workers: usize,
    /// Backing for worker slots.
    pub execution_mode: ExecutionMode,
    /// Sleep between dispatch attempts when idle or saturated.
    pub poll_interval: Duration,
    /// Interval of the incremental refresh of queued/running tasks.
    pub refresh_interval: Duration,
    /// Interval of the full disk rescan.
    pub scan_interval: Duration,
}

impl SchedulerConfig {
    /// Build from `GRIDLAB_*` variables, keeping defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(workers) = env_parse::<usize>("GRIDLAB_MAX_WORKERS")? {
            if workers == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "GRIDLAB_MAX_WORKERS".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.max_workers = workers;
        }
        if let Ok(mode) = std::env::var("GRIDLAB_EXECUTION_MODE") {
            config.execution_mode = mode.parse()?;
        }
        if let Some(ms) = env_parse::<u64>("GRIDLAB_POLL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("GRIDLAB_REFRESH_SECS")? {
            config.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("GRIDLAB_SCAN_SECS")? {
            config.scan_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            execution_mode: ExecutionMode::Task,
            poll_interval: Duration::from_millis(100),
            refresh_interval: Duration::from_secs(2),
            scan_interval: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
