//! Task model and lifecycle state machine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::store::fs::{CONFIG_FILE, INFO_FILE};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet enqueued.
    Pending,
    /// Waiting for a free worker.
    Queued,
    /// Child process is (or was last seen) running.
    Running,
    /// Exited with code 0.
    Completed,
    /// Non-zero exit, spawn failure, cancellation or lost process.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Queued) |
            (Queued, Running) | (Queued, Failed) |
            (Running, Completed) | (Running, Failed) |
            // rerun
            (Completed, Queued) | (Failed, Queued)
        )
    }

    /// Completed or failed. Both can be re-entered through a rerun.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Queued or running: the states the incremental refresh re-reads.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// How the script receives its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    /// The script reads the snapshot named by `GRIDLAB_CONFIG`.
    #[default]
    ConfigFile,
    /// Parameters are also passed as `--key value` flags.
    CliArgs,
}

/// One execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Kept after exit for audit.
    pub pid: Option<u32>,
    /// Run log, relative to the task directory.
    pub log: PathBuf,
    pub exit_code: Option<i32>,
    /// Spawn failure, signal or cancellation note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(log: PathBuf) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            pid: None,
            log,
            exit_code: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// A unit of work: one parameter set bound to one script.
///
/// This struct is also the on-disk lifecycle record (`task_info.json`);
/// `dir` is filled in on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
    pub script: PathBuf,
    #[serde(default)]
    pub invocation: Invocation,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub runs: Vec<RunRecord>,
    #[serde(default)]
    pub monitors: Vec<Map<String, Value>>,
    #[serde(skip)]
    pub dir: PathBuf,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        script: impl Into<PathBuf>,
        dir: impl Into<PathBuf>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at,
            pinned: false,
            script: script.into(),
            invocation: Invocation::default(),
            notes: String::new(),
            env: BTreeMap::new(),
            runs: Vec::new(),
            monitors: Vec::new(),
            dir: dir.into(),
        }
    }

    /// Move to `target` if the state machine allows it.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!("Cannot transition from {} to {}", self.status, target));
        }
        self.status = target;
        Ok(())
    }

    /// Lifecycle record path.
    pub fn info_path(&self) -> PathBuf {
        self.dir.join(INFO_FILE)
    }

    /// Parameter snapshot path.
    pub fn params_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn last_run(&self) -> Option<&RunRecord> {
        self.runs.last()
    }

    /// Pid of the latest run, if it has one.
    pub fn latest_pid(&self) -> Option<u32> {
        self.runs.last().and_then(|r| r.pid)
    }

    /// Folder name of the task directory.
    pub fn folder(&self) -> &str {
        self.dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.name)
    }

    pub fn log_path(&self, run: &RunRecord) -> PathBuf {
        resolve(&self.dir, &run.log)
    }
}

fn resolve(dir: &Path, log: &Path) -> PathBuf {
    if log.is_absolute() {
        log.to_path_buf()
    } else {
        dir.join(log)
    }
}
