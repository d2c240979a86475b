//! Script-side instrumentation.
//!
//! A managed run exports `GRIDLAB_TASK_INFO` and `GRIDLAB_CONFIG`. These
//! helpers use them to append metrics, report progress and read the
//! parameter snapshot. Outside a managed run they do nothing, and no
//! failure here ever reaches the caller: instrumentation must not crash
//! the workload it observes.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::executor::{ENV_CONFIG, ENV_TASK_INFO};
use crate::grid::ParameterSet;
use crate::store::fs::load_params_file;
use crate::store::TaskStore;

/// Handle on the lifecycle record of the current run.
#[derive(Debug, Clone)]
pub struct Monitor {
    task_dir: PathBuf,
    store: TaskStore,
}

impl Monitor {
    /// `None` outside a managed run.
    pub fn from_env() -> Option<Self> {
        let info = std::env::var_os(ENV_TASK_INFO)?;
        Self::for_record(Path::new(&info))
    }

    /// Attach to the record at `info_path` (`.../<task>/task_info.json`).
    pub fn for_record(info_path: &Path) -> Option<Self> {
        let task_dir = info_path.parent()?.to_path_buf();
        let tasks_dir = task_dir.parent()?.to_path_buf();
        Some(Self {
            task_dir,
            store: TaskStore::new(tasks_dir),
        })
    }

    /// Append one metric entry. Returns whether it was written.
    pub async fn add(&self, entry: Map<String, Value>) -> bool {
        match self.store.append_monitor_entry(&self.task_dir, entry).await {
            Ok(count) => {
                debug!(count, "Monitor entry appended");
                true
            }
            Err(e) => {
                swallow(&e);
                false
            }
        }
    }

    /// Record progress in `[0, 1]`; out-of-range values are clamped and NaN
    /// is ignored.
    pub async fn progress(&self, progress: f64) -> bool {
        if progress.is_nan() {
            return false;
        }
        let progress = progress.clamp(0.0, 1.0);
        match self
            .store
            .update(&self.task_dir, |t| t.progress = progress)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                swallow(&e);
                false
            }
        }
    }
}

fn swallow(e: &StoreError) {
    match e {
        StoreError::WriteConflict { .. } => debug!(error = %e, "Monitor write dropped"),
        _ => warn!(error = %e, "Monitor write failed"),
    }
}

/// Append a metric entry to the current run's record.
pub async fn add_monitor(entry: Map<String, Value>) -> bool {
    match Monitor::from_env() {
        Some(monitor) => monitor.add(entry).await,
        None => false,
    }
}

/// Report the current run's progress.
pub async fn report_progress(progress: f64) -> bool {
    match Monitor::from_env() {
        Some(monitor) => monitor.progress(progress).await,
        None => false,
    }
}

/// Parameters of the current run, from the snapshot named by
/// `GRIDLAB_CONFIG`.
pub async fn load_params() -> Option<ParameterSet> {
    let path = std::env::var_os(ENV_CONFIG)?;
    match load_params_file(Path::new(&path)).await {
        Ok(params) => Some(params),
        Err(e) => {
            warn!(error = %e, "Cannot read parameter snapshot");
            None
        }
    }
}
