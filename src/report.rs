//! JSON export of task results: parameters, runs and the metrics each run
//! appended.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::grid::ParameterSet;
use crate::store::fs::MONITOR_RUN_KEY;
use crate::store::{Task, TaskStatus, TaskStore};

/// One run and the metrics appended while it was the latest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunExport {
    pub run: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub log: PathBuf,
    pub metrics: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskExport {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub pinned: bool,
    pub notes: String,
    pub params: ParameterSet,
    pub runs: Vec<RunExport>,
    /// Entries not tied to any recorded run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unassigned: Vec<Map<String, Value>>,
}

impl TaskExport {
    /// Group the task's monitor entries under the run that produced them.
    pub fn build(task: &Task, params: ParameterSet) -> Self {
        let mut runs: Vec<RunExport> = task
            .runs
            .iter()
            .enumerate()
            .map(|(idx, run)| RunExport {
                run: idx + 1,
                started_at: run.started_at,
                finished_at: run.finished_at,
                pid: run.pid,
                exit_code: run.exit_code,
                error: run.error.clone(),
                log: task.log_path(run),
                metrics: Vec::new(),
            })
            .collect();

        let mut unassigned = Vec::new();
        for entry in &task.monitors {
            let mut entry = entry.clone();
            let run = entry
                .remove(MONITOR_RUN_KEY)
                .and_then(|v| v.as_u64())
                .map(|n| n as usize);
            match run.and_then(|n| n.checked_sub(1)).and_then(|i| runs.get_mut(i)) {
                Some(target) => target.metrics.push(entry),
                None => unassigned.push(entry),
            }
        }

        Self {
            id: task.id,
            name: task.name.clone(),
            status: task.status,
            progress: task.progress,
            pinned: task.pinned,
            notes: task.notes.clone(),
            params,
            runs,
            unassigned,
        }
    }
}

/// Export one task, reading its parameter snapshot from disk.
pub async fn export_task(store: &TaskStore, task: &Task) -> Result<TaskExport, StoreError> {
    let params = store.load_params(task).await?;
    Ok(TaskExport::build(task, params))
}

/// Export several tasks; tasks whose snapshot cannot be read are skipped.
pub async fn export_tasks(store: &TaskStore, tasks: &[Task]) -> Vec<TaskExport> {
    let results = join_all(tasks.iter().map(|t| export_task(store, t))).await;
    results
        .into_iter()
        .zip(tasks)
        .filter_map(|(result, task)| match result {
            Ok(export) => Some(export),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Skipping task in export");
                None
            }
        })
        .collect()
}

/// Write exports as pretty JSON.
pub async fn write_json(path: &Path, exports: &[TaskExport]) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(exports)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    tokio::fs::write(path, json).await?;
    info!(path = %path.display(), tasks = exports.len(), "Wrote export");
    Ok(())
}
