//! Scheduler: the in-memory task list, the FIFO queue and the lifecycle
//! operations exposed to callers.
//!
//! Disk is the source of truth. Every mutation goes through the store's
//! locked read-modify-write first and the in-memory copy is replaced with
//! what was written. The list, the queue, the in-flight set and the worker
//! limit all live behind one `RwLock`; no code path holds it across disk I/O.

mod pool;
mod reconcile;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ExecutionMode, SchedulerConfig, WorkspaceConfig};
use crate::error::{ConfigError, Error, SchedulerError};
use crate::executor::{ProcessExecutor, Runner};
use crate::grid::{self, ParameterSet};
use crate::store::{Invocation, Task, TaskStatus, TaskStore};

pub use pool::spawn_scheduler_loop;
pub use reconcile::Snapshot;

/// Note recorded on the latest run when a task is cancelled.
pub const CANCEL_NOTE: &str = "cancelled by user";

/// Everything guarded by the scheduler lock.
#[derive(Debug, Default)]
struct SchedulerState {
    tasks: Vec<Task>,
    /// Enqueue order; entries whose task is no longer queued are skipped.
    queue: VecDeque<Uuid>,
    /// Tasks handed to a worker and not yet finished.
    in_flight: HashSet<Uuid>,
    max_workers: usize,
    mode: ExecutionMode,
    /// Bumped on every in-memory write so a disk scan can tell which
    /// entries changed after it started reading.
    epoch: u64,
    touched: HashMap<Uuid, u64>,
}

impl SchedulerState {
    fn find(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Replace the tracked copy of `task`, if it is still tracked.
    fn replace(&mut self, task: Task) {
        self.touch(task.id);
        if let Some(slot) = self.tasks.iter_mut().find(|t| t.id == task.id) {
            *slot = task;
        }
    }

    fn touch(&mut self, id: Uuid) {
        self.epoch += 1;
        self.touched.insert(id, self.epoch);
    }

    fn touched_since(&self, id: Uuid, epoch: u64) -> bool {
        self.touched.get(&id).is_some_and(|&e| e > epoch)
    }

    fn push_queue(&mut self, id: Uuid) {
        if !self.queue.contains(&id) {
            self.queue.push_back(id);
        }
    }
}

/// Owns the task list and drives tasks through their lifecycle.
pub struct Scheduler {
    config: SchedulerConfig,
    store: TaskStore,
    runner: Arc<dyn Runner>,
    state: RwLock<SchedulerState>,
}

impl Scheduler {
    /// Create a scheduler with an empty task list. Call `scan_disk` to load
    /// existing tasks.
    pub fn new(config: SchedulerConfig, store: TaskStore, runner: Arc<dyn Runner>) -> Self {
        let state = SchedulerState {
            max_workers: config.max_workers.max(1),
            mode: config.execution_mode,
            ..Default::default()
        };
        Self {
            config,
            store,
            runner,
            state: RwLock::new(state),
        }
    }

    /// Acquire the workspace, recover from any previous crash and load
    /// every task. Failing to create the workspace is the only fatal error.
    pub async fn open(workspace: &WorkspaceConfig, config: SchedulerConfig) -> Result<Arc<Self>, Error> {
        let tasks_dir = workspace.tasks_dir();
        tokio::fs::create_dir_all(&tasks_dir)
            .await
            .map_err(|source| ConfigError::Workspace {
                path: tasks_dir.clone(),
                source,
            })?;

        let store = TaskStore::new(tasks_dir);
        let runner = Arc::new(ProcessExecutor::new(store.clone()));
        let scheduler = Arc::new(Self::new(config, store, runner));
        let loaded = scheduler.scan_disk().await?;

        info!(
            root = %workspace.root.display(),
            tasks = loaded,
            max_workers = scheduler.config.max_workers,
            mode = %scheduler.config.execution_mode,
            "Scheduler ready"
        );
        Ok(scheduler)
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Expand `template` and create one pending task per parameter set.
    ///
    /// Grid errors surface before anything touches disk.
    pub async fn create_batch(
        &self,
        script: &Path,
        template: &Value,
        name_prefix: &str,
        invocation: Invocation,
    ) -> Result<Vec<Task>, Error> {
        let sets = grid::expand(template)?;
        self.create(script, &sets, name_prefix, invocation).await
    }

    /// Create one pending task per already-concrete parameter set.
    pub async fn create(
        &self,
        script: &Path,
        sets: &[ParameterSet],
        name_prefix: &str,
        invocation: Invocation,
    ) -> Result<Vec<Task>, Error> {
        let tasks = self.store.create(script, sets, name_prefix, invocation).await?;
        let mut state = self.state.write().await;
        for task in &tasks {
            state.touch(task.id);
        }
        state.tasks.extend(tasks.iter().cloned());
        Ok(tasks)
    }

    /// Move pending tasks to queued, in the given order.
    ///
    /// Tasks in any other state are left untouched. A task whose record
    /// cannot be written is skipped with a warning and the rest are still
    /// queued in order. Returns how many were queued.
    pub async fn enqueue(&self, ids: &[Uuid]) -> Result<usize, SchedulerError> {
        let mut candidates = Vec::with_capacity(ids.len());
        {
            let state = self.state.read().await;
            for &id in ids {
                let task = state.find(id).ok_or(SchedulerError::TaskNotFound { id })?;
                if task.status == TaskStatus::Pending {
                    candidates.push(task.dir.clone());
                }
            }
        }

        let mut queued = Vec::with_capacity(candidates.len());
        for dir in candidates {
            match self
                .store
                .update(&dir, |t| t.transition_to(TaskStatus::Queued).is_ok())
                .await
            {
                Ok(written) => queued.push(written),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Could not enqueue task, skipping"),
            }
        }

        let mut state = self.state.write().await;
        let mut count = 0;
        for (task, moved) in queued {
            let id = task.id;
            if task.status == TaskStatus::Queued {
                state.push_queue(id);
            }
            state.replace(task);
            if moved {
                count += 1;
            }
        }
        info!(count, "Enqueued tasks");
        Ok(count)
    }

    /// Cancel a queued or running task: terminate its process tree and mark
    /// it failed without waiting for the process to die.
    ///
    /// Returns `false` (and changes nothing) for tasks in any other state.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, SchedulerError> {
        let task = self.get(id).await.ok_or(SchedulerError::TaskNotFound { id })?;
        if !task.status.is_active() {
            return Ok(false);
        }

        if task.status == TaskStatus::Running {
            match self.runner.cancel(&task).await {
                Ok(signalled) => info!(task_id = %id, signalled, "Cancelling running task"),
                Err(e) => warn!(task_id = %id, error = %e, "Failed to signal task process"),
            }
        }

        let (updated, changed) = self
            .store
            .update(&task.dir, |t| {
                if !t.status.is_active() {
                    return false;
                }
                t.status = TaskStatus::Failed;
                if let Some(run) = t.runs.last_mut().filter(|r| !r.is_finished()) {
                    run.error.get_or_insert_with(|| CANCEL_NOTE.to_string());
                }
                true
            })
            .await?;

        let mut state = self.state.write().await;
        state.queue.retain(|q| *q != id);
        state.replace(updated);
        Ok(changed)
    }

    /// Re-queue a completed or failed task. History is kept; the next run
    /// appends a new record and log.
    pub async fn rerun(&self, id: Uuid) -> Result<(), SchedulerError> {
        let task = self.get(id).await.ok_or(SchedulerError::TaskNotFound { id })?;
        if !task.status.is_terminal() {
            return Err(invalid(&task, TaskStatus::Queued));
        }

        let (updated, result) = self
            .store
            .update(&task.dir, |t| {
                t.transition_to(TaskStatus::Queued)?;
                t.progress = 0.0;
                Ok::<_, String>(())
            })
            .await?;
        if result.is_err() {
            let err = invalid(&updated, TaskStatus::Queued);
            self.state.write().await.replace(updated);
            return Err(err);
        }

        info!(task_id = %id, name = %updated.name, "Task re-queued");
        let mut state = self.state.write().await;
        state.push_queue(id);
        state.replace(updated);
        Ok(())
    }

    /// Move the task into the trash and stop tracking it. Running tasks
    /// must be cancelled first.
    pub async fn soft_delete(&self, id: Uuid) -> Result<(), SchedulerError> {
        let task = self.get(id).await.ok_or(SchedulerError::TaskNotFound { id })?;
        if task.status == TaskStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                id,
                state: task.status.to_string(),
                target: "deleted".to_string(),
            });
        }

        self.store.soft_delete(&task).await?;

        let mut state = self.state.write().await;
        state.tasks.retain(|t| t.id != id);
        state.queue.retain(|q| *q != id);
        state.touch(id);
        Ok(())
    }

    pub async fn set_notes(&self, id: Uuid, notes: impl Into<String>) -> Result<Task, SchedulerError> {
        let notes = notes.into();
        self.mutate(id, |t| t.notes = notes).await
    }

    pub async fn set_pinned(&self, id: Uuid, pinned: bool) -> Result<Task, SchedulerError> {
        self.mutate(id, |t| t.pinned = pinned).await
    }

    /// Replace the task's environment overrides. Blank keys are dropped.
    pub async fn set_env(&self, id: Uuid, env: BTreeMap<String, String>) -> Result<Task, SchedulerError> {
        let env: BTreeMap<String, String> = env
            .into_iter()
            .filter(|(k, _)| !k.trim().is_empty())
            .map(|(k, v)| (k.trim().to_string(), v))
            .collect();
        self.mutate(id, |t| t.env = env).await
    }

    async fn mutate<F>(&self, id: Uuid, f: F) -> Result<Task, SchedulerError>
    where
        F: FnOnce(&mut Task),
    {
        let dir = self
            .get(id)
            .await
            .map(|t| t.dir)
            .ok_or(SchedulerError::TaskNotFound { id })?;
        let (updated, ()) = self.store.update(&dir, f).await?;
        self.state.write().await.replace(updated.clone());
        Ok(updated)
    }

    /// Every tracked task, oldest first.
    pub async fn tasks(&self) -> Vec<Task> {
        self.state.read().await.tasks.clone()
    }

    pub async fn get(&self, id: Uuid) -> Option<Task> {
        self.state.read().await.find(id).cloned()
    }

    pub async fn filter(&self, status: TaskStatus) -> Vec<Task> {
        self.state
            .read()
            .await
            .tasks
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Workers currently executing a task.
    pub async fn running_count(&self) -> usize {
        self.state.read().await.in_flight.len()
    }

    pub async fn max_workers(&self) -> usize {
        self.state.read().await.max_workers
    }

    /// Resize the worker pool and switch the execution mode. Takes effect at
    /// the next dispatch; in-flight work is not interrupted.
    pub async fn set_workers(&self, max_workers: usize, mode: ExecutionMode) -> Result<(), ConfigError> {
        if max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let mut state = self.state.write().await;
        state.max_workers = max_workers;
        state.mode = mode;
        info!(max_workers, %mode, "Worker pool resized");
        Ok(())
    }
}

fn invalid(task: &Task, target: TaskStatus) -> SchedulerError {
    SchedulerError::InvalidTransition {
        id: task.id,
        state: task.status.to_string(),
        target: target.to_string(),
    }
}
