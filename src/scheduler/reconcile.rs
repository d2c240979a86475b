//! Keeps the in-memory list in step with disk.
//!
//! `scan_disk` rebuilds the whole list and performs crash recovery;
//! `refresh_from_disk` only re-reads queued and running tasks; `snapshot`
//! is a memory-only projection for change detection.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::store::{Task, TaskStatus};

/// task id -> (status, progress, monitor entry count).
pub type Snapshot = HashMap<Uuid, (TaskStatus, f64, usize)>;

/// Records read by one scan, tagged with the memory epoch it started at.
struct DiskScan {
    since: u64,
    tasks: Vec<Task>,
}

/// Error note for runs whose process vanished while marked running.
const LOST_NOTE: &str = "process no longer alive";

/// A run with no recorded pid may still be spawning in another process.
const SPAWN_GRACE_SECS: i64 = 30;

impl Scheduler {
    /// Rebuild the task list from every task directory.
    ///
    /// Unreadable records are skipped with a warning. A task recorded as
    /// running whose pid is dead, and which no local worker owns, is marked
    /// failed. Tasks created, changed or deleted in memory while the scan
    /// was reading keep their in-memory state. Returns the number of tasks
    /// tracked afterwards.
    pub async fn scan_disk(&self) -> Result<usize, StoreError> {
        let scan = self.read_disk().await?;
        Ok(self.apply_scan(scan).await)
    }

    async fn read_disk(&self) -> Result<DiskScan, StoreError> {
        let (since, in_flight) = {
            let state = self.state.read().await;
            (state.epoch, state.in_flight.clone())
        };
        let dirs = self.store.list_task_dirs().await?;

        let mut tasks = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let task = match self.store.load(&dir).await {
                Ok(task) => task,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping unreadable task");
                    continue;
                }
            };

            if task.status == TaskStatus::Running && !in_flight.contains(&task.id) {
                tasks.push(self.recover_orphan(task).await);
            } else {
                tasks.push(task);
            }
        }
        Ok(DiskScan { since, tasks })
    }

    async fn apply_scan(&self, scan: DiskScan) -> usize {
        let DiskScan { since, tasks } = scan;
        let mut state = self.state.write().await;

        let mut merged: Vec<Task> = tasks
            .into_iter()
            .filter(|t| !state.touched_since(t.id, since))
            .collect();
        let from_disk: HashSet<Uuid> = merged.iter().map(|t| t.id).collect();
        merged.extend(
            state
                .tasks
                .iter()
                .filter(|t| state.touched_since(t.id, since) && !from_disk.contains(&t.id))
                .cloned(),
        );
        // Batch members share a timestamp and differ only in their index.
        merged.sort_by(|a, b| {
            (a.created_at, a.name.len(), &a.name).cmp(&(b.created_at, b.name.len(), &b.name))
        });

        let known: HashSet<Uuid> = merged.iter().map(|t| t.id).collect();
        state.queue.retain(|id| known.contains(id));
        for task in &merged {
            if task.status == TaskStatus::Queued && !state.in_flight.contains(&task.id) {
                state.push_queue(task.id);
            }
        }
        let merged: Vec<Task> = merged
            .into_iter()
            .map(|task| keep_dispatched(&state, task))
            .collect();
        state.tasks = merged;
        state.touched.retain(|id, epoch| *epoch > since || known.contains(id));

        let count = known.len();
        debug!(count, "Disk scan complete");
        count
    }

    /// Re-read only queued and running tasks.
    pub async fn refresh_from_disk(&self) -> Result<(), StoreError> {
        let active: Vec<_> = {
            let state = self.state.read().await;
            state
                .tasks
                .iter()
                .filter(|t| t.status.is_active())
                .map(|t| t.dir.clone())
                .collect()
        };

        let mut fresh = Vec::with_capacity(active.len());
        for dir in active {
            match self.store.load(&dir).await {
                Ok(task) => fresh.push(task),
                // Removed externally; the next full scan drops it.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(dir = %dir.display(), error = %e, "Refresh skipped task"),
            }
        }

        let mut state = self.state.write().await;
        for task in fresh {
            let task = keep_dispatched(&state, task);
            state.replace(task);
        }
        Ok(())
    }

    /// Re-read a single task from disk.
    pub async fn refresh_task(&self, id: Uuid) -> Option<Task> {
        let dir = self.get(id).await?.dir;
        match self.store.load(&dir).await {
            Ok(task) => {
                let mut state = self.state.write().await;
                let task = keep_dispatched(&state, task);
                state.replace(task.clone());
                Some(task)
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Refresh skipped task");
                None
            }
        }
    }

    /// Memory-only projection of every tracked task.
    pub async fn snapshot(&self) -> Snapshot {
        self.state
            .read()
            .await
            .tasks
            .iter()
            .map(|t| (t.id, (t.status, t.progress, t.monitors.len())))
            .collect()
    }

    /// Mark a running task failed if its process is provably gone.
    async fn recover_orphan(&self, task: Task) -> Task {
        let alive = match task.last_run() {
            Some(run) => match run.pid {
                Some(pid) => self.runner.is_alive(pid),
                None => Utc::now() - run.started_at < chrono::Duration::seconds(SPAWN_GRACE_SECS),
            },
            None => false,
        };
        if alive {
            return task;
        }

        let runs = task.runs.len();
        let result = self
            .store
            .update(&task.dir, |t| {
                // Only touch the record we judged; a new run may have started.
                if t.status != TaskStatus::Running || t.runs.len() != runs {
                    return;
                }
                t.status = TaskStatus::Failed;
                if let Some(run) = t.runs.last_mut().filter(|r| !r.is_finished()) {
                    run.finished_at = Some(Utc::now());
                    run.error.get_or_insert_with(|| LOST_NOTE.to_string());
                }
            })
            .await;

        match result {
            Ok((recovered, ())) => {
                info!(
                    task_id = %recovered.id,
                    name = %recovered.name,
                    pid = ?task.latest_pid(),
                    "Recovered orphaned running task as failed"
                );
                recovered
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to persist crash recovery");
                task
            }
        }
    }
}

/// A task handed to a worker may still read `queued` on disk until the
/// executor's first write lands; keep it shown as running meanwhile.
fn keep_dispatched(state: &SchedulerState, mut task: Task) -> Task {
    if task.status == TaskStatus::Queued && state.in_flight.contains(&task.id) {
        task.status = TaskStatus::Running;
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::error::ExecError;
    use crate::executor::Runner;
    use crate::store::{Invocation, RunRecord, TaskStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Treats one fixed pid as alive.
    struct FixedLiveness(u32);

    #[async_trait]
    impl Runner for FixedLiveness {
        async fn run(&self, _task: Task) -> Result<RunRecord, ExecError> {
            Ok(RunRecord::new(PathBuf::from("run_logs/run1.log")))
        }

        async fn cancel(&self, _task: &Task) -> Result<bool, ExecError> {
            Ok(false)
        }

        fn is_alive(&self, pid: u32) -> bool {
            pid == self.0
        }
    }

    const LIVE_PID: u32 = 4242;

    fn scheduler(store: TaskStore) -> Scheduler {
        Scheduler::new(SchedulerConfig::default(), store, Arc::new(FixedLiveness(LIVE_PID)))
    }

    async fn mark_running(store: &TaskStore, task: &Task, pid: u32) {
        store
            .update(&task.dir, |t| {
                t.status = TaskStatus::Running;
                let mut run = RunRecord::new(PathBuf::from("run_logs/run1.log"));
                run.pid = Some(pid);
                t.runs.push(run);
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn scan_recovers_dead_running_task() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let tasks = store
            .create(Path::new("/x.sh"), &crate::grid::expand(&json!({"a": "1 | 2"})).unwrap(), "t", Invocation::ConfigFile)
            .await
            .unwrap();
        mark_running(&store, &tasks[0], 999_999).await;
        mark_running(&store, &tasks[1], LIVE_PID).await;

        let sched = scheduler(store.clone());
        assert_eq!(sched.scan_disk().await.unwrap(), 2);

        let dead = store.load(&tasks[0].dir).await.unwrap();
        assert_eq!(dead.status, TaskStatus::Failed);
        assert!(dead.runs[0].is_finished());
        assert_eq!(dead.runs[0].error.as_deref(), Some(LOST_NOTE));
        assert_eq!(sched.get(tasks[0].id).await.unwrap().status, TaskStatus::Failed);

        let alive = store.load(&tasks[1].dir).await.unwrap();
        assert_eq!(alive.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn scan_skips_corrupt_and_restores_queue() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let tasks = store
            .create(Path::new("/x.sh"), &crate::grid::expand(&json!({"a": "1 | 2 | 3"})).unwrap(), "t", Invocation::ConfigFile)
            .await
            .unwrap();
        tokio::fs::write(tasks[0].info_path(), "garbage").await.unwrap();
        store
            .update(&tasks[2].dir, |t| t.status = TaskStatus::Queued)
            .await
            .unwrap();

        let sched = scheduler(store);
        assert_eq!(sched.scan_disk().await.unwrap(), 2);
        assert!(sched.get(tasks[0].id).await.is_none());
        let queue: Vec<Uuid> = sched.state.read().await.queue.iter().copied().collect();
        assert_eq!(queue, vec![tasks[2].id]);
    }

    #[tokio::test]
    async fn writes_during_a_scan_survive_its_merge() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let sched = scheduler(store.clone());
        let old = sched
            .create_batch(Path::new("/x.sh"), &json!({"a": "1 | 2"}), "old", Invocation::ConfigFile)
            .await
            .unwrap();

        let scan = sched.read_disk().await.unwrap();

        let fresh = sched
            .create_batch(Path::new("/x.sh"), &json!({"b": "1 | 2 | 3"}), "new", Invocation::ConfigFile)
            .await
            .unwrap();
        let mut order: Vec<Uuid> = fresh.iter().map(|t| t.id).collect();
        order.push(old[1].id);
        sched.enqueue(&order).await.unwrap();
        sched.soft_delete(old[0].id).await.unwrap();

        assert_eq!(sched.apply_scan(scan).await, 4);

        assert!(sched.get(old[0].id).await.is_none());
        for id in &order {
            assert_eq!(sched.get(*id).await.unwrap().status, TaskStatus::Queued);
        }
        let queue: Vec<Uuid> = sched.state.read().await.queue.iter().copied().collect();
        assert_eq!(queue, order);

        // A later scan with nothing in between agrees with disk.
        assert_eq!(sched.scan_disk().await.unwrap(), 4);
        let queue: Vec<Uuid> = sched.state.read().await.queue.iter().copied().collect();
        assert_eq!(queue, order);
    }

    #[tokio::test]
    async fn refresh_picks_up_script_progress() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let sched = scheduler(store.clone());
        let task = sched
            .create_batch(Path::new("/x.sh"), &json!({"a": 1}), "t", Invocation::ConfigFile)
            .await
            .unwrap()
            .remove(0);
        sched.enqueue(&[task.id]).await.unwrap();

        let before = sched.snapshot().await;
        store
            .update(&task.dir, |t| t.progress = 0.5)
            .await
            .unwrap();
        store
            .append_monitor_entry(&task.dir, json!({"loss": 0.3}).as_object().unwrap().clone())
            .await
            .unwrap();
        // Snapshot never touches disk.
        assert_eq!(sched.snapshot().await, before);

        sched.refresh_from_disk().await.unwrap();
        let after = sched.snapshot().await;
        assert_eq!(after[&task.id], (TaskStatus::Queued, 0.5, 1));
        assert_ne!(after, before);
    }

    #[tokio::test]
    async fn refresh_ignores_inactive_tasks() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let sched = scheduler(store.clone());
        let task = sched
            .create_batch(Path::new("/x.sh"), &json!({"a": 1}), "t", Invocation::ConfigFile)
            .await
            .unwrap()
            .remove(0);

        store.update(&task.dir, |t| t.notes = "edited".into()).await.unwrap();
        sched.refresh_from_disk().await.unwrap();
        assert_eq!(sched.get(task.id).await.unwrap().notes, "");

        sched.scan_disk().await.unwrap();
        assert_eq!(sched.get(task.id).await.unwrap().notes, "edited");
    }
}
