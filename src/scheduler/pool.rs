//! Background dispatch loop and worker slots.
//!
//! One long-lived loop pops queued tasks in FIFO order while fewer than
//! `max_workers` are in flight, and runs the incremental refresh and the
//! full rescan on their own intervals. Nothing a task does can stop it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionMode;
use crate::error::ExecError;
use crate::scheduler::Scheduler;
use crate::store::{Task, TaskStatus};

/// Spawn the scheduler background loop.
///
/// Ticks:
/// 1. every `poll_interval`: dispatch queued tasks into free worker slots
/// 2. every `refresh_interval`: re-read queued/running tasks from disk
/// 3. every `scan_interval`: full rescan of the tasks directory
pub fn spawn_scheduler_loop(scheduler: Arc<Scheduler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = scheduler.config().clone();
        info!(
            poll_ms = config.poll_interval.as_millis() as u64,
            refresh_secs = config.refresh_interval.as_secs(),
            scan_secs = config.scan_interval.as_secs(),
            "Scheduler loop started"
        );

        let mut poll = tokio::time::interval(config.poll_interval);
        let mut refresh = tokio::time::interval(config.refresh_interval);
        let mut scan = tokio::time::interval(config.scan_interval);
        for tick in [&mut poll, &mut refresh, &mut scan] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // The caller already scanned at startup.
        scan.tick().await;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    scheduler.dispatch_ready().await;
                }
                _ = refresh.tick() => {
                    if let Err(e) = scheduler.refresh_from_disk().await {
                        warn!(error = %e, "Incremental refresh failed");
                    }
                }
                _ = scan.tick() => {
                    if let Err(e) = scheduler.scan_disk().await {
                        warn!(error = %e, "Disk rescan failed");
                    }
                }
            }
        }
    })
}

impl Scheduler {
    /// Hand queued tasks to workers until the pool is full. Returns how many
    /// were dispatched.
    pub async fn dispatch_ready(self: &Arc<Self>) -> usize {
        let (batch, mode) = {
            let mut state = self.state.write().await;
            let mut batch = Vec::new();
            while state.in_flight.len() < state.max_workers {
                let Some(id) = state.queue.pop_front() else {
                    break;
                };
                let Some(task) = state.tasks.iter_mut().find(|t| t.id == id) else {
                    continue;
                };
                if task.status != TaskStatus::Queued {
                    continue;
                }
                task.status = TaskStatus::Running;
                let task = task.clone();
                state.in_flight.insert(id);
                batch.push(task);
            }
            (batch, state.mode)
        };

        let dispatched = batch.len();
        for task in batch {
            debug!(task_id = %task.id, name = %task.name, %mode, "Dispatching task");
            self.launch(task, mode);
        }
        dispatched
    }

    fn launch(self: &Arc<Self>, task: Task, mode: ExecutionMode) {
        let scheduler = Arc::clone(self);
        match mode {
            ExecutionMode::Task => {
                tokio::spawn(async move { scheduler.execute(task).await });
            }
            ExecutionMode::Thread => {
                let handle = tokio::runtime::Handle::current();
                tokio::task::spawn_blocking(move || handle.block_on(scheduler.execute(task)));
            }
        }
    }

    /// Worker body: run the task, then release the slot and pick up the
    /// record the executor wrote.
    async fn execute(&self, task: Task) {
        let id = task.id;
        let name = task.name.clone();
        let dir = task.dir.clone();

        match self.runner.run(task).await {
            Ok(record) => {
                debug!(task_id = %id, name = %name, exit_code = ?record.exit_code, "Worker finished");
            }
            Err(ExecError::NotRunnable { status, .. }) => {
                debug!(task_id = %id, name = %name, %status, "Task left the queue before it started");
            }
            Err(e) => {
                warn!(task_id = %id, name = %name, error = %e, "Task run failed");
            }
        }

        let reloaded = match self.store.load(&dir).await {
            Ok(task) => Some(task),
            Err(e) => {
                error!(task_id = %id, error = %e, "Cannot reload task after run");
                None
            }
        };

        let mut state = self.state.write().await;
        state.in_flight.remove(&id);
        if let Some(task) = reloaded {
            state.replace(task);
        }
    }
}
