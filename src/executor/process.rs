//! Runs one task as a child process and records the outcome on disk.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ExecError, StoreError};
use crate::executor::command::Launch;
use crate::executor::platform::{ProcessControl, SystemProcesses};
use crate::grid::ParameterSet;
use crate::store::fs::relative_run_log;
use crate::store::{Invocation, RunRecord, Task, TaskStatus, TaskStore};

/// Attempts at the final status write before leaving it to crash recovery.
const FINAL_WRITE_ROUNDS: u32 = 3;

/// How often a live child re-reads its record to notice a cancel that
/// arrived before its pid was on disk.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Run error note when a cancel lands between marking running and spawning.
const CANCELLED_BEFORE_START: &str = "cancelled before the process started";

/// What the scheduler needs from an executor.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute one attempt of `task` and wait for it to finish.
    async fn run(&self, task: Task) -> Result<RunRecord, ExecError>;

    /// Terminate the task's live process, if any. `Ok(false)` when there
    /// was nothing to stop.
    async fn cancel(&self, task: &Task) -> Result<bool, ExecError>;

    /// Liveness probe for a recorded pid.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Spawns task scripts as child processes.
pub struct ProcessExecutor {
    store: TaskStore,
    control: Arc<dyn ProcessControl>,
}

impl ProcessExecutor {
    pub fn new(store: TaskStore) -> Self {
        Self::with_control(store, Arc::new(SystemProcesses))
    }

    pub fn with_control(store: TaskStore, control: Arc<dyn ProcessControl>) -> Self {
        Self { store, control }
    }

    /// Mark running on disk and open a fresh run record + log. `None` when
    /// the record is no longer runnable (cancelled, already running).
    async fn begin(&self, task: &Task) -> Result<(Task, Option<usize>), StoreError> {
        self.store
            .update(&task.dir, |t| {
                if !matches!(t.status, TaskStatus::Pending | TaskStatus::Queued) {
                    return None;
                }
                let mut index = t.runs.len() + 1;
                while t.dir.join(relative_run_log(index)).exists() {
                    index += 1;
                }
                t.status = TaskStatus::Running;
                t.progress = 0.0;
                t.runs.push(RunRecord::new(relative_run_log(index)));
                Some(t.runs.len() - 1)
            })
            .await
    }

    async fn spawn_and_wait(
        &self,
        task: &Task,
        slot: usize,
        launch: &Launch,
        log_path: &Path,
    ) -> Result<(Option<i32>, Option<String>), ExecError> {
        if !self.still_current(task, slot).await {
            info!(task_id = %task.id, "Task cancelled before spawn");
            return Ok((None, Some(CANCELLED_BEFORE_START.to_string())));
        }

        let log = OpenOptions::new().create(true).append(true).open(log_path)?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .current_dir(&launch.cwd)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| ExecError::Spawn {
            program: launch.program.display().to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        let mut signalled = false;
        if let Some(pid) = pid {
            debug!(task_id = %task.id, pid, "Spawned task process");
            let recorded = self
                .store
                .update(&task.dir, |t| {
                    if let Some(run) = t.runs.get_mut(slot) {
                        run.pid = Some(pid);
                    }
                    is_current(t, slot)
                })
                .await;
            match recorded {
                Ok((_, true)) => {}
                Ok((_, false)) => signalled = self.stop_cancelled(task, pid),
                Err(e) => warn!(task_id = %task.id, pid, error = %e, "Failed to record pid"),
            }
        }

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = tokio::time::sleep(CANCEL_CHECK_INTERVAL), if !signalled => {
                    if let Some(pid) = pid
                        && !self.still_current(task, slot).await
                    {
                        signalled = self.stop_cancelled(task, pid);
                    }
                }
            }
        };
        let error = exit_note(&status);
        Ok((status.code(), error))
    }

    /// Whether run `slot` is still the live attempt on disk. Unreadable
    /// records count as current.
    async fn still_current(&self, task: &Task, slot: usize) -> bool {
        match self.store.load(&task.dir).await {
            Ok(t) => is_current(&t, slot),
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "Cancel check skipped");
                true
            }
        }
    }

    /// Terminate a child whose task was cancelled. Returns whether the
    /// signal went out.
    fn stop_cancelled(&self, task: &Task, pid: u32) -> bool {
        match self.control.terminate_tree(pid) {
            Ok(()) => {
                info!(task_id = %task.id, pid, "Task was cancelled meanwhile, terminating process");
                true
            }
            Err(e) => {
                warn!(task_id = %task.id, pid, error = %e, "Failed to terminate cancelled task");
                false
            }
        }
    }

    /// Record the finished run; status only moves if this run is still the
    /// task's latest and nobody cancelled it meanwhile.
    async fn finish(
        &self,
        task: &Task,
        slot: usize,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> RunRecord {
        let success = exit_code == Some(0) && error.is_none();
        let finished_at = Utc::now();

        for round in 0..FINAL_WRITE_ROUNDS {
            let error = error.clone();
            let result = self
                .store
                .update(&task.dir, |t| {
                    let latest = t.runs.len() == slot + 1;
                    let record = t.runs.get_mut(slot).map(|run| {
                        run.finished_at = Some(finished_at);
                        run.exit_code = exit_code;
                        if run.error.is_none() {
                            run.error = error;
                        }
                        run.clone()
                    });
                    if latest && t.status == TaskStatus::Running {
                        if success {
                            t.status = TaskStatus::Completed;
                            t.progress = 1.0;
                        } else {
                            t.status = TaskStatus::Failed;
                        }
                    }
                    record
                })
                .await;

            match result {
                Ok((_, Some(record))) => return record,
                Ok((_, None)) => break,
                Err(e) => warn!(task_id = %task.id, round, error = %e, "Final status write failed"),
            }
        }

        let mut record = task
            .runs
            .get(slot)
            .cloned()
            .unwrap_or_else(|| RunRecord::new(relative_run_log(slot + 1)));
        record.finished_at = Some(finished_at);
        record.exit_code = exit_code;
        record.error = error;
        record
    }
}

#[async_trait]
impl Runner for ProcessExecutor {
    async fn run(&self, task: Task) -> Result<RunRecord, ExecError> {
        let (task, slot) = self.begin(&task).await.map_err(|e| ExecError::Spawn {
            program: task.script.display().to_string(),
            reason: format!("could not mark task running: {e}"),
        })?;
        let Some(slot) = slot else {
            return Err(ExecError::NotRunnable {
                id: task.id,
                status: task.status.to_string(),
            });
        };
        let log_path = task.log_path(&task.runs[slot]);
        let run_no = slot + 1;

        let params = match task.invocation {
            Invocation::CliArgs => self.store.load_params(&task).await,
            Invocation::ConfigFile => Ok(ParameterSet::default()),
        };

        let outcome = match params {
            Ok(params) => {
                let launch = Launch::for_task(&task, &params);
                append_line(
                    &log_path,
                    &format!("SYSTEM: Run #{run_no} started: {}", launch.display()),
                );
                self.spawn_and_wait(&task, slot, &launch, &log_path).await
            }
            Err(e) => Err(ExecError::Spawn {
                program: task.script.display().to_string(),
                reason: format!("cannot read parameter snapshot: {e}"),
            }),
        };

        match outcome {
            Ok((code, note)) => {
                let record = self.finish(&task, slot, code, note).await;
                let status = if record.exit_code == Some(0) && record.error.is_none() {
                    "completed"
                } else {
                    "failed"
                };
                append_line(&log_path, &format!("SYSTEM: Task {status} (exit code {code:?})"));
                info!(task_id = %task.id, name = %task.name, run = run_no, ?code, "Task process exited");
                Ok(record)
            }
            Err(e) => {
                append_line(&log_path, &format!("ERROR: {e}"));
                warn!(task_id = %task.id, name = %task.name, error = %e, "Task failed to start");
                self.finish(&task, slot, None, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn cancel(&self, task: &Task) -> Result<bool, ExecError> {
        // Disk has the freshest pid; the in-memory copy may predate the spawn.
        let current = self.store.load(&task.dir).await.unwrap_or_else(|_| task.clone());
        let Some(run) = current.last_run() else {
            return Ok(false);
        };
        if run.is_finished() {
            return Ok(false);
        }
        let Some(pid) = run.pid else {
            return Ok(false);
        };
        if !self.control.is_alive(pid) {
            return Ok(false);
        }

        self.control.terminate_tree(pid)?;
        info!(task_id = %task.id, pid, "Sent termination to task process group");
        Ok(true)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.control.is_alive(pid)
    }
}

fn is_current(task: &Task, slot: usize) -> bool {
    task.status == TaskStatus::Running && task.runs.len() == slot + 1
}

fn append_line(path: &Path, line: &str) {
    let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "[{stamp}] {line}"));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to write run log");
    }
}

#[cfg(unix)]
fn exit_note(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|sig| format!("terminated by signal {sig}"))
}

#[cfg(not(unix))]
fn exit_note(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::grid;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup(script_body: &str, template: serde_json::Value, invocation: Invocation) -> (ProcessExecutor, Task, TempDir) {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, script_body).unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let task = store
            .create(&script, &grid::expand(&template).unwrap(), "job", invocation)
            .await
            .unwrap()
            .remove(0);
        (ProcessExecutor::new(store), task, dir)
    }

    #[tokio::test]
    async fn zero_exit_completes() {
        let (exec, task, _dir) = setup("echo hello\n", json!({"a": 1}), Invocation::ConfigFile).await;
        let record = exec.run(task.clone()).await.unwrap();

        assert_eq!(record.exit_code, Some(0));
        let finished = record.finished_at.unwrap();
        assert!(finished >= record.started_at);
        assert!(record.pid.is_some());

        let on_disk = exec.store.load(&task.dir).await.unwrap();
        assert_eq!(on_disk.status, TaskStatus::Completed);
        assert_eq!(on_disk.progress, 1.0);
        assert_eq!(on_disk.runs.len(), 1);
        assert_eq!(on_disk.runs[0].pid, record.pid);

        let log = std::fs::read_to_string(task.dir.join("run_logs/run1.log")).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("SYSTEM: Task completed"));
    }

    #[tokio::test]
    async fn non_zero_exit_fails() {
        let (exec, task, _dir) = setup("echo boom >&2\nexit 3\n", json!({"a": 1}), Invocation::ConfigFile).await;
        let record = exec.run(task.clone()).await.unwrap();
        assert_eq!(record.exit_code, Some(3));

        let on_disk = exec.store.load(&task.dir).await.unwrap();
        assert_eq!(on_disk.status, TaskStatus::Failed);
        let log = std::fs::read_to_string(task.dir.join("run_logs/run1.log")).unwrap();
        assert!(log.contains("boom"));
    }

    #[tokio::test]
    async fn reruns_get_new_logs() {
        let (exec, task, _dir) = setup("echo again\n", json!({"a": 1}), Invocation::ConfigFile).await;
        exec.run(task.clone()).await.unwrap();
        exec.store
            .update(&task.dir, |t| t.status = TaskStatus::Queued)
            .await
            .unwrap();
        exec.run(task.clone()).await.unwrap();

        let on_disk = exec.store.load(&task.dir).await.unwrap();
        assert_eq!(on_disk.runs.len(), 2);
        assert_eq!(on_disk.runs[1].log, PathBuf::from("run_logs/run2.log"));
        assert!(task.dir.join("run_logs/run1.log").exists());
        assert!(task.dir.join("run_logs/run2.log").exists());
    }

    #[tokio::test]
    async fn script_sees_snapshot_and_flags() {
        let body = "cat \"$GRIDLAB_CONFIG\"\necho \"args: $@\"\n";
        let (exec, task, _dir) = setup(body, json!({"lr": 0.5}), Invocation::CliArgs).await;
        exec.run(task.clone()).await.unwrap();

        let log = std::fs::read_to_string(task.dir.join("run_logs/run1.log")).unwrap();
        assert!(log.contains("lr: 0.5"));
        assert!(log.contains("args: --lr 0.5"));
    }

    #[tokio::test]
    async fn custom_env_reaches_script() {
        let (exec, mut task, _dir) = setup("echo \"dev=$DEVICE\"\n", json!({"a": 1}), Invocation::ConfigFile).await;
        let (updated, _) = exec
            .store
            .update(&task.dir, |t| {
                t.env.insert("DEVICE".to_string(), "gpu1".to_string());
            })
            .await
            .unwrap();
        task = updated;
        exec.run(task.clone()).await.unwrap();
        let log = std::fs::read_to_string(task.dir.join("run_logs/run1.log")).unwrap();
        assert!(log.contains("dev=gpu1"));
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed_and_logs() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let task = store
            .create(
                Path::new("/definitely/not/here/solver"),
                &grid::expand(&json!({"a": 1})).unwrap(),
                "missing",
                Invocation::ConfigFile,
            )
            .await
            .unwrap()
            .remove(0);
        let exec = ProcessExecutor::new(store.clone());

        let result = exec.run(task.clone()).await;
        assert!(matches!(result, Err(ExecError::Spawn { .. })));

        let on_disk = store.load(&task.dir).await.unwrap();
        assert_eq!(on_disk.status, TaskStatus::Failed);
        assert!(on_disk.runs[0].error.is_some());
        let log = std::fs::read_to_string(task.dir.join("run_logs/run1.log")).unwrap();
        assert!(log.contains("ERROR"));
    }

    #[tokio::test]
    async fn cancel_terminates_process_group() {
        let (exec, task, _dir) = setup("sleep 30 &\nwait\n", json!({"a": 1}), Invocation::ConfigFile).await;
        let exec = Arc::new(exec);

        let runner = Arc::clone(&exec);
        let job = task.clone();
        let handle = tokio::spawn(async move { runner.run(job).await });

        let mut pid = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pid = exec.store.load(&task.dir).await.unwrap().latest_pid();
            if pid.is_some() {
                break;
            }
        }
        assert!(pid.is_some());

        assert!(exec.cancel(&task).await.unwrap());
        let record = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_ne!(record.exit_code, Some(0));

        let on_disk = exec.store.load(&task.dir).await.unwrap();
        assert_eq!(on_disk.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_before_pid_is_recorded_still_stops_the_script() {
        let scratch = TempDir::new().unwrap();
        let marker = scratch.path().join("finished");
        let body = format!("sleep 1\ntouch '{}'\n", marker.display());
        let (exec, task, _dir) = setup(&body, json!({"a": 1}), Invocation::CliArgs).await;
        let exec = Arc::new(exec);

        let runner = Arc::clone(&exec);
        let job = task.clone();
        let handle = tokio::spawn(async move { runner.run(job).await });

        for _ in 0..200 {
            if exec.store.load(&task.dir).await.unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // What the scheduler does when the runner found no pid to signal.
        exec.store
            .update(&task.dir, |t| t.status = TaskStatus::Failed)
            .await
            .unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_ne!(record.exit_code, Some(0));
        assert!(record.error.is_some());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "cancelled script ran to completion");
        let on_disk = exec.store.load(&task.dir).await.unwrap();
        assert_eq!(on_disk.status, TaskStatus::Failed);
        assert!(on_disk.runs[0].is_finished());
    }

    #[tokio::test]
    async fn finished_task_is_not_rerun_implicitly() {
        let (exec, task, _dir) = setup("true\n", json!({"a": 1}), Invocation::ConfigFile).await;
        exec.run(task.clone()).await.unwrap();
        let again = exec.run(task.clone()).await;
        assert!(matches!(again, Err(ExecError::NotRunnable { .. })));
        assert_eq!(exec.store.load(&task.dir).await.unwrap().runs.len(), 1);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_noop() {
        let (exec, task, _dir) = setup("true\n", json!({"a": 1}), Invocation::ConfigFile).await;
        exec.run(task.clone()).await.unwrap();
        assert!(!exec.cancel(&task).await.unwrap());
        let on_disk = exec.store.load(&task.dir).await.unwrap();
        assert_eq!(on_disk.status, TaskStatus::Completed);
    }
}
