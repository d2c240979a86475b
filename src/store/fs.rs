//! Disk layout and persistence for tasks.
//!
//! One directory per task under the tasks root:
//! - `task_info.json`: lifecycle record (the source of truth)
//! - `task_info.lock`: advisory lock for read-modify-write cycles
//! - `config.yaml`: parameter snapshot
//! - `run_logs/runN.log`: one combined stdout/stderr log per run
//!
//! Soft-deleted tasks are moved under `.trash/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::grid::ParameterSet;
use crate::store::lock::FileLock;
use crate::store::task::{Invocation, Task};

pub const INFO_FILE: &str = "task_info.json";
pub const LOCK_FILE: &str = "task_info.lock";
pub const CONFIG_FILE: &str = "config.yaml";
pub const RUN_LOG_DIR: &str = "run_logs";
pub const TRASH_DIR: &str = ".trash";
/// Monitor entry key holding the 1-based run number (0 before any run).
pub const MONITOR_RUN_KEY: &str = "_run";

/// Lock attempts before a locked update gives up.
pub const MAX_LOCK_ATTEMPTS: u32 = 5;

const LOCK_BACKOFF_BASE: Duration = Duration::from_millis(20);

/// Owns the on-disk task layout.
#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks_dir: PathBuf,
}

impl TaskStore {
    /// Create a store rooted at `tasks_dir` (not created until `ensure_dirs`).
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.tasks_dir.join(TRASH_DIR)
    }

    /// Ensure the tasks root exists.
    pub async fn ensure_dirs(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.tasks_dir).await?;
        Ok(())
    }

    /// Materialize one task per parameter set.
    ///
    /// Batches of more than one are named `<prefix>-[k-of-N]` and share a
    /// creation timestamp. On failure, directories created so far are removed.
    pub async fn create(
        &self,
        script: &Path,
        sets: &[ParameterSet],
        name_prefix: &str,
        invocation: Invocation,
    ) -> Result<Vec<Task>, StoreError> {
        self.ensure_dirs().await?;

        let created_at = Utc::now();
        let base = match sanitize(name_prefix) {
            s if s.is_empty() => format!("task_{}", created_at.format("%Y%m%d_%H%M%S")),
            s => s,
        };
        let total = sets.len();

        let mut tasks = Vec::with_capacity(total);
        for (idx, params) in sets.iter().enumerate() {
            let name = if total > 1 {
                format!("{base}-[{}-of-{total}]", idx + 1)
            } else {
                base.clone()
            };

            match self.create_one(script, params, &name, invocation, created_at).await {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(name = %name, error = %e, "Task creation failed, rolling back batch");
                    for task in &tasks {
                        let _ = fs::remove_dir_all(&task.dir).await;
                    }
                    return Err(e);
                }
            }
        }

        info!(count = tasks.len(), prefix = %base, "Created tasks");
        Ok(tasks)
    }

    async fn create_one(
        &self,
        script: &Path,
        params: &ParameterSet,
        name: &str,
        invocation: Invocation,
        created_at: chrono::DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let dir = self.unique_dir(name).await;
        fs::create_dir_all(dir.join(RUN_LOG_DIR)).await?;

        let mut task = Task::new(name, script, &dir, created_at);
        task.invocation = invocation;

        self.save_params(&task, params).await?;
        self.save(&task).await?;

        debug!(task_id = %task.id, dir = %dir.display(), "Created task directory");
        Ok(task)
    }

    async fn unique_dir(&self, name: &str) -> PathBuf {
        let candidate = self.tasks_dir.join(name);
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        let mut n = Utc::now().timestamp_millis();
        loop {
            let candidate = self.tasks_dir.join(format!("{name}_{n}"));
            if !fs::try_exists(&candidate).await.unwrap_or(false) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Deserialize the lifecycle record in `dir`.
    pub async fn load(&self, dir: &Path) -> Result<Task, StoreError> {
        let path = dir.join(INFO_FILE);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut task: Task =
            serde_json::from_str(&raw).map_err(|e| StoreError::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        task.dir = dir.to_path_buf();
        Ok(task)
    }

    /// Atomically overwrite the lifecycle record (temp file + rename).
    pub async fn save(&self, task: &Task) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(task)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&task.info_path(), json.as_bytes()).await
    }

    /// Locked read-modify-write of the lifecycle record.
    ///
    /// Re-reads the record under the advisory lock, applies `f` and writes it
    /// back. Lock contention is retried with jittered backoff, then surfaces
    /// as `WriteConflict`.
    pub async fn update<F, R>(&self, dir: &Path, f: F) -> Result<(Task, R), StoreError>
    where
        F: FnOnce(&mut Task) -> R,
    {
        let lock_path = dir.join(LOCK_FILE);

        for attempt in 0..MAX_LOCK_ATTEMPTS {
            if let Some(_guard) = FileLock::try_acquire(&lock_path).await? {
                let mut task = self.load(dir).await?;
                let out = f(&mut task);
                self.save(&task).await?;
                return Ok((task, out));
            }

            let jitter = rand::thread_rng().gen_range(0..10);
            let delay = LOCK_BACKOFF_BASE * 2u32.pow(attempt) + Duration::from_millis(jitter);
            debug!(path = %lock_path.display(), attempt, ?delay, "Lifecycle record locked, backing off");
            tokio::time::sleep(delay).await;
        }

        Err(StoreError::WriteConflict {
            path: lock_path,
            attempts: MAX_LOCK_ATTEMPTS,
        })
    }

    /// Append one metric dictionary to the task's monitor list, stamped
    /// with the run it belongs to.
    pub async fn append_monitor_entry(
        &self,
        dir: &Path,
        mut entry: Map<String, Value>,
    ) -> Result<usize, StoreError> {
        let (_, count) = self
            .update(dir, |task| {
                entry
                    .entry(MONITOR_RUN_KEY)
                    .or_insert_with(|| Value::from(task.runs.len()));
                task.monitors.push(entry);
                task.monitors.len()
            })
            .await?;
        Ok(count)
    }

    /// Move the task directory into `.trash/`. Nothing is erased.
    pub async fn soft_delete(&self, task: &Task) -> Result<PathBuf, StoreError> {
        if !fs::try_exists(&task.dir).await.unwrap_or(false) {
            return Err(StoreError::NotFound(task.dir.clone()));
        }
        let trash = self.trash_dir();
        fs::create_dir_all(&trash).await?;

        let mut dest = trash.join(task.folder());
        if fs::try_exists(&dest).await.unwrap_or(false) {
            dest = trash.join(format!(
                "{}_{}",
                task.folder(),
                Utc::now().format("%Y%m%d_%H%M%S%3f")
            ));
        }
        fs::rename(&task.dir, &dest).await?;

        info!(task_id = %task.id, dest = %dest.display(), "Moved task to trash");
        Ok(dest)
    }

    /// Write the parameter snapshot.
    pub async fn save_params(&self, task: &Task, params: &ParameterSet) -> Result<(), StoreError> {
        let yaml =
            serde_yaml::to_string(params).map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&task.params_path(), yaml.as_bytes()).await
    }

    /// Read the parameter snapshot.
    pub async fn load_params(&self, task: &Task) -> Result<ParameterSet, StoreError> {
        load_params_file(&task.params_path()).await
    }

    /// Every task directory under the root, excluding the trash.
    pub async fn list_task_dirs(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut dirs = Vec::new();
        if !fs::try_exists(&self.tasks_dir).await.unwrap_or(false) {
            return Ok(dirs);
        }
        let mut read_dir = fs::read_dir(&self.tasks_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Path of the log for run number `index` (1-based).
    pub fn run_log_path(&self, task: &Task, index: usize) -> PathBuf {
        task.dir.join(relative_run_log(index))
    }

    /// Existing run logs, ordered by run number.
    pub async fn run_logs(&self, task: &Task) -> Result<Vec<PathBuf>, StoreError> {
        let log_dir = task.dir.join(RUN_LOG_DIR);
        let mut logs: Vec<(u64, PathBuf)> = Vec::new();
        if !fs::try_exists(&log_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut read_dir = fs::read_dir(&log_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(n) = name
                .strip_prefix("run")
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse().ok())
            {
                logs.push((n, entry.path()));
            }
        }
        logs.sort_by_key(|(n, _)| *n);
        Ok(logs.into_iter().map(|(_, p)| p).collect())
    }
}

/// `run_logs/runN.log`, relative to the task directory.
pub fn relative_run_log(index: usize) -> PathBuf {
    Path::new(RUN_LOG_DIR).join(format!("run{index}.log"))
}

/// Read a parameter snapshot file.
pub async fn load_params_file(path: &Path) -> Result<ParameterSet, StoreError> {
    let raw = fs::read_to_string(path).await?;
    serde_yaml::from_str(&raw).map_err(|e| StoreError::CorruptState {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Keep a prefix filesystem-friendly.
fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .collect::<String>()
        .trim()
        .trim_start_matches('.')
        .replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid;
    use crate::store::task::TaskStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> (TaskStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        (store, dir)
    }

    fn sets(template: Value) -> Vec<ParameterSet> {
        grid::expand(&template).unwrap()
    }

    #[tokio::test]
    async fn create_writes_layout() {
        let (store, _dir) = test_store();
        let tasks = store
            .create(
                Path::new("/opt/train.py"),
                &sets(json!({"lr": 0.01, "model": {"name": "resnet"}})),
                "exp",
                Invocation::ConfigFile,
            )
            .await
            .unwrap();

        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.name, "exp");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.info_path().exists());
        assert!(task.params_path().exists());
        assert!(task.dir.join(RUN_LOG_DIR).is_dir());

        let params = store.load_params(task).await.unwrap();
        assert_eq!(params.get("model.name"), Some(&json!("resnet")));
    }

    #[tokio::test]
    async fn batch_names_carry_index_and_share_timestamp() {
        let (store, _dir) = test_store();
        let tasks = store
            .create(
                Path::new("/opt/train.py"),
                &sets(json!({"lr": "0.1 | 0.2 | 0.3"})),
                "sweep",
                Invocation::CliArgs,
            )
            .await
            .unwrap();

        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["sweep-[1-of-3]", "sweep-[2-of-3]", "sweep-[3-of-3]"]);
        assert!(tasks.iter().all(|t| t.created_at == tasks[0].created_at));
        assert!(tasks.iter().all(|t| t.invocation == Invocation::CliArgs));
    }

    #[tokio::test]
    async fn empty_prefix_gets_timestamp_name() {
        let (store, _dir) = test_store();
        let tasks = store
            .create(Path::new("/x.py"), &sets(json!({"a": 1})), "  ", Invocation::ConfigFile)
            .await
            .unwrap();
        assert!(tasks[0].name.starts_with("task_"));
    }

    #[tokio::test]
    async fn duplicate_names_get_distinct_dirs() {
        let (store, _dir) = test_store();
        let s = sets(json!({"a": 1}));
        let a = store.create(Path::new("/x.py"), &s, "same", Invocation::ConfigFile).await.unwrap();
        let b = store.create(Path::new("/x.py"), &s, "same", Invocation::ConfigFile).await.unwrap();
        assert_ne!(a[0].dir, b[0].dir);
        assert_eq!(b[0].name, "same");
    }

    #[tokio::test]
    async fn load_roundtrip_and_dir() {
        let (store, _dir) = test_store();
        let task = store
            .create(Path::new("/x.py"), &sets(json!({"a": 1})), "t", Invocation::ConfigFile)
            .await
            .unwrap()
            .remove(0);
        let loaded = store.load(&task.dir).await.unwrap();
        assert_eq!(loaded, task);
    }

    #[tokio::test]
    async fn corrupt_record_is_reported() {
        let (store, _dir) = test_store();
        let task = store
            .create(Path::new("/x.py"), &sets(json!({"a": 1})), "t", Invocation::ConfigFile)
            .await
            .unwrap()
            .remove(0);
        fs::write(task.info_path(), "{ not json").await.unwrap();
        assert!(matches!(
            store.load(&task.dir).await,
            Err(StoreError::CorruptState { .. })
        ));
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let (store, dir) = test_store();
        assert!(matches!(
            store.load(dir.path()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_serialization_is_byte_stable() {
        let (store, _dir) = test_store();
        let task = store
            .create(
                Path::new("/x.py"),
                &sets(json!({"lr": 0.001, "layers": [64, 128], "opt": {"name": "adam", "beta": 0.9}})),
                "t",
                Invocation::ConfigFile,
            )
            .await
            .unwrap()
            .remove(0);

        let first = fs::read(task.params_path()).await.unwrap();
        let loaded = store.load_params(&task).await.unwrap();
        store.save_params(&task, &loaded).await.unwrap();
        let second = fs::read(task.params_path()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn append_monitor_entry_accumulates() {
        let (store, _dir) = test_store();
        let task = store
            .create(Path::new("/x.py"), &sets(json!({"a": 1})), "t", Invocation::ConfigFile)
            .await
            .unwrap()
            .remove(0);

        for epoch in 0..3 {
            let entry = json!({"epoch": epoch, "loss": 1.0 / (epoch + 1) as f64});
            store
                .append_monitor_entry(&task.dir, entry.as_object().unwrap().clone())
                .await
                .unwrap();
        }
        let loaded = store.load(&task.dir).await.unwrap();
        assert_eq!(loaded.monitors.len(), 3);
        assert_eq!(loaded.monitors[2]["epoch"], json!(2));
        assert_eq!(loaded.monitors[0][MONITOR_RUN_KEY], json!(0));
    }

    #[tokio::test]
    async fn contended_update_fails_with_write_conflict() {
        let (store, _dir) = test_store();
        let task = store
            .create(Path::new("/x.py"), &sets(json!({"a": 1})), "t", Invocation::ConfigFile)
            .await
            .unwrap()
            .remove(0);

        let _held = FileLock::try_acquire(&task.dir.join(LOCK_FILE)).await.unwrap().unwrap();
        let result = store
            .append_monitor_entry(&task.dir, Map::new())
            .await;
        assert!(matches!(result, Err(StoreError::WriteConflict { attempts: MAX_LOCK_ATTEMPTS, .. })));
    }

    #[tokio::test]
    async fn update_preserves_concurrent_fields() {
        let (store, _dir) = test_store();
        let task = store
            .create(Path::new("/x.py"), &sets(json!({"a": 1})), "t", Invocation::ConfigFile)
            .await
            .unwrap()
            .remove(0);

        store.append_monitor_entry(&task.dir, Map::new()).await.unwrap();
        let (updated, _) = store
            .update(&task.dir, |t| t.notes = "baseline".to_string())
            .await
            .unwrap();
        assert_eq!(updated.monitors.len(), 1);
        assert_eq!(updated.notes, "baseline");
    }

    #[tokio::test]
    async fn soft_delete_moves_to_trash() {
        let (store, _dir) = test_store();
        let task = store
            .create(Path::new("/x.py"), &sets(json!({"a": 1})), "gone", Invocation::ConfigFile)
            .await
            .unwrap()
            .remove(0);

        let dest = store.soft_delete(&task).await.unwrap();
        assert!(!task.dir.exists());
        assert!(dest.join(INFO_FILE).exists());
        assert!(dest.starts_with(store.trash_dir()));
        assert!(store.list_task_dirs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_logs_sorted_numerically() {
        let (store, _dir) = test_store();
        let task = store
            .create(Path::new("/x.py"), &sets(json!({"a": 1})), "t", Invocation::ConfigFile)
            .await
            .unwrap()
            .remove(0);
        for i in [10, 2, 1] {
            fs::write(store.run_log_path(&task, i), "x").await.unwrap();
        }
        let logs = store.run_logs(&task).await.unwrap();
        let names: Vec<String> = logs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["run1.log", "run2.log", "run10.log"]);
    }

    #[test]
    fn sanitize_strips_path_characters() {
        assert_eq!(sanitize("my exp/../x"), "my_exp..x");
        assert_eq!(sanitize("..hidden"), "hidden");
        assert_eq!(sanitize("lr-sweep_v2"), "lr-sweep_v2");
    }
}
