use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use uuid::Uuid;

use gridlab::config::{ExecutionMode, SchedulerConfig, WorkspaceConfig};
use gridlab::scheduler::{Scheduler, spawn_scheduler_loop};
use gridlab::store::{Invocation, Task, TaskStatus};
use gridlab::{grid, logging, monitor, report};

#[derive(Parser)]
#[command(name = "gridlab", version, about = "Local experiment runner")]
struct Cli {
    /// Workspace root (defaults to GRIDLAB_ROOT, then ./_gridlab_)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Task,
    Thread,
}

impl From<ModeArg> for ExecutionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Task => ExecutionMode::Task,
            ModeArg::Thread => ExecutionMode::Thread,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl From<StatusArg> for TaskStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => TaskStatus::Pending,
            StatusArg::Queued => TaskStatus::Queued,
            StatusArg::Running => TaskStatus::Running,
            StatusArg::Completed => TaskStatus::Completed,
            StatusArg::Failed => TaskStatus::Failed,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted.
    Serve {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Print how many tasks a template expands to.
    Count { template: PathBuf },
    /// Create tasks from a template.
    Batch {
        script: PathBuf,
        template: PathBuf,
        #[arg(long, default_value = "")]
        name: String,
        /// Pass parameters as --key value flags as well.
        #[arg(long)]
        cli_args: bool,
        /// Create one task from the first value of every expression.
        #[arg(long)]
        single: bool,
        /// Queue the new tasks immediately.
        #[arg(long)]
        enqueue: bool,
    },
    /// List tracked tasks.
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
    /// Queue pending tasks (by id or name).
    Enqueue { tasks: Vec<String> },
    /// Cancel a queued or running task.
    Cancel { task: String },
    /// Re-queue a completed or failed task.
    Rerun { task: String },
    /// Move a task into the trash.
    Delete { task: String },
    /// From inside a run: append a metric entry (key=value ...).
    Monitor { values: Vec<String> },
    /// From inside a run: report progress in [0, 1].
    Progress { value: f64 },
    /// Export tasks, runs and metrics as JSON.
    Export {
        output: PathBuf,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = match cli.root {
        Some(root) => WorkspaceConfig::new(root),
        None => WorkspaceConfig::from_env(),
    };

    match cli.command {
        Commands::Serve { workers, mode } => serve(workspace, workers, mode).await,
        Commands::Count { template } => {
            logging::init_stderr();
            let template = read_template(&template).await?;
            println!("{}", grid::count(&template));
            Ok(())
        }
        Commands::Monitor { values } => {
            logging::init_stderr();
            monitor::add_monitor(parse_bindings(&values)?).await;
            Ok(())
        }
        Commands::Progress { value } => {
            logging::init_stderr();
            monitor::report_progress(value).await;
            Ok(())
        }
        command => {
            logging::init_stderr();
            let scheduler = Scheduler::open(&workspace, SchedulerConfig::from_env()?)
                .await
                .with_context(|| format!("cannot open workspace {}", workspace.root.display()))?;
            run_command(&scheduler, command).await
        }
    }
}

async fn serve(workspace: WorkspaceConfig, workers: Option<usize>, mode: Option<ModeArg>) -> Result<()> {
    tokio::fs::create_dir_all(&workspace.root)
        .await
        .with_context(|| format!("cannot create workspace {}", workspace.root.display()))?;
    let _guard = logging::init_with_file(&workspace.root);

    let mut config = SchedulerConfig::from_env()?;
    if let Some(workers) = workers {
        config.max_workers = workers;
    }
    if let Some(mode) = mode {
        config.execution_mode = mode.into();
    }
    if config.max_workers == 0 {
        bail!("--workers must be at least 1");
    }

    let scheduler = Scheduler::open(&workspace, config)
        .await
        .with_context(|| format!("cannot open workspace {}", workspace.root.display()))?;
    let handle = spawn_scheduler_loop(Arc::clone(&scheduler));

    tokio::signal::ctrl_c().await?;
    tracing::info!(running = scheduler.running_count().await, "Shutting down scheduler loop");
    handle.abort();
    Ok(())
}

async fn run_command(scheduler: &Scheduler, command: Commands) -> Result<()> {
    match command {
        Commands::Batch {
            script,
            template,
            name,
            cli_args,
            single,
            enqueue,
        } => {
            let script = std::path::absolute(&script)
                .with_context(|| format!("cannot resolve {}", script.display()))?;
            let template = read_template(&template).await?;
            let invocation = if cli_args {
                Invocation::CliArgs
            } else {
                Invocation::ConfigFile
            };

            let tasks = if single {
                let params = grid::first_values(&template)?;
                scheduler.create(&script, &[params], &name, invocation).await?
            } else {
                scheduler.create_batch(&script, &template, &name, invocation).await?
            };
            if enqueue {
                let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
                scheduler.enqueue(&ids).await?;
            }
            for task in &tasks {
                println!("{}  {}", task.id, task.name);
            }
        }
        Commands::List { status } => {
            let tasks = match status {
                Some(status) => scheduler.filter(status.into()).await,
                None => scheduler.tasks().await,
            };
            for task in tasks {
                print_task(&task);
            }
        }
        Commands::Enqueue { tasks } => {
            let mut ids = Vec::with_capacity(tasks.len());
            for key in &tasks {
                ids.push(resolve(scheduler, key).await?);
            }
            let queued = scheduler.enqueue(&ids).await?;
            println!("queued {queued} of {}", ids.len());
        }
        Commands::Cancel { task } => {
            let id = resolve(scheduler, &task).await?;
            if !scheduler.cancel(id).await? {
                println!("task is not queued or running; nothing to cancel");
            }
        }
        Commands::Rerun { task } => {
            let id = resolve(scheduler, &task).await?;
            scheduler.rerun(id).await?;
        }
        Commands::Delete { task } => {
            let id = resolve(scheduler, &task).await?;
            scheduler.soft_delete(id).await?;
        }
        Commands::Export { output, status } => {
            let tasks = match status {
                Some(status) => scheduler.filter(status.into()).await,
                None => scheduler.tasks().await,
            };
            let exports = report::export_tasks(scheduler.store(), &tasks).await;
            report::write_json(&output, &exports).await?;
        }
        Commands::Serve { .. } | Commands::Count { .. } | Commands::Monitor { .. } | Commands::Progress { .. } => {
            unreachable!("handled before the workspace is opened")
        }
    }
    Ok(())
}

fn print_task(task: &Task) {
    let pin = if task.pinned { "*" } else { " " };
    println!(
        "{pin} {}  {:<10} {:>5.1}%  runs={}  {}",
        task.id,
        task.status.to_string(),
        task.progress * 100.0,
        task.runs.len(),
        task.name
    );
}

/// Accept a full id or an exact task name.
async fn resolve(scheduler: &Scheduler, key: &str) -> Result<Uuid> {
    if let Ok(id) = key.parse::<Uuid>() {
        return Ok(id);
    }
    let matches: Vec<Uuid> = scheduler
        .tasks()
        .await
        .into_iter()
        .filter(|t| t.name == key)
        .map(|t| t.id)
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("no task named {key:?}"),
        _ => bail!("{} tasks are named {key:?}; use the id", matches.len()),
    }
}

/// Load a template from JSON, or from YAML for `.yaml`/`.yml` files.
async fn read_template(path: &Path) -> Result<Value> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read template {}", path.display()))?;
    let value = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&raw)?,
        _ => serde_json::from_str(&raw)?,
    };
    Ok(value)
}

/// `key=value` pairs; values parse as JSON where possible.
fn parse_bindings(values: &[String]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for raw in values {
        let Some((key, val)) = raw.split_once('=') else {
            bail!("expected key=value, got {raw:?}");
        };
        let parsed = serde_json::from_str::<Value>(val).unwrap_or_else(|_| Value::String(val.to_string()));
        out.insert(key.trim().to_string(), parsed);
    }
    Ok(out)
}
