//! Invocation building: program, arguments, working directory, environment.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::grid::ParameterSet;
use crate::store::{Invocation, Task};

/// Absolute path of the task's parameter snapshot.
pub const ENV_CONFIG: &str = "GRIDLAB_CONFIG";
/// Absolute path of the task's lifecycle record, for metric appends.
pub const ENV_TASK_INFO: &str = "GRIDLAB_TASK_INFO";
/// Overrides the interpreter used for `.py` scripts.
pub const ENV_PYTHON: &str = "GRIDLAB_PYTHON";

/// A fully resolved child process invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl Launch {
    /// Resolve how to start `task`. `params` is only read for `CliArgs`.
    pub fn for_task(task: &Task, params: &ParameterSet) -> Self {
        let script = absolute(&task.script);
        let (program, mut args) = match interpreter_for(&script) {
            Some(interp) => (PathBuf::from(interp), vec![script.display().to_string()]),
            None => (script.clone(), Vec::new()),
        };

        if task.invocation == Invocation::CliArgs {
            args.extend(cli_flags(params));
        }

        let cwd = script
            .parent()
            .filter(|p| p.is_dir())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| task.dir.clone());

        let mut env = vec![
            (ENV_CONFIG.to_string(), absolute(&task.params_path()).display().to_string()),
            (ENV_TASK_INFO.to_string(), absolute(&task.info_path()).display().to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
        ];
        env.extend(
            task.env
                .iter()
                .filter(|(k, _)| !k.trim().is_empty())
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Self {
            program,
            args,
            cwd,
            env,
        }
    }

    /// Human-readable command line for run logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn interpreter_for(script: &Path) -> Option<String> {
    match script.extension().and_then(|e| e.to_str()) {
        Some("py") => Some(std::env::var(ENV_PYTHON).unwrap_or_else(|_| {
            if cfg!(windows) { "python" } else { "python3" }.to_string()
        })),
        Some("sh") => Some("sh".to_string()),
        Some("bash") => Some("bash".to_string()),
        _ => None,
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Reconstruct `--key value` flags; nested keys are joined with dots.
pub fn cli_flags(params: &ParameterSet) -> Vec<String> {
    let mut out = Vec::new();
    push_flags(params.as_map(), "", &mut out);
    out
}

fn push_flags(map: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Bool(true) => out.push(format!("--{name}")),
            Value::Bool(false) | Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    out.push(format!("--{name}"));
                    out.push(flag_value(item));
                }
            }
            Value::Object(child) => push_flags(child, &name, out),
            other => {
                out.push(format!("--{name}"));
                out.push(flag_value(other));
            }
        }
    }
}

fn flag_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
