//! Task execution.
//!
//! A task runs as one child process in its own process group, with stdout
//! and stderr appended to a per-run log. The executor owns every write of
//! `running` and of the run's terminal status.

pub mod command;
pub mod platform;
pub mod process;

pub use command::{cli_flags, Launch, ENV_CONFIG, ENV_PYTHON, ENV_TASK_INFO};
pub use platform::{ProcessControl, SystemProcesses};
pub use process::{ProcessExecutor, Runner};
