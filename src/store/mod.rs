//! Task store: owns the on-disk layout of one directory per task.
//!
//! - `task`: Task, RunRecord and the status state machine
//! - `fs`: TaskStore with create, load, save, locked update and soft delete
//! - `lock`: advisory file lock for read-modify-write cycles

pub mod fs;
pub mod lock;
pub mod task;

pub use fs::TaskStore;
pub use task::{Invocation, RunRecord, Task, TaskStatus};
