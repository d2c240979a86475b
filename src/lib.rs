//! gridlab: local experiment runner.
//!
//! Expands parameter grids into tasks, keeps one directory per task on
//! disk and runs them as child processes on a bounded worker pool.

pub mod config;
pub mod error;
pub mod executor;
pub mod grid;
pub mod logging;
pub mod monitor;
pub mod report;
pub mod scheduler;
pub mod store;
