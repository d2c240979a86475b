//! Error types for gridlab.

use std::path::PathBuf;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Grid syntax error: {0}")]
    Grid(#[from] GridError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Executor error: {0}")]
    Exec(#[from] ExecError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Workspace {path} is not usable: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Malformed batch expression in a parameter template.
///
/// Raised before any task is created; nothing is partially materialized.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GridError {
    #[error("zip group {group} has members of unequal length: {detail}")]
    ZipLengthMismatch { group: String, detail: String },

    #[error("range {expr} at {key} needs a positive step")]
    NonPositiveStep { key: String, expr: String },

    #[error("range {expr} at {key} is empty")]
    EmptyRange { key: String, expr: String },

    #[error("range {expr} at {key} has more than {limit} values")]
    RangeTooLong {
        key: String,
        expr: String,
        limit: usize,
    },

    #[error("template expands to more than {limit} parameter sets")]
    ExpansionTooLarge { limit: usize },

    #[error("cannot parse literal {literal:?} at {key}")]
    BadLiteral { key: String, literal: String },

    #[error("template root must be a mapping")]
    NotAMapping,
}

/// Task store (filesystem) errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Corrupt lifecycle record at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("Lock on {path} still contended after {attempts} attempts")]
    WriteConflict { path: PathBuf, attempts: u32 },

    #[error("Task directory not found: {0}")]
    NotFound(PathBuf),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process executor errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("Task {id} is {status}, not runnable")]
    NotRunnable { id: Uuid, status: String },

    #[error("Run log error: {0}")]
    Log(#[from] std::io::Error),
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Task {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
