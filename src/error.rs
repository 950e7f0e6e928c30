use thiserror::Error;

use crate::core::task::{TaskId, TaskStatus, TreeId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Cannot spawn under task {parent_id}: parent is {status}, not RUNNING")]
    InvalidParentState {
        parent_id: TaskId,
        status: TaskStatus,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Unknown tree: {0}")]
    UnknownTree(TreeId),

    #[error("Task {task_id} already has a recorded outcome")]
    OutcomeAlreadyRecorded { task_id: TaskId },

    #[error("Dispatcher failure: {0}")]
    DispatcherFailure(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid runtime config: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Invalid connection transition from {from} to {to}")]
    InvalidConnectionTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, Error>;
