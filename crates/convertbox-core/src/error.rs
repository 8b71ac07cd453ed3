//! Error types for the orchestration layer.
//!
//! Errors that reach the shell serialize to `{"code": "...", "message": "..."}`.

use serde::Serialize;

use crate::engine::EngineKind;

/// Engine initialization failed (asset missing, version check failed, ...).
///
/// Cloneable so every caller awaiting the same attempt observes the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to initialize {engine} engine: {reason}")]
pub struct InitError {
    pub engine: EngineKind,
    pub reason: String,
}

impl InitError {
    pub fn new(engine: EngineKind, reason: impl Into<String>) -> Self {
        Self {
            engine,
            reason: reason.into(),
        }
    }
}

/// Reasons a job did not produce output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Initialization(#[from] InitError),
    #[error("{0}")]
    Engine(String),
    #[error("No input file selected")]
    NoInput,
    #[error("{tool} tool has no conversion engine")]
    Unsupported { tool: String },
}

impl JobError {
    pub fn engine(err: impl std::fmt::Display) -> Self {
        Self::Engine(err.to_string())
    }
}

/// Top-level error for operations exposed to the shell.
#[derive(Debug, thiserror::Error)]
pub enum ToolboxError {
    #[error(transparent)]
    Initialization(#[from] InitError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ToolboxError>;

/// Serializable error shape handed to the shell.
///
/// Each variant serializes with a snake_case `code` field for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ErrorReport {
    InitializationFailed { message: String, engine: EngineKind },
    JobFailed { message: String },
    Cancelled { message: String },
    InvalidInput { message: String },
    IoError { message: String },
}

impl ErrorReport {
    pub fn message(&self) -> &str {
        match self {
            Self::InitializationFailed { message, .. }
            | Self::JobFailed { message }
            | Self::Cancelled { message }
            | Self::InvalidInput { message }
            | Self::IoError { message } => message,
        }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl From<&JobError> for ErrorReport {
    fn from(err: &JobError) -> Self {
        match err {
            JobError::Initialization(init) => Self::InitializationFailed {
                message: init.to_string(),
                engine: init.engine,
            },
            JobError::NoInput | JobError::Unsupported { .. } => Self::InvalidInput {
                message: err.to_string(),
            },
            JobError::Engine(_) => Self::JobFailed {
                message: err.to_string(),
            },
        }
    }
}

impl From<&ToolboxError> for ErrorReport {
    fn from(err: &ToolboxError) -> Self {
        match err {
            ToolboxError::Initialization(init) => Self::InitializationFailed {
                message: init.to_string(),
                engine: init.engine,
            },
            ToolboxError::Job(job) => job.into(),
            ToolboxError::Cancelled => Self::Cancelled {
                message: err.to_string(),
            },
            ToolboxError::InvalidInput(_) => Self::InvalidInput {
                message: err.to_string(),
            },
            ToolboxError::Io(_) => Self::IoError {
                message: err.to_string(),
            },
        }
    }
}
