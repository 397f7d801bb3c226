//! Error taxonomy for orchestrator operations.
//!
//! Every fallible operation on the command surface returns [`Error`]. Callers
//! that need to branch (the HTTP layer, the CLI) match on [`Error::kind`]
//! rather than on individual variants.

use std::fmt;

use serde::Serialize;

use crate::core::machine::IllegalTransition;
use crate::core::types::StepAction;
use crate::io::command::CommandError;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("task '{id}' not found")]
    TaskNotFound { id: String },

    #[error("task '{id}' already exists")]
    DuplicateTask { id: String },

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("execution gate saturated: {active} of {limit} slots in use")]
    Saturated { active: usize, limit: usize },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("unsupported plan step: cannot {action} '{file}' without an editing backend")]
    UnsupportedStep { action: StepAction, file: String },

    #[error("plan provider failed for task '{task_id}': {source:#}")]
    PlanProvider {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to create workspace for task '{task_id}': {source}")]
    WorkspaceCreateFailed {
        task_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse classification used for status codes and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Saturated,
    Timeout,
    Execution,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Saturated => "saturated",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Execution => "execution",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } | Error::UnsupportedStep { .. } => ErrorKind::Validation,
            Error::TaskNotFound { .. } => ErrorKind::NotFound,
            Error::DuplicateTask { .. } | Error::IllegalTransition(_) => ErrorKind::Conflict,
            Error::Saturated { .. } => ErrorKind::Saturated,
            Error::Command(err) => err.kind(),
            Error::PlanProvider { .. } => ErrorKind::Execution,
            Error::WorkspaceCreateFailed { .. } | Error::Io { .. } => ErrorKind::Io,
        }
    }

    /// Only saturation is worth retrying unchanged; everything else needs a
    /// different request or a different task state.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Saturated
    }
}
