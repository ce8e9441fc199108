use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors surfaced by the engine.
///
/// Only `InvalidRequest`, `Busy` and `NotFound` are returned from the
/// caller-facing entry points. Everything that goes wrong after a job record
/// exists is folded into that record's `error_message` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("partial apply: {message}")]
    PartialApply {
        message: String,
        safety_snapshot: Option<Uuid>,
    },

    #[error("process controller error: {0}")]
    Controller(String),

    #[error(transparent)]
    Store(StoreError),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Lock contention is the only failure a caller should retry blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job already exists: {0}")]
    Duplicate(Uuid),

    #[error("corrupt job record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("capture failed: {0}")]
    Capture(String),

    #[error("corrupt archive {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ArchiveError {
    pub(crate) fn capture(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::Capture(format!("{context}: {err}"))
    }

    pub(crate) fn corrupt(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

impl From<ArchiveError> for EngineError {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::Capture(message) => EngineError::Capture(message),
            ArchiveError::Corrupt { path, reason } => {
                EngineError::CorruptArchive(format!("{}: {reason}", path.display()))
            }
            ArchiveError::Io { context, source } => EngineError::Io { context, source },
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(format!("job {id}")),
            other => EngineError::Store(other),
        }
    }
}
