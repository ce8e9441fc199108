use async_trait::async_trait;
use thiserror::Error;

use crate::model::Category;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Control surface of the live server process.
///
/// `quiesce` and `resume` must be idempotent: the engine calls `resume` after
/// every capture, including captures whose quiesce failed.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Flush pending writes and pause further ones.
    async fn quiesce(&self) -> Result<(), ControllerError>;

    async fn resume(&self) -> Result<(), ControllerError>;

    /// Stop the process. Returns whether it was running beforehand.
    async fn stop(&self) -> Result<bool, ControllerError>;

    async fn start(&self) -> Result<(), ControllerError>;

    /// Whether the running process writes to `category` on its own.
    fn writes_to(&self, _category: Category) -> bool {
        true
    }
}

/// Controller for a data set with no live process attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedController;

#[async_trait]
impl ProcessController for DetachedController {
    async fn quiesce(&self) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn stop(&self) -> Result<bool, ControllerError> {
        Ok(false)
    }

    async fn start(&self) -> Result<(), ControllerError> {
        Ok(())
    }

    fn writes_to(&self, _category: Category) -> bool {
        false
    }
}
