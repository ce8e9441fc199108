pub mod archive;
pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod lock;
pub mod model;
pub mod retention;
pub mod store;

mod apply;
mod engine;

pub use config::{CategoryPaths, EngineConfig, SourceRoot};
pub use controller::{ControllerError, DetachedController, ProcessController};
pub use engine::{
    BackupFilter, BackupRequest, Engine, ImportRequest, MigrationFilter, ReconcileReport,
    RestoreFilter, RestoreRequest,
};
pub use errors::{EngineError, Result};
pub use events::{EventSink, JobEvent, TracingEventSink};
pub use lock::{LockHolder, WriterOperation};
pub use model::*;
pub use retention::{RetentionPolicy, RetentionReport};

/// Version stamped into export bundles for compatibility checks on import.
pub fn engine_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
