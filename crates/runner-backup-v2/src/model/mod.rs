mod jobs;
mod kinds;

pub use jobs::{BackupJob, Job, JobId, JobRecord, Metadata, MigrationJob, RestoreJob};
pub use kinds::{BackupKind, Category, JobStatus, JobType, MigrationDirection, RetentionClass};
