use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::kinds::{BackupKind, JobStatus, JobType, MigrationDirection, RetentionClass};

pub type JobId = Uuid;

/// Free-form, capture-specific details attached to a job.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Shared lifecycle behaviour of every persisted job.
pub trait JobRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Record directory name inside the state dir.
    const TABLE: &'static str;
    const JOB_TYPE: JobType;

    fn id(&self) -> JobId;
    fn status(&self) -> JobStatus;
    fn created_at(&self) -> DateTime<Utc>;
    fn actor(&self) -> &str;
    /// Short label used in events and logs.
    fn kind_label(&self) -> String;

    fn mark_running(&mut self, at: DateTime<Utc>);
    fn mark_failed(&mut self, message: String, at: DateTime<Utc>);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: JobId,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: BackupKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub actor: String,
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    #[serde(default)]
    pub archive_size_bytes: Option<u64>,
    pub retention_class: RetentionClass,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl BackupJob {
    pub fn pending(
        id: JobId,
        kind: BackupKind,
        retention_class: RetentionClass,
        name: Option<String>,
        actor: String,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            actor,
            archive_path: None,
            archive_size_bytes: None,
            retention_class,
            metadata: Metadata::new(),
            error_message: None,
        }
    }

    pub fn mark_success(&mut self, archive_path: PathBuf, size_bytes: u64, at: DateTime<Utc>) {
        self.status = JobStatus::Success;
        self.archive_path = Some(archive_path);
        self.archive_size_bytes = Some(size_bytes);
        self.error_message = None;
        self.completed_at = Some(at);
    }

    /// Migration-kind captures are never pruned regardless of their class.
    pub fn is_retention_exempt(&self) -> bool {
        self.kind == BackupKind::Migration || self.retention_class == RetentionClass::Permanent
    }
}

impl JobRecord for BackupJob {
    const TABLE: &'static str = "backups";
    const JOB_TYPE: JobType = JobType::Backup;

    fn id(&self) -> JobId {
        self.id
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn actor(&self) -> &str {
        &self.actor
    }

    fn kind_label(&self) -> String {
        self.kind.to_string()
    }

    fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(at);
    }

    fn mark_failed(&mut self, message: String, at: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.archive_path = None;
        self.archive_size_bytes = None;
        self.error_message = Some(message);
        self.completed_at = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreJob {
    pub id: JobId,
    pub backup_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub actor: String,
    pub restore_scope: BackupKind,
    #[serde(default)]
    pub pre_restore_backup_id: Option<JobId>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl RestoreJob {
    pub fn pending(id: JobId, backup_id: JobId, scope: BackupKind, actor: String) -> Self {
        Self {
            id,
            backup_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            actor,
            restore_scope: scope,
            pre_restore_backup_id: None,
            metadata: Metadata::new(),
            error_message: None,
        }
    }

    pub fn mark_success(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Success;
        self.error_message = None;
        self.completed_at = Some(at);
    }
}

impl JobRecord for RestoreJob {
    const TABLE: &'static str = "restores";
    const JOB_TYPE: JobType = JobType::Restore;

    fn id(&self) -> JobId {
        self.id
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn actor(&self) -> &str {
        &self.actor
    }

    fn kind_label(&self) -> String {
        self.restore_scope.to_string()
    }

    fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(at);
    }

    fn mark_failed(&mut self, message: String, at: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message);
        self.completed_at = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: JobId,
    pub direction: MigrationDirection,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub actor: String,
    /// Produced bundle (export only).
    #[serde(default)]
    pub bundle_path: Option<PathBuf>,
    #[serde(default)]
    pub bundle_size_bytes: Option<u64>,
    /// Bundle being applied (import only).
    #[serde(default)]
    pub source_bundle_path: Option<PathBuf>,
    #[serde(default)]
    pub pre_restore_backup_id: Option<JobId>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl MigrationJob {
    pub fn pending_export(id: JobId, actor: String) -> Self {
        Self::pending(id, MigrationDirection::Export, actor, None)
    }

    pub fn pending_import(id: JobId, actor: String, source_bundle_path: PathBuf) -> Self {
        Self::pending(id, MigrationDirection::Import, actor, Some(source_bundle_path))
    }

    fn pending(
        id: JobId,
        direction: MigrationDirection,
        actor: String,
        source_bundle_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            direction,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            actor,
            bundle_path: None,
            bundle_size_bytes: None,
            source_bundle_path,
            pre_restore_backup_id: None,
            metadata: Metadata::new(),
            error_message: None,
        }
    }

    pub fn mark_exported(&mut self, bundle_path: PathBuf, size_bytes: u64, at: DateTime<Utc>) {
        self.bundle_path = Some(bundle_path);
        self.bundle_size_bytes = Some(size_bytes);
        self.mark_success(at);
    }

    pub fn mark_success(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Success;
        self.error_message = None;
        self.completed_at = Some(at);
    }
}

impl JobRecord for MigrationJob {
    const TABLE: &'static str = "migrations";
    const JOB_TYPE: JobType = JobType::Migration;

    fn id(&self) -> JobId {
        self.id
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn actor(&self) -> &str {
        &self.actor
    }

    fn kind_label(&self) -> String {
        self.direction.to_string()
    }

    fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(at);
    }

    fn mark_failed(&mut self, message: String, at: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.bundle_path = None;
        self.bundle_size_bytes = None;
        self.error_message = Some(message);
        self.completed_at = Some(at);
    }
}

/// Any job, as returned by id lookups that do not know the table up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Job {
    Backup(BackupJob),
    Restore(RestoreJob),
    Migration(MigrationJob),
}

impl Job {
    pub fn id(&self) -> JobId {
        match self {
            Job::Backup(job) => job.id,
            Job::Restore(job) => job.id,
            Job::Migration(job) => job.id,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Job::Backup(job) => job.status,
            Job::Restore(job) => job.status,
            Job::Migration(job) => job.status,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Job::Backup(_) => JobType::Backup,
            Job::Restore(_) => JobType::Restore,
            Job::Migration(_) => JobType::Migration,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Job::Backup(job) => job.error_message.as_deref(),
            Job::Restore(job) => job.error_message.as_deref(),
            Job::Migration(job) => job.error_message.as_deref(),
        }
    }
}
