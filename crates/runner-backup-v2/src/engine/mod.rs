//! Job runner: validates requests, takes the single-writer lock, records the
//! `Pending` job and hands the rest to a spawned task.

mod backup;
mod migration;
mod reconcile;
mod restore;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::{self, Manifest};
use crate::config::EngineConfig;
use crate::controller::ProcessController;
use crate::errors::{EngineError, Result};
use crate::events::{EventSink, JobEvent};
use crate::lock::{LockHolder, WriterLock, WriterOperation};
use crate::model::{
    BackupJob, BackupKind, Job, JobRecord, JobStatus, MigrationDirection, MigrationJob, RestoreJob,
    RetentionClass,
};
use crate::retention::{self, RetentionReport};
use crate::store::JobStore;

pub use reconcile::ReconcileReport;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub kind: BackupKind,
    pub retention_class: RetentionClass,
    pub name: Option<String>,
    pub actor: String,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub backup_id: Uuid,
    pub scope: BackupKind,
    pub actor: String,
    pub take_safety_snapshot: bool,
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub bundle_path: PathBuf,
    pub actor: String,
    pub take_safety_snapshot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<BackupKind>,
    pub retention_class: Option<RetentionClass>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreFilter {
    pub status: Option<JobStatus>,
    pub backup_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationFilter {
    pub status: Option<JobStatus>,
    pub direction: Option<MigrationDirection>,
    pub limit: Option<usize>,
}

/// Handle to the backup engine. Cheap to clone; all clones share one
/// store, one writer lock and one controller.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    store: JobStore,
    lock: WriterLock,
    controller: Arc<dyn ProcessController>,
    events: Arc<dyn EventSink>,
    // Job tasks still owed to a `wait_for` caller, including post-backup retention.
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl Engine {
    /// Open the engine over `config.server_root` and reconcile whatever an
    /// earlier process left behind.
    pub async fn open(
        config: EngineConfig,
        controller: Arc<dyn ProcessController>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let root_meta = tokio::fs::metadata(&config.server_root).await.map_err(|err| {
            EngineError::InvalidConfig(format!(
                "server root {} is not accessible: {err}",
                config.server_root.display()
            ))
        })?;
        if !root_meta.is_dir() {
            return Err(EngineError::InvalidConfig(format!(
                "server root {} is not a directory",
                config.server_root.display()
            )));
        }

        let state_dir = config.state_dir();
        let store = JobStore::open(&state_dir).await?;
        tokio::fs::create_dir_all(config.archive_dir())
            .await
            .map_err(|err| EngineError::io("creating archive directory", err))?;

        let engine = Self {
            inner: Arc::new(EngineInner {
                lock: WriterLock::new(&state_dir),
                config,
                store,
                controller,
                events,
                tasks: Mutex::new(HashMap::new()),
            }),
        };

        match engine.reconcile().await {
            Ok(report) if !report.is_clean() => info!("startup reconciliation: {report}"),
            Ok(_) => {}
            Err(EngineError::Busy(holder)) => {
                warn!("skipping startup reconciliation, writer lock is held: {holder}");
            }
            Err(err) => return Err(err),
        }
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start a backup. Returns the id of the `Pending` job.
    pub async fn create_backup(&self, request: BackupRequest) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let guard = self.inner.lock.try_acquire(Some(id), WriterOperation::Backup)?;

        let mut job = BackupJob::pending(
            id,
            request.kind,
            request.retention_class,
            request.name,
            request.actor,
        );
        job.metadata = self.inner.backup_metadata(job.name.as_deref());
        self.inner.store.create(&job).await?;
        self.inner.emit(&job);
        info!("backup {id} ({}) queued by {}", job.kind, job.actor);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let finished = inner.run_backup(id).await;
            drop(guard);
            if let Some(job) = finished {
                if job.status == JobStatus::Success {
                    inner.retention_after_backup(&job).await;
                }
            }
        });
        self.track(id, task);
        Ok(id)
    }

    /// Start a restore of `scope` from a successful backup.
    pub async fn restore(&self, request: RestoreRequest) -> Result<Uuid> {
        let backup = self.restorable_backup(request.backup_id, request.scope).await?;

        let id = Uuid::new_v4();
        let guard = self.inner.lock.try_acquire(Some(id), WriterOperation::Restore)?;

        let job = RestoreJob::pending(id, backup.id, request.scope, request.actor);
        self.inner.store.create(&job).await?;
        self.inner.emit(&job);
        info!(
            "restore {id} of backup {} ({}) queued by {}",
            backup.id, job.restore_scope, job.actor
        );

        let inner = Arc::clone(&self.inner);
        let take_safety_snapshot = request.take_safety_snapshot;
        let task = tokio::spawn(async move {
            inner.run_restore(id, backup, take_safety_snapshot).await;
            drop(guard);
        });
        self.track(id, task);
        Ok(id)
    }

    /// Manifest of a successful backup, read without extracting anything.
    pub async fn preview_backup(&self, backup_id: Uuid) -> Result<Manifest> {
        let path = self.successful_archive(backup_id).await?;
        blocking(move || archive::list_manifest(&path)).await
    }

    /// Stream the whole archive and check every member against its manifest.
    pub async fn verify_backup(&self, backup_id: Uuid) -> Result<Manifest> {
        let path = self.successful_archive(backup_id).await?;
        blocking(move || archive::verify(&path)).await
    }

    /// Start a migration export of the full data set.
    pub async fn export_bundle(&self, actor: String) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let guard = self
            .inner
            .lock
            .try_acquire(Some(id), WriterOperation::MigrationExport)?;

        let mut job = MigrationJob::pending_export(id, actor);
        job.metadata = self.inner.environment_metadata();
        self.inner.store.create(&job).await?;
        self.inner.emit(&job);
        info!("migration export {id} queued by {}", job.actor);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner.run_export(id).await;
            drop(guard);
        });
        self.track(id, task);
        Ok(id)
    }

    /// Start applying a foreign bundle over the whole data set.
    pub async fn import_bundle(&self, request: ImportRequest) -> Result<Uuid> {
        let bundle_path = request.bundle_path.clone();
        let manifest = blocking(move || archive::list_manifest(&bundle_path))
            .await
            .map_err(|err| EngineError::InvalidRequest(format!("unreadable bundle: {err}")))?;
        if !manifest.covers(BackupKind::Full) {
            return Err(EngineError::InvalidRequest(format!(
                "bundle {} is a {} capture; imports need every category",
                request.bundle_path.display(),
                manifest.kind
            )));
        }
        let warnings = self.inner.compatibility_warnings(&manifest);

        let id = Uuid::new_v4();
        let guard = self
            .inner
            .lock
            .try_acquire(Some(id), WriterOperation::MigrationImport)?;

        let mut job = MigrationJob::pending_import(id, request.actor, request.bundle_path);
        job.metadata = migration::import_metadata(&manifest, &warnings);
        self.inner.store.create(&job).await?;
        self.inner.emit(&job);
        for warning in &warnings {
            warn!("migration import {id}: {warning}");
        }
        info!("migration import {id} queued by {}", job.actor);

        let inner = Arc::clone(&self.inner);
        let take_safety_snapshot = request.take_safety_snapshot;
        let task = tokio::spawn(async move {
            inner.run_import(id, take_safety_snapshot).await;
            drop(guard);
        });
        self.track(id, task);
        Ok(id)
    }

    pub async fn list_backups(&self, filter: BackupFilter) -> Result<Vec<BackupJob>> {
        let jobs = self
            .inner
            .store
            .list(
                |job: &BackupJob| {
                    filter.status.is_none_or(|status| job.status == status)
                        && filter.kind.is_none_or(|kind| job.kind == kind)
                        && filter
                            .retention_class
                            .is_none_or(|class| job.retention_class == class)
                },
                filter.limit,
            )
            .await?;
        Ok(jobs)
    }

    pub async fn list_restores(&self, filter: RestoreFilter) -> Result<Vec<RestoreJob>> {
        let jobs = self
            .inner
            .store
            .list(
                |job: &RestoreJob| {
                    filter.status.is_none_or(|status| job.status == status)
                        && filter.backup_id.is_none_or(|id| job.backup_id == id)
                },
                filter.limit,
            )
            .await?;
        Ok(jobs)
    }

    pub async fn list_migrations(&self, filter: MigrationFilter) -> Result<Vec<MigrationJob>> {
        let jobs = self
            .inner
            .store
            .list(
                |job: &MigrationJob| {
                    filter.status.is_none_or(|status| job.status == status)
                        && filter.direction.is_none_or(|direction| job.direction == direction)
                },
                filter.limit,
            )
            .await?;
        Ok(jobs)
    }

    /// Look a job up by id in every table.
    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        let store = &self.inner.store;
        if let Some(job) = store.find::<BackupJob>(id).await? {
            return Ok(Job::Backup(job));
        }
        if let Some(job) = store.find::<RestoreJob>(id).await? {
            return Ok(Job::Restore(job));
        }
        if let Some(job) = store.find::<MigrationJob>(id).await? {
            return Ok(Job::Migration(job));
        }
        Err(EngineError::NotFound(format!("job {id}")))
    }

    pub async fn enforce_retention(&self, class: RetentionClass) -> Result<RetentionReport> {
        retention::enforce(&self.inner.store, &self.inner.config.retention, class, Utc::now()).await
    }

    pub async fn enforce_all_retention(&self) -> Result<Vec<RetentionReport>> {
        let mut reports = Vec::with_capacity(RetentionClass::ALL.len());
        for class in RetentionClass::ALL {
            reports.push(self.enforce_retention(class).await?);
        }
        Ok(reports)
    }

    /// Poll until the job reaches a terminal state. For jobs started by this
    /// engine it also waits for the job's task, so work that follows the
    /// terminal transition (retention after a backup) has finished too.
    pub async fn wait_for(&self, id: Uuid) -> Result<Job> {
        let job = loop {
            let job = self.get_job(id).await?;
            if job.status().is_terminal() {
                break job;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        };

        let task = self.tasks().remove(&id);
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("task for job {id} ended abnormally: {err}");
            }
        }
        Ok(job)
    }

    pub fn writer_status(&self) -> Option<LockHolder> {
        self.inner.lock.status()
    }

    /// Bring records and the filesystem back in line after an unclean stop.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.inner.lock.try_acquire(None, WriterOperation::Reconcile)?;
        self.inner.reconcile().await
    }

    fn track(&self, id: Uuid, task: JoinHandle<()>) {
        let mut tasks = self.tasks();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, task);
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A missing backup is a bad request here, not a failed lookup.
    async fn restorable_backup(&self, backup_id: Uuid, scope: BackupKind) -> Result<BackupJob> {
        let backup = self
            .inner
            .store
            .find::<BackupJob>(backup_id)
            .await?
            .ok_or_else(|| EngineError::InvalidRequest(format!("backup {backup_id} does not exist")))?;
        if backup.status != JobStatus::Success || backup.archive_path.is_none() {
            return Err(EngineError::InvalidRequest(format!(
                "backup {backup_id} is {}, only successful backups can be restored",
                backup.status
            )));
        }
        if !backup.kind.covers(scope) {
            return Err(EngineError::InvalidRequest(format!(
                "backup {backup_id} is a {} capture and does not contain scope {scope}",
                backup.kind
            )));
        }
        Ok(backup)
    }

    async fn successful_archive(&self, backup_id: Uuid) -> Result<PathBuf> {
        let backup = self
            .inner
            .store
            .find::<BackupJob>(backup_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("backup {backup_id}")))?;
        match (backup.status, backup.archive_path) {
            (JobStatus::Success, Some(path)) => Ok(path),
            (status, _) => Err(EngineError::InvalidRequest(format!(
                "backup {backup_id} is {status} and has no archive"
            ))),
        }
    }
}

impl EngineInner {
    /// Best-effort delivery to the event sink.
    fn emit<T: JobRecord>(&self, record: &T) {
        let event = JobEvent::for_record(record);
        if let Err(err) = self.events.notify(&event) {
            warn!("event sink rejected {} event for {}: {err}", event.status, event.job_id);
        }
    }

    /// Persist a transition; a store failure is logged and the last known
    /// record is returned to the caller.
    async fn transition<T, F>(&self, id: Uuid, change: F) -> Option<T>
    where
        T: JobRecord,
        F: FnOnce(&mut T),
    {
        match self.store.update::<T, F>(id, change).await {
            Ok(record) => {
                if record.status().is_terminal() {
                    self.emit(&record);
                }
                Some(record)
            }
            Err(err) => {
                tracing::error!("failed to persist {} {id}: {err}", T::JOB_TYPE);
                None
            }
        }
    }
}

/// Run blocking archive work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, crate::errors::ArchiveError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| EngineError::Capture(format!("archive task failed: {err}")))?
        .map_err(EngineError::from)
}
