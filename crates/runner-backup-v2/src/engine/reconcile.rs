use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::EngineInner;
use crate::apply::{old_sibling, remove_path};
use crate::errors::EngineError;
use crate::model::{BackupJob, JobRecord, JobStatus, MigrationJob, RestoreJob};

pub(crate) const INTERRUPTED_MESSAGE: &str = "interrupted: engine restarted before the job finished";

/// What reconciliation found and changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Jobs left `Pending`/`Running` by an earlier process, now `Failed`.
    pub interrupted_jobs: Vec<Uuid>,
    pub removed_partials: Vec<PathBuf>,
    pub removed_staging: Vec<PathBuf>,
    /// `.old` siblings renamed back over a missing live path.
    pub restored_old: Vec<PathBuf>,
    /// `.old` siblings left alone because the live path also exists.
    pub conflicting_old: Vec<PathBuf>,
    /// Successful backups whose archive file is gone.
    pub missing_archives: Vec<Uuid>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self == &Self::default()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} interrupted job(s), {} partial archive(s) and {} staging dir(s) removed, \
             {} .old restored, {} .old conflicting, {} missing archive(s)",
            self.interrupted_jobs.len(),
            self.removed_partials.len(),
            self.removed_staging.len(),
            self.restored_old.len(),
            self.conflicting_old.len(),
            self.missing_archives.len()
        )
    }
}

impl EngineInner {
    /// Caller holds the writer lock.
    pub(super) async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::default();

        self.fail_interrupted::<BackupJob>(&mut report).await?;
        self.fail_interrupted::<RestoreJob>(&mut report).await?;
        self.fail_interrupted::<MigrationJob>(&mut report).await?;

        report.removed_partials = clear_dir(&self.config.partial_dir()).await?;
        report.removed_staging = clear_dir(&self.config.staging_root()).await?;

        for root in self.config.all_roots() {
            let live = self.config.server_root.join(&root.rel_path);
            let old = old_sibling(&live);
            if !exists(&old).await? {
                continue;
            }
            if exists(&live).await? {
                warn!(
                    "both {} and {} exist; leaving them for the operator",
                    live.display(),
                    old.display()
                );
                report.conflicting_old.push(old);
            } else {
                tokio::fs::rename(&old, &live)
                    .await
                    .map_err(|err| EngineError::io("restoring .old sibling", err))?;
                info!("restored {} from an interrupted swap", live.display());
                report.restored_old.push(live);
            }
        }

        let successful: Vec<BackupJob> = self
            .store
            .list(|job: &BackupJob| job.status == JobStatus::Success, None)
            .await?;
        for job in successful {
            let present = match job.archive_path.as_ref() {
                Some(path) => exists(path).await?,
                None => false,
            };
            if !present {
                warn!("backup {} is recorded as successful but its archive is missing", job.id);
                report.missing_archives.push(job.id);
            }
        }

        Ok(report)
    }

    async fn fail_interrupted<T: JobRecord>(&self, report: &mut ReconcileReport) -> Result<(), EngineError> {
        let stale: Vec<T> = self.store.list(|job: &T| !job.status().is_terminal(), None).await?;
        for job in stale {
            let id = job.id();
            warn!("{} {id} was {} when the engine stopped; marking failed", T::JOB_TYPE, job.status());
            let failed: T = self
                .store
                .update(id, |job: &mut T| job.mark_failed(INTERRUPTED_MESSAGE.to_string(), Utc::now()))
                .await?;
            self.emit(&failed);
            report.interrupted_jobs.push(id);
        }
        Ok(())
    }
}

/// Remove every entry of `dir`, keeping the directory itself.
async fn clear_dir(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut removed = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(err) => return Err(EngineError::io("listing leftover work files", err)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| EngineError::io("listing leftover work files", err))?
    {
        let path = entry.path();
        match remove_path(&path).await {
            Ok(()) => removed.push(path),
            Err(err) => warn!("failed to remove {}: {err}", path.display()),
        }
    }
    Ok(removed)
}

async fn exists(path: &Path) -> Result<bool, EngineError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(EngineError::io("inspecting path during reconciliation", err)),
    }
}
