use std::path::Path;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{EngineInner, blocking};
use crate::apply::{self, SwapTarget};
use crate::archive::{self, Manifest, RootShape};
use crate::errors::EngineError;
use crate::model::{BackupJob, BackupKind, JobId, JobRecord, Metadata, MigrationJob, RestoreJob};

/// Which record an apply reports into.
#[derive(Debug, Clone, Copy)]
pub(super) enum ApplyJob {
    Restore(JobId),
    Import(JobId),
}

impl ApplyJob {
    fn id(self) -> JobId {
        match self {
            ApplyJob::Restore(id) | ApplyJob::Import(id) => id,
        }
    }
}

impl EngineInner {
    pub(super) async fn run_restore(&self, id: Uuid, backup: BackupJob, take_safety_snapshot: bool) {
        let Some(job) = self
            .transition(id, |job: &mut RestoreJob| job.mark_running(Utc::now()))
            .await
        else {
            return;
        };
        info!("restore {id} of backup {} running", backup.id);

        let mut details = Metadata::new();
        let result = match backup.archive_path.as_ref() {
            Some(archive) => {
                self.apply_archive(
                    ApplyJob::Restore(id),
                    archive,
                    job.restore_scope,
                    &job.actor,
                    take_safety_snapshot,
                    &mut details,
                )
                .await
            }
            None => Err(EngineError::InvalidRequest(format!(
                "backup {} has no archive",
                backup.id
            ))),
        };

        let finished = match result {
            Ok(()) => {
                self.transition(id, move |job: &mut RestoreJob| {
                    job.metadata.extend(details);
                    job.mark_success(Utc::now());
                })
                .await
            }
            Err(err) => {
                warn!("restore {id} failed: {err}");
                let message = err.to_string();
                self.transition(id, move |job: &mut RestoreJob| {
                    job.metadata.extend(details);
                    job.mark_failed(message, Utc::now());
                })
                .await
            }
        };
        if let Some(job) = finished {
            info!("restore {id} finished: {}", job.status);
        }
    }

    /// Shared restore algorithm: optional safety snapshot, stop, stage,
    /// swap, restart. `details` collects what the record should carry
    /// whatever the outcome.
    pub(super) async fn apply_archive(
        &self,
        job: ApplyJob,
        archive_path: &Path,
        scope: BackupKind,
        actor: &str,
        take_safety_snapshot: bool,
        details: &mut Metadata,
    ) -> Result<(), EngineError> {
        let id = job.id();

        // Refuse early, before the snapshot or the stop, if an earlier
        // restore left an `.old` sibling behind.
        let planned: Vec<SwapTarget> = self
            .config
            .roots_for(scope)
            .into_iter()
            .map(|root| SwapTarget {
                live: self.config.server_root.join(&root.rel_path),
                staged: None,
            })
            .collect();
        apply::preflight(&planned).await.map_err(|err| EngineError::InvalidRequest(err.to_string()))?;

        let safety_snapshot = if take_safety_snapshot {
            let snapshot_id = self.safety_snapshot(actor).await?;
            self.record_safety_snapshot(job, snapshot_id).await?;
            info!("{id}: safety snapshot {snapshot_id} taken");
            Some(snapshot_id)
        } else {
            None
        };

        let was_running = match self.controller.stop().await {
            Ok(was_running) => was_running,
            Err(err) => {
                // The stop may still land after the error; bring the service
                // back rather than leave it down with nothing applied.
                warn!("{id}: stopping the service failed: {err}");
                self.restart(id, details).await;
                return Err(EngineError::Controller(format!("stopping the service failed: {err}")));
            }
        };
        details.insert("service_was_running".into(), json!(was_running));

        let result = match apply::create_staging_dir(&self.config.staging_root(), id).await {
            Ok(staging) => {
                let result = self
                    .stage_and_swap(id, archive_path, &staging, scope, safety_snapshot, details)
                    .await;
                apply::remove_staging_dir(&staging).await;
                result
            }
            Err(err) => Err(err),
        };

        if was_running {
            self.restart(id, details).await;
        }
        result
    }

    async fn restart(&self, id: Uuid, details: &mut Metadata) {
        if let Err(err) = self.controller.start().await {
            warn!("{id}: restarting the service failed: {err}");
            details.insert("restart_error".into(), json!(err.to_string()));
        }
    }

    async fn stage_and_swap(
        &self,
        id: Uuid,
        archive_path: &Path,
        staging: &Path,
        scope: BackupKind,
        safety_snapshot: Option<Uuid>,
        details: &mut Metadata,
    ) -> Result<(), EngineError> {
        let archive = archive_path.to_path_buf();
        let target = staging.to_path_buf();
        let manifest = blocking(move || archive::unpack(&archive, &target)).await?;
        if !manifest.covers(scope) {
            return Err(EngineError::CorruptArchive(format!(
                "{} does not contain every category of scope {scope}",
                archive_path.display()
            )));
        }

        let targets = swap_targets(&manifest, scope, &self.config.server_root, staging);
        apply::preflight(&targets).await.map_err(|err| EngineError::InvalidRequest(err.to_string()))?;

        let swapped = apply::swap_all(&targets, id).await.map_err(|failure| EngineError::PartialApply {
            message: match safety_snapshot {
                Some(snapshot) => format!("{failure}; safety snapshot {snapshot} holds the pre-restore state"),
                None => failure.to_string(),
            },
            safety_snapshot,
        })?;

        let leftovers = apply::discard_old(&swapped).await;
        if !leftovers.is_empty() {
            details.insert("leftover_old".into(), json!(leftovers));
        }
        details.insert(
            "restored_roots".into(),
            json!(targets
                .iter()
                .map(|target| target.live.display().to_string())
                .collect::<Vec<_>>()),
        );
        details.insert(
            "restored_entries".into(),
            json!(manifest.entries.iter().filter(|e| scope.includes(e.category)).count()),
        );
        info!("{id}: applied {} root(s) from {}", targets.len(), archive_path.display());
        Ok(())
    }

    /// Persist the snapshot id before anything destructive happens.
    async fn record_safety_snapshot(&self, job: ApplyJob, snapshot_id: Uuid) -> Result<(), EngineError> {
        match job {
            ApplyJob::Restore(id) => {
                self.store
                    .update(id, |job: &mut RestoreJob| job.pre_restore_backup_id = Some(snapshot_id))
                    .await?;
            }
            ApplyJob::Import(id) => {
                self.store
                    .update(id, |job: &mut MigrationJob| job.pre_restore_backup_id = Some(snapshot_id))
                    .await?;
            }
        }
        Ok(())
    }
}

fn swap_targets(manifest: &Manifest, scope: BackupKind, server_root: &Path, staging: &Path) -> Vec<SwapTarget> {
    manifest
        .roots_in(scope)
        .map(|root| SwapTarget {
            live: server_root.join(&root.path),
            staged: match root.shape {
                RootShape::Absent => None,
                RootShape::Dir | RootShape::File => Some(staging.join(&root.path)),
            },
        })
        .collect()
}
