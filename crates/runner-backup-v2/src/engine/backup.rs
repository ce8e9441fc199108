use std::path::PathBuf;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{EngineInner, blocking};
use crate::archive::{self, PackRequest, PackedArchive};
use crate::errors::EngineError;
use crate::model::{BackupJob, BackupKind, Category, JobRecord, JobStatus, Metadata, RetentionClass};

/// Result of one capture, including how the controller behaved around it.
pub(super) struct Capture {
    pub packed: PackedArchive,
    pub quiesced: bool,
    pub resume_error: Option<String>,
}

impl EngineInner {
    /// Drive a `Pending` backup to a terminal state. Returns the final
    /// record, or `None` if the record could not be persisted.
    pub(super) async fn run_backup(&self, id: Uuid) -> Option<BackupJob> {
        let job: BackupJob = self.transition(id, |job: &mut BackupJob| job.mark_running(Utc::now())).await?;
        info!("backup {id} ({}) running", job.kind);

        let destination = self.config.archive_dir().join(format!("{id}.tar.gz"));
        let mut metadata = self.backup_metadata(job.name.as_deref());
        metadata.insert("backup_id".into(), json!(id));

        let outcome = self.capture(id, job.kind, destination, metadata).await;
        let finished = match outcome {
            Ok(capture) => {
                let size = capture.packed.size_bytes;
                let path = capture.packed.path.clone();
                let identity = self.backup_metadata(job.name.as_deref());
                self.transition(id, move |job: &mut BackupJob| {
                    job.metadata.extend(identity);
                    record_capture(&mut job.metadata, &capture);
                    job.mark_success(path, size, Utc::now());
                })
                .await
            }
            Err(err) => {
                warn!("backup {id} failed: {err}");
                let message = err.to_string();
                self.transition(id, move |job: &mut BackupJob| job.mark_failed(message, Utc::now()))
                    .await
            }
        };

        if let Some(job) = finished.as_ref() {
            info!("backup {id} ({}) finished: {}", job.kind, job.status);
        }
        finished
    }

    /// Quiesce if needed, pack, then resume whatever happened.
    pub(super) async fn capture(
        &self,
        id: Uuid,
        kind: BackupKind,
        destination: PathBuf,
        metadata: Metadata,
    ) -> Result<Capture, EngineError> {
        let quiesce = kind
            .categories()
            .iter()
            .any(|category| *category == Category::PrimaryData || self.controller.writes_to(*category));

        if quiesce {
            if let Err(err) = self.controller.quiesce().await {
                warn!("quiesce before capture {id} failed: {err}");
                if let Err(resume_err) = self.controller.resume().await {
                    warn!("resume after failed quiesce for {id} failed: {resume_err}");
                }
                return Err(EngineError::Controller(format!("quiesce failed: {err}")));
            }
        }

        let roots = self.config.roots_for(kind);
        let source_root = self.config.server_root.clone();
        let partial_dir = self.config.partial_dir();
        let packed = blocking(move || {
            archive::pack(PackRequest {
                archive_id: id,
                kind,
                source_root: &source_root,
                roots: &roots,
                destination: &destination,
                partial_dir: &partial_dir,
                metadata,
            })
        })
        .await;

        let mut resume_error = None;
        if quiesce {
            if let Err(err) = self.controller.resume().await {
                warn!("resume after capture {id} failed: {err}");
                resume_error = Some(err.to_string());
            }
        }

        Ok(Capture {
            packed: packed?,
            quiesced: quiesce,
            resume_error,
        })
    }

    /// Full capture taken under the lock already held by a restore or import.
    pub(super) async fn safety_snapshot(&self, actor: &str) -> Result<Uuid, EngineError> {
        let id = Uuid::new_v4();
        let mut job = BackupJob::pending(
            id,
            BackupKind::Full,
            RetentionClass::Daily,
            Some("pre-restore".to_string()),
            actor.to_string(),
        );
        job.metadata = self.backup_metadata(job.name.as_deref());
        self.store.create(&job).await?;
        self.emit(&job);

        match self.run_backup(id).await {
            Some(job) if job.status == JobStatus::Success => Ok(id),
            Some(job) => Err(EngineError::Capture(format!(
                "safety snapshot {id} failed: {}",
                job.error_message.unwrap_or_else(|| "unknown error".to_string())
            ))),
            None => Err(EngineError::Capture(format!(
                "safety snapshot {id} could not be recorded"
            ))),
        }
    }

    pub(super) async fn retention_after_backup(&self, job: &BackupJob) {
        if job.is_retention_exempt() {
            return;
        }
        match crate::retention::enforce(&self.store, &self.config.retention, job.retention_class, Utc::now()).await {
            Ok(report) if !report.deleted.is_empty() => info!(
                "retention after backup {}: pruned {} {} backup(s)",
                job.id(),
                report.deleted.len(),
                job.retention_class
            ),
            Ok(_) => {}
            Err(err) => warn!("retention after backup {} failed: {err}", job.id()),
        }
    }

    /// Service identity plus the optional backup name, stamped into the
    /// record and the manifest alike.
    pub(super) fn backup_metadata(&self, name: Option<&str>) -> Metadata {
        let mut metadata = self.environment_metadata();
        if let Some(name) = name {
            metadata.insert("name".into(), json!(name));
        }
        metadata
    }

    /// Service identity stamped into manifests and migration records.
    pub(super) fn environment_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("service_name".into(), json!(self.config.service_name));
        if let Some(version) = self.config.service_version.as_ref() {
            metadata.insert("service_version".into(), json!(version));
        }
        metadata.insert("engine_version".into(), json!(crate::engine_version()));
        metadata
    }
}

pub(super) fn record_capture(metadata: &mut Metadata, capture: &Capture) {
    let manifest = &capture.packed.manifest;
    metadata.insert("entry_count".into(), json!(manifest.entries.len()));
    metadata.insert("total_bytes".into(), json!(manifest.total_bytes));
    metadata.insert(
        "roots".into(),
        json!(manifest.roots.iter().map(|root| root.path.as_str()).collect::<Vec<_>>()),
    );
    metadata.insert("quiesced".into(), json!(capture.quiesced));
    if let Some(err) = capture.resume_error.as_ref() {
        metadata.insert("resume_error".into(), json!(err));
    }
}
