use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::EngineInner;
use super::backup::record_capture;
use super::restore::ApplyJob;
use crate::archive::{FORMAT_VERSION, Manifest};
use crate::model::{BackupKind, JobRecord, Metadata, MigrationJob};

impl EngineInner {
    pub(super) async fn run_export(&self, id: Uuid) {
        if self
            .transition(id, |job: &mut MigrationJob| job.mark_running(Utc::now()))
            .await
            .is_none()
        {
            return;
        }
        info!("migration export {id} running");

        let destination = self.config.bundle_dir().join(format!("{id}.tar.gz"));
        let mut metadata = self.environment_metadata();
        metadata.insert("migration_id".into(), json!(id));

        let finished = match self.capture(id, BackupKind::Migration, destination, metadata).await {
            Ok(capture) => {
                let path = capture.packed.path.clone();
                let size = capture.packed.size_bytes;
                self.transition(id, move |job: &mut MigrationJob| {
                    record_capture(&mut job.metadata, &capture);
                    job.mark_exported(path, size, Utc::now());
                })
                .await
            }
            Err(err) => {
                warn!("migration export {id} failed: {err}");
                let message = err.to_string();
                self.transition(id, move |job: &mut MigrationJob| job.mark_failed(message, Utc::now()))
                    .await
            }
        };
        if let Some(job) = finished {
            info!("migration export {id} finished: {}", job.status);
        }
    }

    pub(super) async fn run_import(&self, id: Uuid, take_safety_snapshot: bool) {
        let Some(job) = self
            .transition(id, |job: &mut MigrationJob| job.mark_running(Utc::now()))
            .await
        else {
            return;
        };
        info!("migration import {id} running");

        let mut details = Metadata::new();
        let result = match job.source_bundle_path.as_ref() {
            Some(bundle) => {
                self.apply_archive(
                    ApplyJob::Import(id),
                    bundle,
                    BackupKind::Full,
                    &job.actor,
                    take_safety_snapshot,
                    &mut details,
                )
                .await
            }
            None => Err(crate::errors::EngineError::InvalidRequest(
                "import job has no source bundle".into(),
            )),
        };

        let finished = match result {
            Ok(()) => {
                self.transition(id, move |job: &mut MigrationJob| {
                    job.metadata.extend(details);
                    job.mark_success(Utc::now());
                })
                .await
            }
            Err(err) => {
                warn!("migration import {id} failed: {err}");
                let message = err.to_string();
                self.transition(id, move |job: &mut MigrationJob| {
                    job.metadata.extend(details);
                    job.mark_failed(message, Utc::now());
                })
                .await
            }
        };
        if let Some(job) = finished {
            info!("migration import {id} finished: {}", job.status);
        }
    }

    /// Differences between the bundle's origin and this environment. They are
    /// recorded on the job and never block the import.
    pub(super) fn compatibility_warnings(&self, manifest: &Manifest) -> Vec<String> {
        let mut warnings = Vec::new();

        match manifest.service_name() {
            Some(name) if name != self.config.service_name => warnings.push(format!(
                "bundle was exported from service {name:?}, this server runs {:?}",
                self.config.service_name
            )),
            Some(_) => {}
            None => warnings.push("bundle does not record a service name".to_string()),
        }

        match (manifest.service_version(), self.config.service_version.as_deref()) {
            (Some(theirs), Some(ours)) if theirs != ours => warnings.push(format!(
                "bundle was exported from version {theirs}, this server runs {ours}"
            )),
            (None, Some(ours)) => warnings.push(format!(
                "bundle does not record a service version, this server runs {ours}"
            )),
            _ => {}
        }

        if manifest.kind != BackupKind::Migration {
            warnings.push(format!(
                "bundle is a {} backup rather than a migration export",
                manifest.kind
            ));
        }
        if manifest.format_version != FORMAT_VERSION {
            warnings.push(format!(
                "bundle uses archive format {}, current format is {FORMAT_VERSION}",
                manifest.format_version
            ));
        }
        warnings
    }
}

pub(super) fn import_metadata(manifest: &Manifest, warnings: &[String]) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("bundle_id".into(), json!(manifest.archive_id));
    metadata.insert("bundle_created_at".into(), json!(manifest.created_at));
    if let Some(name) = manifest.service_name() {
        metadata.insert("service_name".into(), json!(name));
    }
    if let Some(version) = manifest.service_version() {
        metadata.insert("service_version".into(), json!(version));
    }
    if let Some(version) = manifest.metadata.get("engine_version") {
        metadata.insert("source_engine_version".into(), version.clone());
    }
    metadata.insert("engine_version".into(), json!(crate::engine_version()));
    metadata.insert("compatibility_warnings".into(), json!(warnings));
    metadata
}
