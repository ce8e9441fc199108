use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use runner_backup_v2::{
    BackupFilter, BackupKind, BackupRequest, Engine, ImportRequest, Job, JobStatus, JobType,
    MigrationDirection, MigrationFilter, RestoreFilter, RestoreRequest, RetentionClass,
    TracingEventSink,
};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::settings::CliSettings;

pub struct ListFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<BackupKind>,
    pub retention: Option<RetentionClass>,
    pub backup_id: Option<Uuid>,
    pub direction: Option<MigrationDirection>,
    pub limit: Option<usize>,
}

pub async fn open_engine(settings: &CliSettings) -> Result<Engine> {
    if let Some(path) = settings.config_path.as_ref() {
        info!("using backup config {}", path.display());
    }
    Engine::open(
        settings.engine.clone(),
        settings.controller(),
        Arc::new(TracingEventSink),
    )
    .await
    .with_context(|| {
        format!(
            "failed to open backup engine for {}",
            settings.engine.server_root.display()
        )
    })
}

pub async fn create(
    engine: &Engine,
    kind: BackupKind,
    retention_class: RetentionClass,
    name: Option<String>,
    actor: String,
    detach: bool,
) -> Result<()> {
    let id = engine
        .create_backup(BackupRequest {
            kind,
            retention_class,
            name,
            actor,
        })
        .await
        .context("backup rejected")?;
    finish(engine, id, detach).await
}

pub async fn restore(
    engine: &Engine,
    backup_id: Uuid,
    scope: Option<BackupKind>,
    actor: String,
    take_safety_snapshot: bool,
    detach: bool,
) -> Result<()> {
    let scope = match scope {
        Some(scope) => scope,
        None => match engine.get_job(backup_id).await? {
            Job::Backup(backup) => backup.kind,
            other => bail!("{backup_id} is a {} job, not a backup", other.job_type()),
        },
    };
    let id = engine
        .restore(RestoreRequest {
            backup_id,
            scope,
            actor,
            take_safety_snapshot,
        })
        .await
        .context("restore rejected")?;
    finish(engine, id, detach).await
}

pub async fn preview(engine: &Engine, backup_id: Uuid, scope: Option<BackupKind>) -> Result<()> {
    let mut manifest = engine.preview_backup(backup_id).await?;
    if let Some(scope) = scope {
        manifest.roots.retain(|root| scope.includes(root.category));
        manifest.entries.retain(|entry| scope.includes(entry.category));
    }
    print_json(&manifest)
}

pub async fn verify(engine: &Engine, backup_id: Uuid) -> Result<()> {
    let manifest = engine
        .verify_backup(backup_id)
        .await
        .with_context(|| format!("backup {backup_id} failed verification"))?;
    info!(
        "backup {backup_id} verified: {} entries, {} bytes",
        manifest.entries.len(),
        manifest.total_bytes
    );
    print_json(&manifest)
}

pub async fn export(engine: &Engine, actor: String, detach: bool) -> Result<()> {
    let id = engine.export_bundle(actor).await.context("export rejected")?;
    finish(engine, id, detach).await
}

pub async fn import(
    engine: &Engine,
    bundle: PathBuf,
    actor: String,
    take_safety_snapshot: bool,
    detach: bool,
) -> Result<()> {
    let bundle_path = std::path::absolute(&bundle)
        .with_context(|| format!("failed to resolve {}", bundle.display()))?;
    let id = engine
        .import_bundle(ImportRequest {
            bundle_path,
            actor,
            take_safety_snapshot,
        })
        .await
        .context("import rejected")?;
    finish(engine, id, detach).await
}

pub async fn list(engine: &Engine, job_type: JobType, filter: ListFilter) -> Result<()> {
    match job_type {
        JobType::Backup => print_json(
            &engine
                .list_backups(BackupFilter {
                    status: filter.status,
                    kind: filter.kind,
                    retention_class: filter.retention,
                    limit: filter.limit,
                })
                .await?,
        ),
        JobType::Restore => print_json(
            &engine
                .list_restores(RestoreFilter {
                    status: filter.status,
                    backup_id: filter.backup_id,
                    limit: filter.limit,
                })
                .await?,
        ),
        JobType::Migration => print_json(
            &engine
                .list_migrations(MigrationFilter {
                    status: filter.status,
                    direction: filter.direction,
                    limit: filter.limit,
                })
                .await?,
        ),
    }
}

pub async fn get(engine: &Engine, id: Uuid) -> Result<()> {
    print_json(&engine.get_job(id).await?)
}

pub async fn retention(engine: &Engine, class: Option<RetentionClass>) -> Result<()> {
    match class {
        Some(class) => print_json(&engine.enforce_retention(class).await?),
        None => print_json(&engine.enforce_all_retention().await?),
    }
}

pub async fn reconcile(engine: &Engine) -> Result<()> {
    print_json(&engine.reconcile().await?)
}

pub fn status(engine: &Engine) -> Result<()> {
    print_json(&engine.writer_status())
}

/// Wait for the job and print its final record. With `detach` only the id
/// is printed, up front; the job still runs to completion in this process.
async fn finish(engine: &Engine, id: Uuid, detach: bool) -> Result<()> {
    if detach {
        println!("{id}");
    }
    let job = engine.wait_for(id).await?;
    if !detach {
        print_json(&job)?;
    }
    if job.status() == JobStatus::Failed {
        bail!(
            "{} {id} failed: {}",
            job.job_type(),
            job.error_message().unwrap_or("no error recorded")
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
