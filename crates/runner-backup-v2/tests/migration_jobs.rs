mod common;

use std::path::PathBuf;

use common::{FakeController, Harness, backup, live_files, migration, unique_temp_dir, write};
use runner_backup_v2::{
    BackupKind, BackupRequest, EngineConfig, EngineError, ImportRequest, JobStatus, MigrationDirection,
    MigrationFilter, RetentionClass,
};
use serde_json::Value;

fn versioned(version: &'static str) -> impl FnOnce(PathBuf) -> EngineConfig {
    move |root| {
        let mut config = EngineConfig::new(root);
        config.service_version = Some(version.to_string());
        config
    }
}

async fn server(prefix: &str, version: &'static str) -> Harness {
    let root = unique_temp_dir(prefix);
    std::fs::create_dir_all(&root).unwrap();
    common::seed_server(&root);
    Harness::open(root, FakeController::new(), versioned(version)).await
}

async fn export(harness: &Harness) -> PathBuf {
    let id = harness.engine.export_bundle("ops".to_string()).await.expect("export");
    let job = migration(harness.wait(id).await);
    assert_eq!(job.status, JobStatus::Success, "{:?}", job.error_message);
    assert_eq!(job.direction, MigrationDirection::Export);
    let bundle = job.bundle_path.clone().expect("bundle path");
    assert!(bundle.starts_with(harness.engine.config().bundle_dir()));
    assert_eq!(job.bundle_size_bytes, Some(std::fs::metadata(&bundle).unwrap().len()));
    bundle
}

fn warnings(metadata: &runner_backup_v2::Metadata) -> Vec<String> {
    match metadata.get("compatibility_warnings") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        other => panic!("unexpected warnings value {other:?}"),
    }
}

#[tokio::test]
async fn bundle_moves_the_data_set_to_another_server() {
    let source = server("export", "1.20.4").await;
    write(&source.root, "world/level.dat", b"source world");
    let expected = live_files(&source.root);
    let bundle = export(&source).await;

    let target = server("import", "1.21").await;
    write(&target.root, "world/level.dat", b"target world");
    write(&target.root, "plugins/Other.jar", b"other");

    let id = target
        .engine
        .import_bundle(ImportRequest {
            bundle_path: bundle.clone(),
            actor: "ops".to_string(),
            take_safety_snapshot: true,
        })
        .await
        .expect("import");
    let job = migration(target.wait(id).await);

    assert_eq!(job.status, JobStatus::Success, "{:?}", job.error_message);
    assert_eq!(job.direction, MigrationDirection::Import);
    assert_eq!(job.source_bundle_path.as_ref(), Some(&bundle));
    assert_eq!(live_files(&target.root), expected);

    let snapshot = job.pre_restore_backup_id.expect("safety snapshot");
    let snapshot_job = backup(target.engine.get_job(snapshot).await.unwrap());
    assert_eq!(snapshot_job.status, JobStatus::Success);

    let warnings = warnings(&job.metadata);
    assert_eq!(warnings.len(), 1, "{warnings:?}");
    assert!(warnings[0].contains("1.20.4"));
    assert_eq!(job.metadata.get("service_version"), Some(&Value::from("1.20.4")));
    assert!(job.metadata.contains_key("bundle_id"));
    assert!(job.metadata.contains_key("source_engine_version"));

    let imports = target
        .engine
        .list_migrations(MigrationFilter {
            direction: Some(MigrationDirection::Import),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(imports.len(), 1);

    source.cleanup();
    target.cleanup();
}

#[tokio::test]
async fn matching_environment_imports_without_warnings() {
    let source = server("same-src", "1.21").await;
    let bundle = export(&source).await;
    let target = server("same-dst", "1.21").await;

    let id = target
        .engine
        .import_bundle(ImportRequest {
            bundle_path: bundle,
            actor: "ops".to_string(),
            take_safety_snapshot: false,
        })
        .await
        .unwrap();
    let job = migration(target.wait(id).await);
    assert_eq!(job.status, JobStatus::Success, "{:?}", job.error_message);
    assert!(warnings(&job.metadata).is_empty());
    assert!(job.pre_restore_backup_id.is_none());

    source.cleanup();
    target.cleanup();
}

#[tokio::test]
async fn full_backup_archive_imports_with_a_kind_warning() {
    let source = server("full-src", "1.21").await;
    let id = source
        .engine
        .create_backup(BackupRequest {
            kind: BackupKind::Full,
            retention_class: RetentionClass::Daily,
            name: None,
            actor: "ops".to_string(),
        })
        .await
        .unwrap();
    let archive = backup(source.wait(id).await).archive_path.unwrap();

    let target = server("full-dst", "1.21").await;
    let id = target
        .engine
        .import_bundle(ImportRequest {
            bundle_path: archive,
            actor: "ops".to_string(),
            take_safety_snapshot: false,
        })
        .await
        .unwrap();
    let job = migration(target.wait(id).await);
    assert_eq!(job.status, JobStatus::Success, "{:?}", job.error_message);
    let warnings = warnings(&job.metadata);
    assert!(warnings.iter().any(|warning| warning.contains("rather than a migration export")));

    source.cleanup();
    target.cleanup();
}

#[tokio::test]
async fn partial_or_unreadable_bundles_are_rejected_up_front() {
    let harness = server("reject", "1.21").await;
    let id = harness
        .engine
        .create_backup(BackupRequest {
            kind: BackupKind::Config,
            retention_class: RetentionClass::Daily,
            name: None,
            actor: "ops".to_string(),
        })
        .await
        .unwrap();
    let config_archive = backup(harness.wait(id).await).archive_path.unwrap();

    let err = harness
        .engine
        .import_bundle(ImportRequest {
            bundle_path: config_archive,
            actor: "ops".to_string(),
            take_safety_snapshot: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)), "{err}");

    let err = harness
        .engine
        .import_bundle(ImportRequest {
            bundle_path: harness.root.join("missing.tar.gz"),
            actor: "ops".to_string(),
            take_safety_snapshot: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)), "{err}");

    let garbage = harness.root.join("garbage.tar.gz");
    std::fs::write(&garbage, b"not an archive").unwrap();
    let err = harness
        .engine
        .import_bundle(ImportRequest {
            bundle_path: garbage,
            actor: "ops".to_string(),
            take_safety_snapshot: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)), "{err}");

    assert!(harness
        .engine
        .list_migrations(MigrationFilter::default())
        .await
        .unwrap()
        .is_empty());
    harness.cleanup();
}
