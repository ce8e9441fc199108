#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use runner_backup_v2::{
    Category, ControllerError, Engine, EngineConfig, EventSink, Job, JobEvent, ProcessController,
};
use tokio::sync::Semaphore;
use uuid::Uuid;
use walkdir::WalkDir;

pub fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("atlas-backup-it-{prefix}-{nanos}"))
}

/// Controller double that records every call and can be told to fail.
pub struct FakeController {
    calls: Mutex<Vec<&'static str>>,
    gate: Option<Arc<Semaphore>>,
    running: AtomicBool,
    pub fail_quiesce: AtomicBool,
    pub fail_resume: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_start: AtomicBool,
}

impl FakeController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Every quiesce waits for a permit from `gate`, which holds a capture
    /// in `Running` until the test releases it.
    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self::build(Some(gate)))
    }

    fn build(gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            gate,
            running: AtomicBool::new(true),
            fail_quiesce: AtomicBool::new(false),
            fail_resume: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn failure(flag: &AtomicBool, command: &str) -> Result<(), ControllerError> {
        if flag.load(Ordering::SeqCst) {
            return Err(ControllerError::Command {
                command: command.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessController for FakeController {
    async fn quiesce(&self) -> Result<(), ControllerError> {
        self.record("quiesce");
        if let Some(gate) = self.gate.as_ref() {
            gate.acquire().await.expect("gate closed").forget();
        }
        Self::failure(&self.fail_quiesce, "quiesce")
    }

    async fn resume(&self) -> Result<(), ControllerError> {
        self.record("resume");
        Self::failure(&self.fail_resume, "resume")
    }

    async fn stop(&self) -> Result<bool, ControllerError> {
        self.record("stop");
        Self::failure(&self.fail_stop, "stop")?;
        Ok(self.running.swap(false, Ordering::SeqCst))
    }

    async fn start(&self) -> Result<(), ControllerError> {
        self.record("start");
        Self::failure(&self.fail_start, "start")?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn writes_to(&self, category: Category) -> bool {
        category == Category::PrimaryData
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn for_job(&self, id: Uuid) -> Vec<JobEvent> {
        self.events().into_iter().filter(|event| event.job_id == id).collect()
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, event: &JobEvent) -> Result<(), runner_backup_v2::events::SinkError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Lay out a small server: a world, a plugin, and a few config files.
pub fn seed_server(root: &Path) {
    write(root, "world/level.dat", b"level-v1");
    write(root, "world/region/r.0.0.mca", &vec![7u8; 64 * 1024]);
    std::fs::create_dir_all(root.join("world/playerdata")).unwrap();
    write(root, "plugins/Essentials/config.yml", b"motd: hello\n");
    write(root, "plugins/Essentials.jar", b"jar-bytes");
    write(root, "config/paper-global.yml", b"chunk-loading: {}\n");
    write(root, "server.properties", b"enable-rcon=false\nmotd=Atlas\n");
    write(root, "ops.json", b"[]");
}

pub fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// Every regular file under `rel`, keyed by its path relative to `root`.
pub fn snapshot_files(root: &Path, rel: &str) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    let base = root.join(rel);
    if !base.exists() {
        return files;
    }
    for entry in WalkDir::new(&base).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let key = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            files.insert(key, std::fs::read(entry.path()).unwrap());
        }
    }
    files
}

pub fn live_files(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    for rel in ["world", "plugins", "config", "server.properties", "ops.json"] {
        files.extend(snapshot_files(root, rel));
    }
    files
}

pub struct Harness {
    pub root: PathBuf,
    pub engine: Engine,
    pub controller: Arc<FakeController>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub async fn seeded(prefix: &str) -> Self {
        let root = unique_temp_dir(prefix);
        std::fs::create_dir_all(&root).unwrap();
        seed_server(&root);
        Self::open(root, FakeController::new(), |root| EngineConfig::new(root)).await
    }

    pub async fn open(
        root: PathBuf,
        controller: Arc<FakeController>,
        configure: impl FnOnce(PathBuf) -> EngineConfig,
    ) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let engine = Engine::open(configure(root.clone()), controller.clone(), sink.clone())
            .await
            .expect("open engine");
        Self {
            root,
            engine,
            controller,
            sink,
        }
    }

    pub async fn wait(&self, id: Uuid) -> Job {
        tokio::time::timeout(Duration::from_secs(60), self.engine.wait_for(id))
            .await
            .expect("job did not finish in time")
            .expect("job lookup")
    }

    pub fn cleanup(self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub fn backup(job: Job) -> runner_backup_v2::BackupJob {
    match job {
        Job::Backup(job) => job,
        other => panic!("expected a backup, got {other:?}"),
    }
}

pub fn restore(job: Job) -> runner_backup_v2::RestoreJob {
    match job {
        Job::Restore(job) => job,
        other => panic!("expected a restore, got {other:?}"),
    }
}

pub fn migration(job: Job) -> runner_backup_v2::MigrationJob {
    match job {
        Job::Migration(job) => job,
        other => panic!("expected a migration, got {other:?}"),
    }
}
