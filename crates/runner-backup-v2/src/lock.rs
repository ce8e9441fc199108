//! Single-writer lock.
//!
//! At most one job that writes to the live tree or the archive directory runs
//! at a time. The lock is held twice: an in-process slot for the fast path and
//! an exclusive `flock` on `writer.lock` so a second engine process pointed at
//! the same state dir is refused too.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::EngineError;

pub const LOCK_FILE: &str = "writer.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterOperation {
    Backup,
    Restore,
    MigrationExport,
    MigrationImport,
    Reconcile,
}

impl fmt::Display for WriterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WriterOperation::Backup => "backup",
            WriterOperation::Restore => "restore",
            WriterOperation::MigrationExport => "migration export",
            WriterOperation::MigrationImport => "migration import",
            WriterOperation::Reconcile => "reconcile",
        };
        f.write_str(label)
    }
}

/// Who currently holds the writer lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub job_id: Option<Uuid>,
    pub operation: WriterOperation,
    pub acquired_at: DateTime<Utc>,
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.job_id {
            Some(id) => write!(f, "{} job {id} (since {})", self.operation, self.acquired_at),
            None => write!(f, "{} (since {})", self.operation, self.acquired_at),
        }
    }
}

#[derive(Clone)]
pub(crate) struct WriterLock {
    path: PathBuf,
    holder: Arc<Mutex<Option<LockHolder>>>,
}

/// Releases the lock when dropped.
pub(crate) struct WriterGuard {
    file: File,
    holder: Arc<Mutex<Option<LockHolder>>>,
    info: LockHolder,
}

impl WriterLock {
    pub(crate) fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(LOCK_FILE),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Take the lock or fail immediately with `Busy`; never waits.
    pub(crate) fn try_acquire(
        &self,
        job_id: Option<Uuid>,
        operation: WriterOperation,
    ) -> Result<WriterGuard, EngineError> {
        let mut slot = lock_slot(&self.holder);
        if let Some(current) = slot.as_ref() {
            return Err(EngineError::Busy(format!("another job is running: {current}")));
        }

        let mut file = self.open()?;
        if let Err(err) = file.try_lock_exclusive() {
            if is_contended(&err) {
                let current = read_holder(&mut file)
                    .map(|holder| holder.to_string())
                    .unwrap_or_else(|| "another engine process".to_string());
                return Err(EngineError::Busy(format!("another job is running: {current}")));
            }
            return Err(EngineError::io("acquiring writer lock", err));
        }

        let info = LockHolder {
            job_id,
            operation,
            acquired_at: Utc::now(),
        };
        if let Err(err) = write_holder(&mut file, &info) {
            warn!("failed to record writer lock holder in {}: {err}", self.path.display());
        }
        debug!("writer lock acquired by {info}");
        *slot = Some(info.clone());

        Ok(WriterGuard {
            file,
            holder: Arc::clone(&self.holder),
            info,
        })
    }

    /// Current holder, if any, including holders in other processes.
    ///
    /// Reads the holder record without touching the file lock, so a status
    /// query never makes a concurrent `try_acquire` see contention. A holder
    /// killed before its guard dropped stays visible until the next acquire
    /// rewrites the record.
    pub(crate) fn status(&self) -> Option<LockHolder> {
        if let Some(current) = lock_slot(&self.holder).clone() {
            return Some(current);
        }
        let text = std::fs::read_to_string(&self.path).ok()?;
        parse_holder(&text)
    }

    fn open(&self) -> Result<File, EngineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| EngineError::io("creating state directory", err))?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| EngineError::io("opening writer lock", err))
    }
}

impl WriterGuard {
    pub(crate) fn holder(&self) -> &LockHolder {
        &self.info
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
        *lock_slot(&self.holder) = None;
        debug!("writer lock released by {}", self.info);
    }
}

fn lock_slot(holder: &Mutex<Option<LockHolder>>) -> MutexGuard<'_, Option<LockHolder>> {
    holder.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_holder(file: &mut File, info: &LockHolder) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(info)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.sync_data()
}

fn read_holder(file: &mut File) -> Option<LockHolder> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    parse_holder(&text)
}

fn parse_holder(text: &str) -> Option<LockHolder> {
    if text.trim().is_empty() {
        return None;
    }
    serde_json::from_str(text).ok()
}
