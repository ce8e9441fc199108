//! Durable job records.
//!
//! Each job type gets its own directory ("table") under the state dir and
//! every record is one JSON file named by the job id. Writes go through a
//! temp file, `fsync` and rename, so a record on disk is always complete and
//! a status transition is durable before the caller moves on.

mod durable;

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::model::{BackupJob, JobRecord, MigrationJob, RestoreJob};

pub(crate) use durable::{sync_dir, sync_dir_blocking};

pub struct JobStore {
    root: PathBuf,
    // Serializes read-modify-write cycles so concurrent updates never interleave.
    write_lock: Mutex<()>,
}

impl JobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for table in [BackupJob::TABLE, RestoreJob::TABLE, MigrationJob::TABLE] {
            tokio::fs::create_dir_all(root.join(table)).await?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a new record. Fails if a record with the same id exists.
    pub async fn create<T: JobRecord>(&self, record: &T) -> Result<Uuid, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path::<T>(record.id());
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::Duplicate(record.id()));
        }
        self.write(&path, record).await?;
        Ok(record.id())
    }

    pub async fn get<T: JobRecord>(&self, id: Uuid) -> Result<T, StoreError> {
        self.find(id).await?.ok_or(StoreError::NotFound(id))
    }

    pub async fn find<T: JobRecord>(&self, id: Uuid) -> Result<Option<T>, StoreError> {
        let path = self.record_path::<T>(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { path, source }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Apply `change` to the stored record and persist it before returning.
    pub async fn update<T, F>(&self, id: Uuid, change: F) -> Result<T, StoreError>
    where
        T: JobRecord,
        F: FnOnce(&mut T),
    {
        let _guard = self.write_lock.lock().await;
        let mut record: T = self.get(id).await?;
        change(&mut record);
        let path = self.record_path::<T>(id);
        self.write(&path, &record).await?;
        Ok(record)
    }

    /// All records of one table matching `filter`, newest first.
    pub async fn list<T, F>(&self, filter: F, limit: Option<usize>) -> Result<Vec<T>, StoreError>
    where
        T: JobRecord,
        F: Fn(&T) -> bool,
    {
        let dir = self.root.join(T::TABLE);
        let mut records = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Deleted between read_dir and read.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            match serde_json::from_slice::<T>(&bytes) {
                Ok(record) if filter(&record) => records.push(record),
                Ok(_) => {}
                Err(err) => warn!("skipping unreadable job record {}: {err}", path.display()),
            }
        }

        records.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Remove a record. Only retention deletes records.
    pub(crate) async fn delete<T: JobRecord>(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path::<T>(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id));
            }
            Err(err) => return Err(err.into()),
        }
        sync_dir(&self.root.join(T::TABLE)).await?;
        Ok(())
    }

    fn record_path<T: JobRecord>(&self, id: Uuid) -> PathBuf {
        self.root.join(T::TABLE).join(format!("{id}.json"))
    }

    async fn write<T: JobRecord>(&self, path: &Path, record: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        durable::write_atomic(path, &bytes).await?;
        Ok(())
    }
}
