use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::errors::EngineError;

/// Fresh, empty staging directory for one job.
pub(crate) async fn create_staging_dir(staging_root: &Path, job_id: Uuid) -> Result<PathBuf, EngineError> {
    ensure_dir(staging_root).await?;
    let dir = staging_root.join(job_id.to_string());
    if tokio::fs::try_exists(&dir)
        .await
        .map_err(|err| EngineError::io("inspecting staging directory", err))?
    {
        remove_path(&dir)
            .await
            .map_err(|err| EngineError::io("clearing stale staging directory", err))?;
    }
    ensure_dir(&dir).await?;
    Ok(dir)
}

pub(crate) async fn remove_staging_dir(dir: &Path) {
    if let Err(err) = remove_path(dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove staging directory {}: {err}", dir.display());
        }
    }
}

/// Remove a file or a whole directory tree.
pub(crate) async fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

async fn ensure_dir(path: &Path) -> Result<(), EngineError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|err| EngineError::io("creating staging directory", err))
}
