use std::path::Path;

use tokio::io::AsyncWriteExt;

/// Write `bytes` to `path` so that a crash leaves either the old content or
/// the new content, never a torn file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    if let Err(err) = write_and_sync(&mut file, bytes).await {
        drop(file);
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }
    drop(file);

    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    if let Some(parent) = path.parent() {
        sync_dir(parent).await?;
    }
    Ok(())
}

async fn write_and_sync(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Persist a directory entry change (create, rename, unlink).
#[cfg(unix)]
pub(crate) async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    let handle = tokio::fs::File::open(dir).await?;
    handle.sync_all().await
}

#[cfg(not(unix))]
pub(crate) async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Blocking variant used from `spawn_blocking` code paths.
#[cfg(unix)]
pub(crate) fn sync_dir_blocking(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir_blocking(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
