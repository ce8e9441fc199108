use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::staging::remove_path;
use crate::store::sync_dir;

#[derive(Debug, Clone)]
pub(crate) struct SwapTarget {
    pub live: PathBuf,
    /// `None` when the root was absent at capture time; the live path is vacated.
    pub staged: Option<PathBuf>,
}

/// One completed swap, kept so it can be finalized or undone.
#[derive(Debug)]
pub(crate) struct Swapped {
    pub live: PathBuf,
    pub old: Option<PathBuf>,
    installed: bool,
}

#[derive(Debug, Error)]
pub(crate) enum SwapError {
    #[error("{} is left over from an interrupted restore; move it away before restoring", .0.display())]
    LeftoverOld(PathBuf),

    #[error("staged content {} is missing", .0.display())]
    MissingStaged(PathBuf),

    #[error("failed to move {} to {}: {source}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A swap that failed part way, after rollback was attempted.
#[derive(Debug)]
pub(crate) struct SwapFailure {
    pub cause: SwapError,
    pub rollback_errors: Vec<String>,
}

impl SwapFailure {
    pub(crate) fn rolled_back(&self) -> bool {
        self.rollback_errors.is_empty()
    }
}

impl fmt::Display for SwapFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        if self.rolled_back() {
            write!(f, "; previous content restored")
        } else {
            write!(f, "; rollback incomplete: {}", self.rollback_errors.join("; "))
        }
    }
}

pub(crate) fn old_sibling(live: &Path) -> PathBuf {
    sibling(live, ".old")
}

pub(crate) fn failed_sibling(live: &Path, job_id: Uuid) -> PathBuf {
    sibling(live, &format!(".failed-{job_id}"))
}

fn sibling(live: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = live.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    live.with_file_name(name)
}

/// Checks that must pass before anything in the live tree is renamed.
pub(crate) async fn preflight(targets: &[SwapTarget]) -> Result<(), SwapError> {
    for target in targets {
        let old = old_sibling(&target.live);
        if exists(&old).await? {
            return Err(SwapError::LeftoverOld(old));
        }
        if let Some(staged) = target.staged.as_ref() {
            if !exists(staged).await? {
                return Err(SwapError::MissingStaged(staged.clone()));
            }
        }
    }
    Ok(())
}

/// Swap every target in order. On the first failure everything already
/// swapped is undone: new content goes to `<name>.failed-<job>` and
/// `<name>.old` is renamed back.
pub(crate) async fn swap_all(targets: &[SwapTarget], job_id: Uuid) -> Result<Vec<Swapped>, SwapFailure> {
    let mut done: Vec<Swapped> = Vec::with_capacity(targets.len());

    for target in targets {
        let mut current = Swapped {
            live: target.live.clone(),
            old: None,
            installed: false,
        };
        let result = swap_one(target, &mut current).await;
        // A half-finished swap still needs undoing.
        if current.old.is_some() || current.installed {
            done.push(current);
        }
        if let Err(cause) = result {
            error!("swap of {} failed: {cause}", target.live.display());
            let rollback_errors = rollback(&done, job_id).await;
            return Err(SwapFailure { cause, rollback_errors });
        }
    }

    Ok(done)
}

async fn swap_one(target: &SwapTarget, state: &mut Swapped) -> Result<(), SwapError> {
    if exists(&target.live).await? {
        let old = old_sibling(&target.live);
        rename(&target.live, &old).await?;
        state.old = Some(old);
    }

    if let Some(staged) = target.staged.as_ref() {
        if let Some(parent) = target.live.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SwapError::Io {
                    context: "creating parent directory",
                    source,
                })?;
        }
        rename(staged, &target.live).await?;
        state.installed = true;
    }

    if let Some(parent) = target.live.parent() {
        sync_dir(parent).await.map_err(|source| SwapError::Io {
            context: "syncing parent directory",
            source,
        })?;
    }
    Ok(())
}

async fn rollback(done: &[Swapped], job_id: Uuid) -> Vec<String> {
    let mut errors = Vec::new();
    for swapped in done.iter().rev() {
        if swapped.installed {
            let failed = failed_sibling(&swapped.live, job_id);
            match tokio::fs::rename(&swapped.live, &failed).await {
                Ok(()) => info!("kept new content of {} as {}", swapped.live.display(), failed.display()),
                Err(err) => {
                    errors.push(format!("moving {} aside: {err}", swapped.live.display()));
                    // The old copy cannot go back while the new one occupies the path.
                    continue;
                }
            }
        }
        if let Some(old) = swapped.old.as_ref() {
            if let Err(err) = tokio::fs::rename(old, &swapped.live).await {
                errors.push(format!("restoring {}: {err}", old.display()));
            }
        }
        if let Some(parent) = swapped.live.parent() {
            let _ = sync_dir(parent).await;
        }
    }
    for message in &errors {
        error!("rollback: {message}");
    }
    errors
}

/// Delete the `.old` siblings of a fully successful swap. Returns the paths
/// that could not be removed.
pub(crate) async fn discard_old(swapped: &[Swapped]) -> Vec<String> {
    let mut leftovers = Vec::new();
    for old in swapped.iter().filter_map(|s| s.old.as_ref()) {
        if let Err(err) = remove_path(old).await {
            warn!("failed to remove {}: {err}", old.display());
            leftovers.push(old.display().to_string());
        }
    }
    leftovers
}

async fn exists(path: &Path) -> Result<bool, SwapError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(SwapError::Io {
            context: "inspecting restore target",
            source,
        }),
    }
}

async fn rename(from: &Path, to: &Path) -> Result<(), SwapError> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|source| SwapError::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}
