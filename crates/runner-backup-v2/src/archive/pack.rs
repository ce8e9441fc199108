use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{Builder, EntryType, Header, HeaderMode};
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use super::hashing::{HashingReader, sha256_file};
use super::manifest::{FORMAT_VERSION, MANIFEST_NAME, Manifest, ManifestEntry, ManifestRoot, RootShape};
use super::paths::logical_path;
use crate::config::SourceRoot;
use crate::errors::ArchiveError;
use crate::model::{BackupKind, Metadata};
use crate::store::sync_dir_blocking;

pub struct PackRequest<'a> {
    pub archive_id: Uuid,
    pub kind: BackupKind,
    pub source_root: &'a Path,
    pub roots: &'a [SourceRoot],
    pub destination: &'a Path,
    pub partial_dir: &'a Path,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct PackedArchive {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub manifest: Manifest,
}

/// Capture `roots` into a compressed archive at `destination`.
///
/// The archive is written under `partial_dir` first and renamed into place
/// only once every byte is flushed and synced, so `destination` either holds
/// a complete archive or does not exist. Blocking; run it on a blocking
/// thread.
pub fn pack(request: PackRequest<'_>) -> Result<PackedArchive, ArchiveError> {
    if request.destination.exists() {
        return Err(ArchiveError::Capture(format!(
            "archive {} already exists",
            request.destination.display()
        )));
    }

    let scan = scan_roots(request.source_root, request.roots)?;
    if scan.roots.iter().all(|root| root.shape == RootShape::Absent) {
        return Err(ArchiveError::Capture(format!(
            "nothing to capture for {} backup: none of the configured paths exist under {}",
            request.kind,
            request.source_root.display()
        )));
    }

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        archive_id: request.archive_id,
        kind: request.kind,
        created_at: Utc::now(),
        total_bytes: scan.entries.iter().map(|entry| entry.size).sum(),
        roots: scan.roots,
        directories: scan.directories,
        entries: scan.entries,
        metadata: request.metadata,
    };

    fs::create_dir_all(request.partial_dir)
        .map_err(|err| ArchiveError::io("creating partial archive directory", err))?;
    let partial = request
        .partial_dir
        .join(format!("{}.tar.gz.partial", request.archive_id));

    if let Err(err) = write_archive(&partial, request.source_root, &manifest) {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }

    if let Err(err) = promote(&partial, request.destination) {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }

    let size_bytes = fs::metadata(request.destination)
        .map_err(|err| ArchiveError::io("reading archive size", err))?
        .len();
    debug!(
        "packed {} entries ({} bytes raw, {size_bytes} compressed) into {}",
        manifest.entries.len(),
        manifest.total_bytes,
        request.destination.display()
    );

    Ok(PackedArchive {
        path: request.destination.to_path_buf(),
        size_bytes,
        manifest,
    })
}

#[derive(Default)]
struct Scan {
    roots: Vec<ManifestRoot>,
    directories: Vec<String>,
    entries: Vec<ManifestEntry>,
}

fn scan_roots(source_root: &Path, roots: &[SourceRoot]) -> Result<Scan, ArchiveError> {
    let mut scan = Scan::default();

    for root in roots {
        let abs = source_root.join(&root.rel_path);
        let logical = logical_path(&root.rel_path)
            .map_err(|reason| ArchiveError::capture(root.rel_path.display(), reason))?;

        let shape = match fs::symlink_metadata(&abs) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => RootShape::Absent,
            Err(err) => return Err(ArchiveError::capture(format!("cannot read {}", abs.display()), err)),
            Ok(meta) if meta.is_dir() => RootShape::Dir,
            Ok(meta) if meta.is_file() => RootShape::File,
            Ok(_) => {
                return Err(ArchiveError::Capture(format!(
                    "{} is not a regular file or directory",
                    abs.display()
                )));
            }
        };

        match shape {
            RootShape::Absent => debug!("{} not present; recorded as absent", abs.display()),
            RootShape::File => {
                scan.entries.push(hash_entry(&abs, logical.clone(), root)?);
            }
            RootShape::Dir => walk_dir(source_root, &abs, root, &mut scan)?,
        }

        scan.roots.push(ManifestRoot {
            path: logical,
            category: root.category,
            shape,
        });
    }

    Ok(scan)
}

fn walk_dir(source_root: &Path, abs: &Path, root: &SourceRoot, scan: &mut Scan) -> Result<(), ArchiveError> {
    for entry in WalkDir::new(abs).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| ArchiveError::capture(format!("walking {}", abs.display()), err))?;
        let rel = entry
            .path()
            .strip_prefix(source_root)
            .map_err(|err| ArchiveError::capture(entry.path().display(), err))?;
        let logical = logical_path(rel).map_err(|reason| ArchiveError::capture(rel.display(), reason))?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            scan.directories.push(logical);
        } else if file_type.is_file() {
            scan.entries.push(hash_entry(entry.path(), logical, root)?);
        } else {
            debug!("skipping non-regular file {}", entry.path().display());
        }
    }
    Ok(())
}

fn hash_entry(abs: &Path, logical: String, root: &SourceRoot) -> Result<ManifestEntry, ArchiveError> {
    let (size, sha256) =
        sha256_file(abs).map_err(|err| ArchiveError::capture(format!("reading {}", abs.display()), err))?;
    let modified = fs::metadata(abs)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    Ok(ManifestEntry {
        path: logical,
        category: root.category,
        size,
        sha256,
        modified,
    })
}

fn write_archive(partial: &Path, source_root: &Path, manifest: &Manifest) -> Result<(), ArchiveError> {
    let file = File::create(partial)
        .map_err(|err| ArchiveError::capture(format!("creating {}", partial.display()), err))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);

    let manifest_bytes =
        serde_json::to_vec_pretty(manifest).map_err(|err| ArchiveError::capture("encoding manifest", err))?;
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(manifest.created_at.timestamp().max(0) as u64);
    builder
        .append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())
        .map_err(|err| ArchiveError::capture("writing manifest", err))?;

    for dir in &manifest.directories {
        let abs = source_root.join(dir);
        let meta = fs::metadata(&abs)
            .map_err(|err| ArchiveError::capture(format!("{dir} changed while it was being captured"), err))?;
        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&meta, HeaderMode::Complete);
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder
            .append_data(&mut header, dir, io::empty())
            .map_err(|err| ArchiveError::capture(format!("writing directory {dir}"), err))?;
    }

    for entry in &manifest.entries {
        let abs = source_root.join(&entry.path);
        let file = File::open(&abs)
            .map_err(|err| ArchiveError::capture(format!("{} changed while it was being captured", entry.path), err))?;
        let meta = file
            .metadata()
            .map_err(|err| ArchiveError::capture(format!("reading {}", abs.display()), err))?;

        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&meta, HeaderMode::Complete);
        header.set_size(entry.size);

        let mut reader = HashingReader::new(file.take(entry.size));
        builder
            .append_data(&mut header, &entry.path, &mut reader)
            .map_err(|err| ArchiveError::capture(format!("writing {}", entry.path), err))?;
        let (count, digest) = reader.finish();
        if count != entry.size || digest != entry.sha256 {
            return Err(ArchiveError::Capture(format!(
                "{} changed while it was being captured",
                entry.path
            )));
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|err| ArchiveError::capture("finishing archive", err))?;
    let writer = encoder
        .finish()
        .map_err(|err| ArchiveError::capture("finishing compression", err))?;
    let file = writer
        .into_inner()
        .map_err(|err| ArchiveError::capture("flushing archive", err.error()))?;
    file.sync_all()
        .map_err(|err| ArchiveError::capture("syncing archive", err))?;
    Ok(())
}

fn promote(partial: &Path, destination: &Path) -> Result<(), ArchiveError> {
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| ArchiveError::io("creating archive directory", err))?;
    fs::rename(partial, destination).map_err(|err| ArchiveError::io("moving archive into place", err))?;
    sync_dir_blocking(parent).map_err(|err| ArchiveError::io("syncing archive directory", err))?;
    Ok(())
}
