use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::{Archive, Entries, EntryType};

use super::hashing::HashingWriter;
use super::manifest::{FORMAT_VERSION, MANIFEST_NAME, Manifest, ManifestEntry, RootShape};
use super::paths::{checked_logical, is_within, logical_path};
use crate::config::validate_rel_path;
use crate::errors::ArchiveError;

const MAX_MANIFEST_BYTES: u64 = 64 * 1024 * 1024;

type ArchiveReader = Archive<GzDecoder<BufReader<File>>>;

/// Read only the manifest member.
pub fn list_manifest(path: &Path) -> Result<Manifest, ArchiveError> {
    let mut archive = open(path)?;
    let mut members = archive
        .entries()
        .map_err(|err| ArchiveError::corrupt(path, format!("unreadable archive: {err}")))?;
    read_manifest(path, &mut members)
}

/// Extract every member into `staging_dir`, checking each against the
/// manifest. Nothing outside `staging_dir` is touched.
pub fn unpack(path: &Path, staging_dir: &Path) -> Result<Manifest, ArchiveError> {
    read_members(path, Some(staging_dir))
}

/// Stream every member and check it against the manifest without writing anything.
pub fn verify(path: &Path) -> Result<Manifest, ArchiveError> {
    read_members(path, None)
}

fn open(path: &Path) -> Result<ArchiveReader, ArchiveError> {
    let file = File::open(path).map_err(|err| ArchiveError::corrupt(path, format!("cannot open archive: {err}")))?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn read_manifest<R: Read>(path: &Path, members: &mut Entries<'_, R>) -> Result<Manifest, ArchiveError> {
    let mut first = members
        .next()
        .ok_or_else(|| ArchiveError::corrupt(path, "archive is empty"))?
        .map_err(|err| ArchiveError::corrupt(path, format!("unreadable first member: {err}")))?;

    let name = first
        .path()
        .map_err(|err| ArchiveError::corrupt(path, format!("unreadable member name: {err}")))?
        .into_owned();
    if name != Path::new(MANIFEST_NAME) {
        return Err(ArchiveError::corrupt(
            path,
            format!("first member is {}, expected {MANIFEST_NAME}", name.display()),
        ));
    }
    if first.size() > MAX_MANIFEST_BYTES {
        return Err(ArchiveError::corrupt(path, "manifest is implausibly large"));
    }

    let mut bytes = Vec::with_capacity(first.size() as usize);
    first
        .read_to_end(&mut bytes)
        .map_err(|err| ArchiveError::corrupt(path, format!("truncated manifest: {err}")))?;
    let manifest: Manifest = serde_json::from_slice(&bytes)
        .map_err(|err| ArchiveError::corrupt(path, format!("unparseable manifest: {err}")))?;

    if manifest.format_version == 0 || manifest.format_version > FORMAT_VERSION {
        return Err(ArchiveError::corrupt(
            path,
            format!("unsupported manifest format version {}", manifest.format_version),
        ));
    }
    check_manifest_paths(path, &manifest)?;
    Ok(manifest)
}

/// Every path a manifest names must be a clean relative path below one of its roots.
fn check_manifest_paths(path: &Path, manifest: &Manifest) -> Result<(), ArchiveError> {
    let mut roots = Vec::with_capacity(manifest.roots.len());
    for root in &manifest.roots {
        let rel = validate_rel_path(&root.path)
            .map_err(|reason| ArchiveError::corrupt(path, format!("root {:?}: {reason}", root.path)))?;
        if logical_path(&rel).ok().as_deref() != Some(root.path.as_str()) {
            return Err(ArchiveError::corrupt(path, format!("root {:?} is not normalized", root.path)));
        }
        roots.push(root);
    }

    let owner = |candidate: &str| roots.iter().find(|root| is_within(candidate, &root.path)).copied();

    for dir in &manifest.directories {
        checked_logical(dir).map_err(|reason| ArchiveError::corrupt(path, format!("directory {dir:?}: {reason}")))?;
        match owner(dir) {
            Some(root) if root.shape == RootShape::Dir => {}
            _ => {
                return Err(ArchiveError::corrupt(
                    path,
                    format!("directory {dir:?} is outside the captured roots"),
                ));
            }
        }
    }

    for entry in &manifest.entries {
        checked_logical(&entry.path)
            .map_err(|reason| ArchiveError::corrupt(path, format!("entry {:?}: {reason}", entry.path)))?;
        let Some(root) = owner(&entry.path) else {
            return Err(ArchiveError::corrupt(
                path,
                format!("entry {:?} is outside the captured roots", entry.path),
            ));
        };
        let shape_ok = match root.shape {
            RootShape::File => entry.path == root.path,
            RootShape::Dir => entry.path != root.path,
            RootShape::Absent => false,
        };
        if !shape_ok || entry.category != root.category {
            return Err(ArchiveError::corrupt(
                path,
                format!("entry {:?} does not match root {:?}", entry.path, root.path),
            ));
        }
    }
    Ok(())
}

fn read_members(path: &Path, staging: Option<&Path>) -> Result<Manifest, ArchiveError> {
    let mut archive = open(path)?;
    let mut members = archive
        .entries()
        .map_err(|err| ArchiveError::corrupt(path, format!("unreadable archive: {err}")))?;
    let manifest = read_manifest(path, &mut members)?;

    let expected: HashMap<&str, &ManifestEntry> = manifest
        .entries
        .iter()
        .map(|entry| (entry.path.as_str(), entry))
        .collect();
    let directories: HashSet<&str> = manifest.directories.iter().map(String::as_str).collect();

    if let Some(dir) = staging {
        fs::create_dir_all(dir).map_err(|err| ArchiveError::io("creating staging directory", err))?;
        for logical in &manifest.directories {
            fs::create_dir_all(dir.join(logical))
                .map_err(|err| ArchiveError::io("creating staged directory", err))?;
        }
    }

    let mut seen: HashSet<String> = HashSet::with_capacity(expected.len());
    for member in members {
        let mut member =
            member.map_err(|err| ArchiveError::corrupt(path, format!("unreadable member: {err}")))?;
        let name = member
            .path()
            .map_err(|err| ArchiveError::corrupt(path, format!("unreadable member name: {err}")))?
            .into_owned();
        let logical = logical_path(&name)
            .map_err(|reason| ArchiveError::corrupt(path, format!("member {}: {reason}", name.display())))?;

        match member.header().entry_type() {
            EntryType::Directory => {
                if !directories.contains(logical.as_str()) {
                    return Err(ArchiveError::corrupt(
                        path,
                        format!("directory {logical} is not listed in the manifest"),
                    ));
                }
                continue;
            }
            EntryType::Regular | EntryType::Continuous => {}
            other => {
                return Err(ArchiveError::corrupt(
                    path,
                    format!("member {logical} has unsupported type {other:?}"),
                ));
            }
        }

        let Some(entry) = expected.get(logical.as_str()) else {
            return Err(ArchiveError::corrupt(
                path,
                format!("member {logical} is not listed in the manifest"),
            ));
        };
        if !seen.insert(logical.clone()) {
            return Err(ArchiveError::corrupt(path, format!("member {logical} appears twice")));
        }
        if member.size() != entry.size {
            return Err(ArchiveError::corrupt(
                path,
                format!(
                    "size mismatch for {logical}: manifest says {}, archive holds {}",
                    entry.size,
                    member.size()
                ),
            ));
        }

        let (count, digest) = match staging {
            Some(dir) => extract_member(path, &mut member, &dir.join(&logical), &logical)?,
            None => {
                let mut sink = HashingWriter::new(io::sink());
                io::copy(&mut member, &mut sink)
                    .map_err(|err| ArchiveError::corrupt(path, format!("truncated member {logical}: {err}")))?;
                let (_, count, digest) = sink.finish();
                (count, digest)
            }
        };

        if count != entry.size {
            return Err(ArchiveError::corrupt(
                path,
                format!("size mismatch for {logical}: expected {} bytes, read {count}", entry.size),
            ));
        }
        if digest != entry.sha256 {
            return Err(ArchiveError::corrupt(path, format!("content hash mismatch for {logical}")));
        }
    }

    if let Some(missing) = manifest
        .entries
        .iter()
        .find(|entry| !seen.contains(entry.path.as_str()))
    {
        return Err(ArchiveError::corrupt(
            path,
            format!("member {} listed in the manifest is missing", missing.path),
        ));
    }

    Ok(manifest)
}

fn extract_member<R: Read>(
    archive_path: &Path,
    member: &mut tar::Entry<'_, R>,
    dest: &Path,
    logical: &str,
) -> Result<(u64, String), ArchiveError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| ArchiveError::io("creating staged directory", err))?;
    }
    let file = File::create(dest).map_err(|err| ArchiveError::io("creating staged file", err))?;
    let mut writer = HashingWriter::new(BufWriter::new(file));
    io::copy(member, &mut writer)
        .map_err(|err| ArchiveError::corrupt(archive_path, format!("truncated member {logical}: {err}")))?;
    writer
        .flush()
        .map_err(|err| ArchiveError::io("writing staged file", err))?;
    let (buffered, count, digest) = writer.finish();
    let file = buffered
        .into_inner()
        .map_err(|err| ArchiveError::io("writing staged file", err.into_error()))?;
    file.sync_all()
        .map_err(|err| ArchiveError::io("syncing staged file", err))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(mode) = member.header().mode() {
            fs::set_permissions(dest, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|err| ArchiveError::io("setting staged file permissions", err))?;
        }
    }

    Ok((count, digest))
}
