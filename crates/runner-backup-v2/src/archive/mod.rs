//! Archive codec: a gzip-compressed tar whose first member is `manifest.json`.
//!
//! The manifest lists every configured root (and whether it existed), every
//! directory and every file with its size and SHA-256. Readers check each
//! member against it, so a truncated or tampered archive is rejected before
//! anything it contains reaches the live tree.

mod hashing;
mod manifest;
mod pack;
mod paths;
mod read;

pub use manifest::{FORMAT_VERSION, MANIFEST_NAME, Manifest, ManifestEntry, ManifestRoot, RootShape};
pub use pack::{PackRequest, PackedArchive, pack};
pub use read::{list_manifest, unpack, verify};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceRoot;
    use crate::errors::ArchiveError;
    use crate::model::{BackupKind, Category, Metadata};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("atlas-backup-archive-{prefix}-{nanos}"))
    }

    fn seed_server(root: &Path) {
        fs::create_dir_all(root.join("world/region")).unwrap();
        fs::create_dir_all(root.join("world/data/empty")).unwrap();
        fs::write(root.join("world/level.dat"), b"level").unwrap();
        fs::write(root.join("world/region/r.0.0.mca"), vec![7u8; 70_000]).unwrap();
        fs::write(root.join("server.properties"), b"motd=hello\n").unwrap();
    }

    fn roots() -> Vec<SourceRoot> {
        vec![
            SourceRoot {
                category: Category::PrimaryData,
                rel_path: PathBuf::from("world"),
            },
            SourceRoot {
                category: Category::PrimaryData,
                rel_path: PathBuf::from("world_nether"),
            },
            SourceRoot {
                category: Category::Config,
                rel_path: PathBuf::from("server.properties"),
            },
        ]
    }

    fn pack_into(root: &Path, out: &Path) -> PackedArchive {
        let roots = roots();
        pack(PackRequest {
            archive_id: Uuid::new_v4(),
            kind: BackupKind::Full,
            source_root: root,
            roots: &roots,
            destination: &out.join("a.tar.gz"),
            partial_dir: &out.join(".partial"),
            metadata: Metadata::new(),
        })
        .expect("pack")
    }

    #[test]
    fn pack_then_unpack_reproduces_the_tree() {
        let dir = unique_temp_dir("roundtrip");
        let server = dir.join("server");
        seed_server(&server);

        let packed = pack_into(&server, &dir.join("out"));
        assert!(packed.path.exists());
        assert!(packed.size_bytes > 0);
        assert_eq!(packed.manifest.entries.len(), 3);
        assert_eq!(packed.manifest.total_bytes, 5 + 70_000 + 11);
        assert!(packed.manifest.directories.contains(&"world/data/empty".to_string()));
        let nether = packed
            .manifest
            .roots
            .iter()
            .find(|root| root.path == "world_nether")
            .unwrap();
        assert_eq!(nether.shape, RootShape::Absent);
        // No partial file survives a successful pack.
        assert_eq!(fs::read_dir(dir.join("out/.partial")).unwrap().count(), 0);

        let listed = list_manifest(&packed.path).expect("list manifest");
        assert_eq!(listed, packed.manifest);

        let staging = dir.join("staging");
        unpack(&packed.path, &staging).expect("unpack");
        assert_eq!(fs::read(staging.join("world/level.dat")).unwrap(), b"level");
        assert_eq!(fs::read(staging.join("world/region/r.0.0.mca")).unwrap().len(), 70_000);
        assert!(staging.join("world/data/empty").is_dir());
        assert_eq!(fs::read(staging.join("server.properties")).unwrap(), b"motd=hello\n");
        assert!(!staging.join("world_nether").exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn pack_refuses_when_nothing_exists() {
        let dir = unique_temp_dir("empty");
        fs::create_dir_all(&dir).unwrap();
        let roots = roots();
        let err = pack(PackRequest {
            archive_id: Uuid::new_v4(),
            kind: BackupKind::Full,
            source_root: &dir,
            roots: &roots,
            destination: &dir.join("a.tar.gz"),
            partial_dir: &dir.join(".partial"),
            metadata: Metadata::new(),
        })
        .unwrap_err();
        assert!(matches!(err, ArchiveError::Capture(_)));
        assert!(!dir.join("a.tar.gz").exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn long_member_names_survive() {
        let dir = unique_temp_dir("long");
        let server = dir.join("server");
        let deep = server.join("world").join("d".repeat(120)).join("e".repeat(120));
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("f".repeat(90)), b"deep").unwrap();

        let packed = pack_into(&server, &dir.join("out"));
        let manifest = verify(&packed.path).expect("verify");
        assert!(manifest.entries.iter().any(|entry| entry.path.len() > 300));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn verify_rejects_truncated_archive() {
        let dir = unique_temp_dir("truncated");
        let server = dir.join("server");
        seed_server(&server);
        let packed = pack_into(&server, &dir.join("out"));

        let bytes = fs::read(&packed.path).unwrap();
        fs::write(&packed.path, &bytes[..bytes.len() / 2]).unwrap();

        let err = verify(&packed.path).unwrap_err();
        assert!(matches!(err, ArchiveError::Corrupt { .. }), "{err}");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn verify_rejects_archive_without_leading_manifest() {
        let dir = unique_temp_dir("nomanifest");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.tar.gz");

        let file = fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        builder.append_data(&mut header, "world/level.dat", &b"evil"[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = list_manifest(&path).unwrap_err();
        assert!(err.to_string().contains("expected manifest.json"), "{err}");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unpack_rejects_members_missing_from_manifest() {
        let dir = unique_temp_dir("extra");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("extra.tar.gz");

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            archive_id: Uuid::new_v4(),
            kind: BackupKind::Config,
            created_at: chrono::Utc::now(),
            roots: vec![ManifestRoot {
                path: "server.properties".into(),
                category: Category::Config,
                shape: RootShape::Absent,
            }],
            directories: Vec::new(),
            entries: Vec::new(),
            total_bytes: 0,
            metadata: Metadata::new(),
        };
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();

        let file = fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_bytes.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())
            .unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        builder.append_data(&mut header, "ops.json", &b"evil"[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let staging = dir.join("staging");
        let err = unpack(&path, &staging).unwrap_err();
        assert!(err.to_string().contains("not listed in the manifest"), "{err}");
        assert!(!staging.join("ops.json").exists());

        let _ = fs::remove_dir_all(dir);
    }
}
