use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{BackupKind, Category, Metadata};

/// Name of the first tar member of every archive.
pub const MANIFEST_NAME: &str = "manifest.json";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub archive_id: Uuid,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub roots: Vec<ManifestRoot>,
    #[serde(default)]
    pub directories: Vec<String>,
    pub entries: Vec<ManifestEntry>,
    pub total_bytes: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A configured top-level path and what it looked like at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRoot {
    pub path: String,
    pub category: Category,
    pub shape: RootShape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootShape {
    Dir,
    File,
    /// Configured but not present on disk; restoring it vacates the live path.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub category: Category,
    pub size: u64,
    pub sha256: String,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn categories(&self) -> BTreeSet<Category> {
        self.roots.iter().map(|root| root.category).collect()
    }

    /// True when every category `scope` names was captured.
    pub fn covers(&self, scope: BackupKind) -> bool {
        let captured = self.categories();
        scope.categories().iter().all(|c| captured.contains(c))
    }

    pub fn roots_in(&self, scope: BackupKind) -> impl Iterator<Item = &ManifestRoot> {
        self.roots
            .iter()
            .filter(move |root| scope.includes(root.category))
    }

    pub fn entries_in(&self, category: Category) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.category == category)
    }

    /// Comparable view of the captured content: path → content id.
    pub fn content_set(&self) -> BTreeSet<(String, String)> {
        self.entries
            .iter()
            .map(|entry| (entry.path.clone(), entry.sha256.clone()))
            .collect()
    }

    pub fn service_name(&self) -> Option<&str> {
        self.metadata.get("service_name").and_then(|v| v.as_str())
    }

    pub fn service_version(&self) -> Option<&str> {
        self.metadata.get("service_version").and_then(|v| v.as_str())
    }
}
