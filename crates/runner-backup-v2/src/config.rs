use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::model::{BackupKind, Category};
use crate::retention::RetentionPolicy;

/// Directory under the server root that holds engine-owned state.
pub const RUNNER_DIR: &str = ".runner";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the live data set. Category paths are relative to it.
    pub server_root: PathBuf,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub service_version: Option<String>,
    #[serde(default)]
    pub categories: CategoryPaths,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

/// Paths, relative to the server root, that make up each category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPaths {
    #[serde(default = "default_primary_data")]
    pub primary_data: Vec<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_config")]
    pub config: Vec<String>,
}

impl Default for CategoryPaths {
    fn default() -> Self {
        Self {
            primary_data: default_primary_data(),
            extensions: default_extensions(),
            config: default_config(),
        }
    }
}

impl CategoryPaths {
    pub fn paths(&self, category: Category) -> &[String] {
        match category {
            Category::PrimaryData => &self.primary_data,
            Category::Extensions => &self.extensions,
            Category::Config => &self.config,
        }
    }
}

/// One top-level path of the data set and the category it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRoot {
    pub category: Category,
    pub rel_path: PathBuf,
}

impl EngineConfig {
    pub fn new(server_root: impl Into<PathBuf>) -> Self {
        Self {
            server_root: server_root.into(),
            state_dir: None,
            archive_dir: None,
            service_name: default_service_name(),
            service_version: None,
            categories: CategoryPaths::default(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            EngineError::InvalidConfig(format!("failed to read {}: {err}", path.display()))
        })?;
        let mut config = Self::parse(&text)?;
        // Relative server roots are resolved against the config file location.
        if config.server_root.is_relative() {
            if let Some(parent) = path.parent() {
                config.server_root = parent.join(&config.server_root);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, EngineError> {
        toml::from_str(text)
            .map_err(|err| EngineError::InvalidConfig(format!("failed to parse backup config: {err}")))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.server_root.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig("server_root must be set".into()));
        }

        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
        for category in Category::ALL {
            for raw in self.categories.paths(category) {
                let rel = validate_rel_path(raw).map_err(|reason| {
                    EngineError::InvalidConfig(format!("{category} path {raw:?}: {reason}"))
                })?;
                if let Some(existing) = seen
                    .iter()
                    .find(|other| other.starts_with(&rel) || rel.starts_with(other))
                {
                    return Err(EngineError::InvalidConfig(format!(
                        "{category} path {raw:?} overlaps {}",
                        existing.display()
                    )));
                }
                seen.insert(rel);
            }
        }

        if seen.is_empty() {
            return Err(EngineError::InvalidConfig("no category paths configured".into()));
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.server_root.join(RUNNER_DIR).join("jobs"))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.archive_dir
            .clone()
            .unwrap_or_else(|| self.server_root.join(RUNNER_DIR).join("backups"))
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.archive_dir().join("bundles")
    }

    /// Partial archives live beside the final ones so the rename stays on one filesystem.
    pub fn partial_dir(&self) -> PathBuf {
        self.archive_dir().join(".partial")
    }

    pub fn staging_root(&self) -> PathBuf {
        self.server_root.join(RUNNER_DIR).join("staging")
    }

    pub fn roots_for(&self, kind: BackupKind) -> Vec<SourceRoot> {
        kind.categories()
            .iter()
            .flat_map(|category| {
                self.categories
                    .paths(*category)
                    .iter()
                    .filter_map(|raw| validate_rel_path(raw).ok())
                    .map(|rel_path| SourceRoot {
                        category: *category,
                        rel_path,
                    })
            })
            .collect()
    }

    pub fn all_roots(&self) -> Vec<SourceRoot> {
        self.roots_for(BackupKind::Full)
    }
}

/// Accepts only plain relative paths that stay inside the server root.
pub(crate) fn validate_rel_path(raw: &str) -> Result<PathBuf, &'static str> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err("empty path");
    }
    let path = Path::new(trimmed);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err("path traversal"),
            Component::RootDir | Component::Prefix(_) => return Err("absolute path"),
        }
    }
    if out.as_os_str().is_empty() {
        return Err("empty path");
    }
    if out.starts_with(RUNNER_DIR) {
        return Err("engine state directory cannot be captured");
    }
    Ok(out)
}

fn default_service_name() -> String {
    "minecraft".to_string()
}

fn default_primary_data() -> Vec<String> {
    ["world", "world_nether", "world_the_end"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_extensions() -> Vec<String> {
    ["mods", "plugins"].into_iter().map(String::from).collect()
}

fn default_config() -> Vec<String> {
    [
        "config",
        "server.properties",
        "whitelist.json",
        "ops.json",
        "banned-ips.json",
        "banned-players.json",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RetentionClass;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = EngineConfig::parse("server_root = \"/srv/atlas/current\"\n").unwrap();
        config.validate().unwrap();

        assert_eq!(config.service_name, "minecraft");
        assert_eq!(config.categories.primary_data.len(), 3);
        assert_eq!(
            config.state_dir(),
            PathBuf::from("/srv/atlas/current/.runner/jobs")
        );
        assert_eq!(
            config.retention.max_age_days(RetentionClass::Weekly),
            Some(30)
        );
    }

    #[test]
    fn roots_follow_kind_categories() {
        let config = EngineConfig::new("/srv");
        let roots = config.roots_for(BackupKind::Config);
        assert!(roots.iter().all(|r| r.category == Category::Config));
        assert!(roots.iter().any(|r| r.rel_path == PathBuf::from("server.properties")));
        assert_eq!(config.all_roots().len(), 11);
    }

    #[test]
    fn rejects_traversal_absolute_and_overlapping_paths() {
        let mut config = EngineConfig::new("/srv");
        config.categories.config = vec!["../etc".into()];
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        config.categories.config = vec!["/etc/passwd".into()];
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        config.categories.config = vec!["world/data".into()];
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        config.categories.config = vec![".runner/jobs".into()];
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn parses_custom_categories_and_retention() {
        let text = r#"
server_root = "/data"
service_version = "1.20.1"

[categories]
primary_data = ["worlds/main"]
extensions = []
config = ["settings"]

[retention]
daily_days = 3
"#;
        let config = EngineConfig::parse(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.service_version.as_deref(), Some("1.20.1"));
        assert_eq!(config.roots_for(BackupKind::Full).len(), 2);
        assert_eq!(config.retention.max_age_days(RetentionClass::Daily), Some(3));
        assert_eq!(config.retention.max_age_days(RetentionClass::Monthly), Some(90));
    }
}
