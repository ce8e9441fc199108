use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// A slice of the server's on-disk data set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// World directories.
    PrimaryData,
    /// Plugin and mod directories.
    Extensions,
    /// Config directories and top-level config files.
    Config,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::PrimaryData, Category::Extensions, Category::Config];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::PrimaryData => "primary_data",
            Category::Extensions => "extensions",
            Category::Config => "config",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a backup captures. Doubles as the scope of a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    PrimaryData,
    Extensions,
    Config,
    Migration,
}

impl BackupKind {
    pub fn categories(self) -> &'static [Category] {
        match self {
            BackupKind::Full | BackupKind::Migration => &Category::ALL,
            BackupKind::PrimaryData => &[Category::PrimaryData],
            BackupKind::Extensions => &[Category::Extensions],
            BackupKind::Config => &[Category::Config],
        }
    }

    pub fn includes(self, category: Category) -> bool {
        self.categories().contains(&category)
    }

    /// True when everything `scope` names is part of this capture.
    pub fn covers(self, scope: BackupKind) -> bool {
        scope.categories().iter().all(|c| self.includes(*c))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::PrimaryData => "primary_data",
            BackupKind::Extensions => "extensions",
            BackupKind::Config => "config",
            BackupKind::Migration => "migration",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full" => Ok(BackupKind::Full),
            "primary_data" | "world" | "worlds" => Ok(BackupKind::PrimaryData),
            "extensions" | "plugins" | "mods" => Ok(BackupKind::Extensions),
            "config" => Ok(BackupKind::Config),
            "migration" => Ok(BackupKind::Migration),
            other => Err(EngineError::InvalidRequest(format!("unknown backup kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionClass {
    Daily,
    Weekly,
    Monthly,
    Permanent,
}

impl RetentionClass {
    pub const ALL: [RetentionClass; 4] = [
        RetentionClass::Daily,
        RetentionClass::Weekly,
        RetentionClass::Monthly,
        RetentionClass::Permanent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RetentionClass::Daily => "daily",
            RetentionClass::Weekly => "weekly",
            RetentionClass::Monthly => "monthly",
            RetentionClass::Permanent => "permanent",
        }
    }
}

impl fmt::Display for RetentionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionClass {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(RetentionClass::Daily),
            "weekly" => Ok(RetentionClass::Weekly),
            "monthly" => Ok(RetentionClass::Monthly),
            "permanent" => Ok(RetentionClass::Permanent),
            other => Err(EngineError::InvalidRequest(format!("unknown retention class: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(EngineError::InvalidRequest(format!("unknown job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationDirection {
    Export,
    Import,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Export => write!(f, "export"),
            MigrationDirection::Import => write!(f, "import"),
        }
    }
}

impl FromStr for MigrationDirection {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "export" => Ok(MigrationDirection::Export),
            "import" => Ok(MigrationDirection::Import),
            other => Err(EngineError::InvalidRequest(format!("unknown migration direction: {other}"))),
        }
    }
}

/// Which record table a job lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Backup,
    Restore,
    Migration,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Backup => write!(f, "backup"),
            JobType::Restore => write!(f, "restore"),
            JobType::Migration => write!(f, "migration"),
        }
    }
}

impl FromStr for JobType {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "backup" | "backups" => Ok(JobType::Backup),
            "restore" | "restores" => Ok(JobType::Restore),
            "migration" | "migrations" => Ok(JobType::Migration),
            other => Err(EngineError::InvalidRequest(format!("unknown job type: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_covers_every_scope() {
        for scope in [
            BackupKind::Full,
            BackupKind::PrimaryData,
            BackupKind::Extensions,
            BackupKind::Config,
            BackupKind::Migration,
        ] {
            assert!(BackupKind::Full.covers(scope));
            assert!(BackupKind::Migration.covers(scope));
        }
    }

    #[test]
    fn single_category_kinds_only_cover_themselves() {
        assert!(BackupKind::Config.covers(BackupKind::Config));
        assert!(!BackupKind::Config.covers(BackupKind::Full));
        assert!(!BackupKind::Config.covers(BackupKind::PrimaryData));
        assert!(!BackupKind::Extensions.covers(BackupKind::Config));
    }

    #[test]
    fn parses_aliases_and_rejects_unknown_values() {
        assert_eq!("world".parse::<BackupKind>().unwrap(), BackupKind::PrimaryData);
        assert_eq!("Primary-Data".parse::<BackupKind>().unwrap(), BackupKind::PrimaryData);
        assert_eq!("plugins".parse::<BackupKind>().unwrap(), BackupKind::Extensions);
        assert!(matches!(
            "snapshot".parse::<BackupKind>(),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            "hourly".parse::<RetentionClass>(),
            Err(EngineError::InvalidRequest(_))
        ));
    }
}
