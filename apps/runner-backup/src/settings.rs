use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use runner_backup_v2::{DetachedController, EngineConfig, ProcessController};
use runner_v2_rcon::{RconController, RconControllerConfig};
use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "backup.toml";

/// CLI-only sections of `backup.toml`; the engine ignores them.
#[derive(Debug, Default, Deserialize)]
struct CliFile {
    #[serde(default)]
    rcon: RconSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RconSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default)]
    pub launch: Vec<String>,
}

impl Default for RconSection {
    fn default() -> Self {
        Self {
            enabled: false,
            stop_grace_secs: default_stop_grace_secs(),
            launch: Vec::new(),
        }
    }
}

pub struct CliSettings {
    pub engine: EngineConfig,
    pub rcon: RconSection,
    pub config_path: Option<PathBuf>,
}

impl CliSettings {
    pub fn controller(&self) -> Arc<dyn ProcessController> {
        if self.rcon.enabled {
            Arc::new(RconController::new(RconControllerConfig {
                server_root: self.engine.server_root.clone(),
                stop_grace: Duration::from_secs(self.rcon.stop_grace_secs),
                launch: self.rcon.launch.clone(),
            }))
        } else {
            Arc::new(DetachedController)
        }
    }
}

/// Resolve settings from flags, then `ATLAS_*` environment variables, then
/// `backup.toml` in the server root, then built-in defaults.
pub fn resolve_cli_settings(
    config_override: Option<PathBuf>,
    server_root_override: Option<PathBuf>,
) -> Result<CliSettings> {
    let server_root = server_root_override
        .or_else(|| normalize_optional(std::env::var("ATLAS_SERVER_ROOT").ok()).map(PathBuf::from));

    let explicit_config = config_override
        .or_else(|| normalize_optional(std::env::var("ATLAS_BACKUP_CONFIG").ok()).map(PathBuf::from));

    let config_path = match explicit_config {
        Some(path) => Some(path),
        None => {
            let root = match server_root.as_ref() {
                Some(root) => root.clone(),
                None => std::env::current_dir().context("failed to resolve current directory")?,
            };
            let candidate = root.join(CONFIG_FILE_NAME);
            candidate.exists().then_some(candidate)
        }
    };

    let (mut engine, rcon) = match config_path.as_ref() {
        Some(path) => load_config_file(path)?,
        None => {
            let root = match server_root.as_ref() {
                Some(root) => root.clone(),
                None => std::env::current_dir().context("failed to resolve current directory")?,
            };
            (EngineConfig::new(root), RconSection::default())
        }
    };

    if let Some(root) = server_root {
        engine.server_root = root;
    }
    engine.server_root = absolute(&engine.server_root)?;
    engine.validate().context("invalid backup configuration")?;

    Ok(CliSettings {
        engine,
        rcon,
        config_path,
    })
}

fn load_config_file(path: &Path) -> Result<(EngineConfig, RconSection)> {
    let engine = EngineConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let cli: CliFile = toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok((engine, cli.rcon))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("failed to resolve current directory")?
        .join(path))
}

pub fn default_actor() -> String {
    normalize_optional(std::env::var("USER").ok())
        .or_else(|| normalize_optional(std::env::var("USERNAME").ok()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn normalize_optional(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn default_stop_grace_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_optional_drops_blank_values() {
        assert_eq!(normalize_optional(Some("  ".into())), None);
        assert_eq!(normalize_optional(Some(" ops ".into())), Some("ops".into()));
        assert_eq!(normalize_optional(None), None);
    }

    #[test]
    fn rcon_section_defaults_when_absent() {
        let cli: CliFile = toml::from_str("server_root = \"/srv/atlas/current\"\n").unwrap();
        assert!(!cli.rcon.enabled);
        assert_eq!(cli.rcon.stop_grace_secs, 30);

        let cli: CliFile = toml::from_str(
            "server_root = \"/srv\"\n[rcon]\nenabled = true\nlaunch = [\"./start.sh\", \"nogui\"]\n",
        )
        .unwrap();
        assert!(cli.rcon.enabled);
        assert_eq!(cli.rcon.launch, vec!["./start.sh", "nogui"]);
    }
}
