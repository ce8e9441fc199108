mod controller;

use anyhow::{Context, Result};
use minecraft_client_rs::Client;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tokio::task::spawn_blocking;

pub use controller::{RconController, RconControllerConfig};

const DEFAULT_RCON_PORT: u16 = 25575;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconSettings {
    pub address: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct RconClient {
    address: String,
    password: String,
}

impl RconClient {
    pub fn new(address: String, password: String) -> Self {
        Self { address, password }
    }

    pub fn from_settings(settings: RconSettings) -> Self {
        Self::new(settings.address, settings.password)
    }

    /// Open a session, run one command, close the session.
    pub async fn execute(&self, command: &str) -> Result<String> {
        let command = command.to_string();
        self.session(move |client| {
            let response = client
                .send_command(command)
                .map_err(|err| anyhow::anyhow!(err.to_string()))?;
            Ok(response.body)
        })
        .await
    }

    /// Connect and authenticate without running anything.
    pub async fn probe(&self) -> Result<()> {
        self.session(|_| Ok(String::new())).await.map(|_| ())
    }

    async fn session<F>(&self, run: F) -> Result<String>
    where
        F: FnOnce(&mut Client) -> Result<String> + Send + 'static,
    {
        let address = self.address.clone();
        let password = self.password.clone();

        spawn_blocking(move || {
            let mut client = Client::new(address).map_err(|err| anyhow::anyhow!(err.to_string()))?;
            client
                .authenticate(password)
                .map_err(|err| anyhow::anyhow!(err.to_string()))?;
            let body = run(&mut client)?;
            client.close().map_err(|err| anyhow::anyhow!(err.to_string()))?;
            Ok::<_, anyhow::Error>(body)
        })
        .await
        .with_context(|| "RCON task failed")?
    }
}

/// RCON settings from `<server_root>/server.properties`, or `None` when the
/// file is missing or RCON is disabled.
pub async fn load_rcon_settings(server_root: &Path) -> Result<Option<RconSettings>> {
    let properties_path = server_root.join("server.properties");
    let content = match fs::read_to_string(&properties_path).await {
        Ok(value) => value,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", properties_path.display()));
        }
    };
    parse_rcon_settings(&content)
}

fn parse_rcon_settings(content: &str) -> Result<Option<RconSettings>> {
    let properties = parse_properties(content);
    let enabled = properties
        .get("enable-rcon")
        .is_some_and(|value| value.eq_ignore_ascii_case("true"));
    if !enabled {
        return Ok(None);
    }

    let password = properties
        .get("rcon.password")
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow::anyhow!("enable-rcon is set but rcon.password is empty"))?;
    let port = properties
        .get("rcon.port")
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_RCON_PORT);
    Ok(Some(RconSettings {
        address: format!("127.0.0.1:{port}"),
        password: password.to_string(),
    }))
}

/// `key=value` lines of a Java properties file; comments and blanks skipped,
/// later keys win.
fn parse_properties(content: &str) -> HashMap<&str, &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_rcon_yields_no_settings() {
        let parsed = parse_rcon_settings("enable-rcon=false\nrcon.password=secret\n").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn enabled_rcon_uses_port_and_password() {
        let parsed = parse_rcon_settings("# comment\nenable-rcon=true\nrcon.port=25580\nrcon.password = hunter2\n")
            .unwrap()
            .expect("settings");
        assert_eq!(parsed.address, "127.0.0.1:25580");
        assert_eq!(parsed.password, "hunter2");

        let defaulted = parse_rcon_settings("enable-rcon=TRUE\nrcon.password=x\n").unwrap().unwrap();
        assert_eq!(defaulted.address, "127.0.0.1:25575");
    }

    #[test]
    fn enabled_rcon_without_password_is_an_error() {
        assert!(parse_rcon_settings("enable-rcon=true\n").is_err());
    }

    #[test]
    fn properties_skip_comments_and_keep_last_value() {
        let props = parse_properties("! legacy comment\nmotd=a=b\nlevel-name=world\nlevel-name=survival\n");
        assert_eq!(props.get("motd"), Some(&"a=b"));
        assert_eq!(props.get("level-name"), Some(&"survival"));
        assert_eq!(props.len(), 2);
    }
}
