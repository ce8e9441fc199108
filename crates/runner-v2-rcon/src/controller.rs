use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use runner_backup_v2::{ControllerError, ProcessController};
use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::{RconClient, load_rcon_settings};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RconControllerConfig {
    /// Directory holding `server.properties`; also the launch working directory.
    pub server_root: PathBuf,
    /// How long to wait for the server to go away after `stop`.
    pub stop_grace: Duration,
    /// Program and arguments used by `start`.
    pub launch: Vec<String>,
}

/// Controls a Minecraft server over RCON.
///
/// Quiesce is `save-all flush` + `save-off`, resume is `save-on`. When RCON is
/// disabled in `server.properties` the server is treated as not running.
pub struct RconController {
    config: RconControllerConfig,
}

impl RconController {
    pub fn new(config: RconControllerConfig) -> Self {
        Self { config }
    }

    async fn client(&self) -> Result<Option<RconClient>, ControllerError> {
        let settings = load_rcon_settings(&self.config.server_root)
            .await
            .map_err(|err| ControllerError::Unavailable(err.to_string()))?;
        Ok(settings.map(RconClient::from_settings))
    }

    async fn run(&self, client: &RconClient, command: &str) -> Result<String, ControllerError> {
        debug!("rcon: {command}");
        client
            .execute(command)
            .await
            .map_err(|err| ControllerError::Command {
                command: command.to_string(),
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl ProcessController for RconController {
    async fn quiesce(&self) -> Result<(), ControllerError> {
        let Some(client) = self.client().await? else {
            debug!("rcon disabled; capturing without save-off");
            return Ok(());
        };
        if client.probe().await.is_err() {
            debug!("rcon unreachable; server is not running");
            return Ok(());
        }
        self.run(&client, "save-all flush").await?;
        self.run(&client, "save-off").await?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), ControllerError> {
        let Some(client) = self.client().await? else {
            return Ok(());
        };
        if client.probe().await.is_err() {
            return Ok(());
        }
        self.run(&client, "save-on").await?;
        Ok(())
    }

    async fn stop(&self) -> Result<bool, ControllerError> {
        let Some(client) = self.client().await? else {
            return Ok(false);
        };
        if let Err(err) = client.execute("stop").await {
            debug!("rcon stop not delivered, treating server as stopped: {err}");
            return Ok(false);
        }

        info!(
            "waiting up to {}s for the server to stop",
            self.config.stop_grace.as_secs()
        );
        let deadline = Instant::now() + self.config.stop_grace;
        loop {
            sleep(STOP_POLL_INTERVAL).await;
            if client.probe().await.is_err() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Err(ControllerError::Command {
                    command: "stop".to_string(),
                    message: format!(
                        "server still answering RCON after {}s",
                        self.config.stop_grace.as_secs()
                    ),
                });
            }
        }
    }

    async fn start(&self) -> Result<(), ControllerError> {
        let mut argv = self.config.launch.iter();
        let program = argv.next().ok_or_else(|| {
            ControllerError::Unavailable("no launch command configured; start the server manually".into())
        })?;

        let mut cmd = Command::new(program);
        cmd.args(argv);
        cmd.current_dir(&self.config.server_root);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let child = cmd.spawn()?;
        match child.id() {
            Some(pid) => info!("started server process {pid}"),
            None => warn!("server process exited immediately after launch"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("atlas-rcon-{prefix}-{nanos}"))
    }

    fn controller(root: PathBuf, launch: Vec<String>) -> RconController {
        RconController::new(RconControllerConfig {
            server_root: root,
            stop_grace: Duration::from_secs(1),
            launch,
        })
    }

    #[tokio::test]
    async fn disabled_rcon_is_a_stopped_server() {
        let dir = unique_temp_dir("disabled");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("server.properties"), "enable-rcon=false\n").unwrap();

        let controller = controller(dir.clone(), Vec::new());
        controller.quiesce().await.expect("quiesce is a no-op");
        controller.resume().await.expect("resume is a no-op");
        assert!(!controller.stop().await.expect("stop"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn start_without_launch_command_fails() {
        let dir = unique_temp_dir("nolaunch");
        std::fs::create_dir_all(&dir).unwrap();
        let err = controller(dir.clone(), Vec::new()).start().await.unwrap_err();
        assert!(matches!(err, ControllerError::Unavailable(_)));
        let _ = std::fs::remove_dir_all(dir);
    }
}
