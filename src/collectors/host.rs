use crate::config::HostConfig;
use std::fmt;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command timed out after {timeout_secs}s: {cmd}")]
    Timeout { cmd: String, timeout_secs: u64 },
    #[error("failed to execute command {cmd}: {source}")]
    Io { cmd: String, source: std::io::Error },
    #[error("command {cmd} exited with status {status}: {stderr}")]
    Failed {
        cmd: String,
        status: i32,
        stderr: String,
    },
    #[error("empty command line")]
    Empty,
}

pub async fn run_cmd(
    cmd: &str,
    args: &[&str],
    timeout_secs: u64,
) -> Result<CommandOutput, CommandError> {
    let mut child = Command::new(cmd);
    child.args(args).kill_on_drop(true);

    let output = timeout(Duration::from_secs(timeout_secs), child.output())
        .await
        .map_err(|_| CommandError::Timeout {
            cmd: cmd.to_string(),
            timeout_secs,
        })?
        .map_err(|source| CommandError::Io {
            cmd: cmd.to_string(),
            source,
        })?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        status: output.status.code().unwrap_or(-1),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    Reboot,
    Shutdown,
}

impl PowerOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reboot => "reboot",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for PowerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub active_state: String,
    pub sub_state: String,
}

impl ServiceStatus {
    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }
}

/// systemd queries and power actions on the local host.
#[derive(Debug, Clone)]
pub struct HostControl {
    cfg: HostConfig,
}

impl HostControl {
    pub fn new(cfg: HostConfig) -> Self {
        Self { cfg }
    }

    pub fn power_enabled(&self) -> bool {
        self.cfg.power_actions_enabled
    }

    pub async fn power(&self, op: PowerOp) -> Result<CommandOutput, CommandError> {
        let argv = match op {
            PowerOp::Reboot => &self.cfg.reboot_command,
            PowerOp::Shutdown => &self.cfg.shutdown_command,
        };
        let (program, rest) = argv.split_first().ok_or(CommandError::Empty)?;
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();
        warn!(op = %op, command = %argv.join(" "), "executing power action");
        let output = run_cmd(program, &args, self.cfg.command_timeout_secs).await?;
        if !output.success() {
            return Err(CommandError::Failed {
                cmd: argv.join(" "),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    pub async fn services_status(&self) -> Vec<ServiceStatus> {
        let mut out = Vec::with_capacity(self.cfg.services.len());
        for name in &self.cfg.services {
            out.push(self.service_status(name).await);
        }
        out
    }

    async fn service_status(&self, name: &str) -> ServiceStatus {
        let result = run_cmd(
            "systemctl",
            &["show", name, "-p", "ActiveState", "-p", "SubState"],
            self.cfg.command_timeout_secs,
        )
        .await;
        match result {
            Ok(output) if output.success() => parse_show_output(name, &output.stdout),
            Ok(output) => {
                info!(service = name, status = output.status, "systemctl show failed");
                unknown_status(name)
            }
            Err(err) => {
                warn!(service = name, error = %err, "systemctl is unavailable");
                unknown_status(name)
            }
        }
    }
}

fn unknown_status(name: &str) -> ServiceStatus {
    ServiceStatus {
        name: name.to_string(),
        active_state: "unknown".to_string(),
        sub_state: "unknown".to_string(),
    }
}

/// Parses `KEY=value` lines printed by `systemctl show`.
pub fn parse_show_output(name: &str, stdout: &str) -> ServiceStatus {
    let mut status = unknown_status(name);
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "ActiveState" => status.active_state = value.to_string(),
            "SubState" => status.sub_state = value.to_string(),
            _ => {}
        }
    }
    status
}
