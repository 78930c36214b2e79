use crate::collectors::host::{run_cmd, CommandError, CommandOutput};
use crate::config::DockerConfig;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

pub const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container engine integration is disabled")]
    Disabled,
    #[error("invalid container name '{0}'")]
    InvalidName(String),
    #[error("no such container: {0}")]
    NotFound(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{cmd} failed: {stderr}")]
    Failed { cmd: String, stderr: String },
    #[error("unexpected docker output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerOp {
    Restart,
    Stop,
    Start,
}

impl ContainerOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Stop => "stop",
            Self::Start => "start",
        }
    }

    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Restart => "restarted",
            Self::Stop => "stopped",
            Self::Start => "started",
        }
    }
}

impl fmt::Display for ContainerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStats {
    pub name: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub mem_used_bytes: u64,
    pub mem_limit_bytes: u64,
    pub net_io: String,
    pub pids: u32,
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemPerc")]
    mem_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

/// Thin wrapper over the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerClient {
    cfg: DockerConfig,
}

impl DockerClient {
    pub fn new(cfg: DockerConfig) -> Self {
        Self { cfg }
    }

    pub fn log_lines(&self) -> u32 {
        self.cfg.log_lines
    }

    async fn docker(&self, args: &[&str]) -> Result<CommandOutput, ContainerError> {
        if !self.cfg.enabled {
            return Err(ContainerError::Disabled);
        }
        debug!(args = %args.join(" "), "running docker");
        Ok(run_cmd(&self.cfg.binary, args, self.cfg.command_timeout_secs).await?)
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>, ContainerError> {
        let mut args = vec!["ps", "--format", "{{json .}}"];
        if all {
            args.insert(1, "-a");
        }
        let output = self.docker(&args).await?;
        ensure_success("docker ps", None, &output)?;
        output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_ps_line)
            .collect()
    }

    pub async fn container_stats(&self) -> Result<Vec<ContainerStats>, ContainerError> {
        let output = self
            .docker(&["stats", "--no-stream", "--format", "{{json .}}"])
            .await?;
        ensure_success("docker stats", None, &output)?;
        output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_stats_line)
            .collect()
    }

    pub async fn logs(&self, name: &str, lines: u32) -> Result<String, ContainerError> {
        validate_container_name(name)?;
        let tail = lines.to_string();
        let output = self
            .docker(&["logs", "--tail", tail.as_str(), "--timestamps", name])
            .await?;
        ensure_success("docker logs", Some(name), &output)?;
        // Containers write to both streams; docker relays them separately.
        let mut text = output.stdout;
        if !output.stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&output.stderr);
        }
        Ok(text)
    }

    pub async fn execute(&self, op: ContainerOp, name: &str) -> Result<(), ContainerError> {
        validate_container_name(name)?;
        let stop_timeout = self.cfg.stop_timeout_secs.to_string();
        let args: Vec<&str> = match op {
            ContainerOp::Restart => vec!["restart", "-t", stop_timeout.as_str(), name],
            ContainerOp::Stop => vec!["stop", "-t", stop_timeout.as_str(), name],
            ContainerOp::Start => vec!["start", name],
        };
        let output = self.docker(&args).await?;
        ensure_success(&format!("docker {op}"), Some(name), &output)?;
        info!(container = name, op = %op, "container action completed");
        Ok(())
    }
}

fn ensure_success(
    cmd: &str,
    name: Option<&str>,
    output: &CommandOutput,
) -> Result<(), ContainerError> {
    if output.success() {
        return Ok(());
    }
    let stderr = output.stderr.trim();
    if let Some(name) = name {
        if stderr.contains("No such container") {
            return Err(ContainerError::NotFound(name.to_string()));
        }
    }
    Err(ContainerError::Failed {
        cmd: cmd.to_string(),
        stderr: stderr.to_string(),
    })
}

pub fn validate_container_name(name: &str) -> Result<(), ContainerError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('-')
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ContainerError::InvalidName(name.to_string()))
    }
}

pub fn parse_ps_line(line: &str) -> Result<ContainerInfo, ContainerError> {
    let raw: PsLine =
        serde_json::from_str(line).map_err(|e| ContainerError::Parse(e.to_string()))?;
    let name = raw
        .names
        .split(',')
        .next()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let state = if raw.state.is_empty() {
        state_from_status(&raw.status).to_string()
    } else {
        raw.state
    };
    Ok(ContainerInfo {
        id: raw.id.chars().take(12).collect(),
        name,
        image: raw.image,
        state,
        status: raw.status,
    })
}

// Older engines omit State from `docker ps`.
fn state_from_status(status: &str) -> &'static str {
    if status.starts_with("Up") {
        "running"
    } else if status.starts_with("Exited") {
        "exited"
    } else if status.starts_with("Created") {
        "created"
    } else {
        "unknown"
    }
}

pub fn parse_stats_line(line: &str) -> Result<ContainerStats, ContainerError> {
    let raw: StatsLine =
        serde_json::from_str(line).map_err(|e| ContainerError::Parse(e.to_string()))?;
    let (used, limit) = raw
        .mem_usage
        .split_once('/')
        .map(|(u, l)| (parse_size(u), parse_size(l)))
        .unwrap_or((None, None));
    Ok(ContainerStats {
        name: raw.name,
        cpu_percent: parse_percent(&raw.cpu_perc)
            .ok_or_else(|| ContainerError::Parse(format!("CPUPerc '{}'", raw.cpu_perc)))?,
        mem_percent: parse_percent(&raw.mem_perc)
            .ok_or_else(|| ContainerError::Parse(format!("MemPerc '{}'", raw.mem_perc)))?,
        mem_used_bytes: used.unwrap_or(0),
        mem_limit_bytes: limit.unwrap_or(0),
        net_io: raw.net_io,
        pids: raw.pids.trim().parse().unwrap_or(0),
    })
}

pub fn parse_percent(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    if trimmed == "--" {
        return Some(0.0);
    }
    trimmed.parse().ok()
}

/// Parses sizes such as `12.5MiB`, `1.2GB` or `512B`.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps_json_line() {
        let line = r#"{"Command":"\"nginx -g…\"","CreatedAt":"2024-05-01 10:00:00 +0000 UTC","ID":"4f2a9c1d8e7b6a5f","Image":"nginx:1.25","Labels":"","LocalVolumes":"0","Mounts":"","Names":"web","Networks":"bridge","Ports":"0.0.0.0:80->80/tcp","RunningFor":"2 days ago","Size":"0B","State":"running","Status":"Up 2 days"}"#;
        let info = parse_ps_line(line).expect("ps line parses");
        assert_eq!(info.id, "4f2a9c1d8e7b");
        assert_eq!(info.name, "web");
        assert_eq!(info.image, "nginx:1.25");
        assert!(info.is_running());
    }

    #[test]
    fn ps_line_without_state_uses_status() {
        let line = r#"{"ID":"abc","Image":"redis","Names":"cache","Status":"Exited (0) 3 hours ago"}"#;
        let info = parse_ps_line(line).expect("ps line parses");
        assert_eq!(info.state, "exited");
    }

    #[test]
    fn parses_stats_json_line() {
        let line = r#"{"BlockIO":"1.2MB / 0B","CPUPerc":"12.34%","Container":"4f2a9c1d8e7b","ID":"4f2a9c1d8e7b","MemPerc":"1.56%","MemUsage":"32MiB / 2GiB","Name":"web","NetIO":"1.5kB / 648B","PIDs":"5"}"#;
        let stats = parse_stats_line(line).expect("stats line parses");
        assert_eq!(stats.name, "web");
        assert_eq!(stats.cpu_percent, 12.34);
        assert_eq!(stats.mem_percent, 1.56);
        assert_eq!(stats.mem_used_bytes, 32 * 1024 * 1024);
        assert_eq!(stats.mem_limit_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(stats.pids, 5);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            parse_ps_line("not json"),
            Err(ContainerError::Parse(_))
        ));
    }

    #[test]
    fn sizes_and_percents() {
        assert_eq!(parse_size("512B"), Some(512));
        assert_eq!(parse_size("1.5kB"), Some(1500));
        assert_eq!(parse_size(" 1GiB "), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("12parsecs"), None);
        assert_eq!(parse_percent("0.00%"), Some(0.0));
        assert_eq!(parse_percent("--"), Some(0.0));
        assert_eq!(parse_percent("abc"), None);
    }

    #[test]
    fn no_such_container_maps_to_not_found() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "Error response from daemon: No such container: ghost\n".to_string(),
            status: 1,
        };
        let err = ensure_success("docker restart", Some("ghost"), &output).expect_err("fails");
        assert!(matches!(err, ContainerError::NotFound(name) if name == "ghost"));
    }

    #[test]
    fn other_failures_keep_stderr() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "permission denied\n".to_string(),
            status: 1,
        };
        let err = ensure_success("docker ps", None, &output).expect_err("fails");
        assert_eq!(err.to_string(), "docker ps failed: permission denied");
    }

    #[test]
    fn container_names_are_validated() {
        assert!(validate_container_name("web-1").is_ok());
        assert!(validate_container_name("my_app.v2").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-rm").is_err());
        assert!(validate_container_name(".hidden").is_err());
        assert!(validate_container_name("web;reboot").is_err());
        assert!(validate_container_name(&"a".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn disabled_client_refuses_commands() {
        let client = DockerClient::new(DockerConfig {
            enabled: false,
            ..DockerConfig::default()
        });
        let err = client.list_containers(true).await.expect_err("disabled");
        assert!(matches!(err, ContainerError::Disabled));
    }
}
