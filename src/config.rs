use crate::alerts::{AlertKind, AlertRule, AlertRules};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const MIN_INTERVAL_SECS: u64 = 60;
pub const MIN_COOLDOWN_SECS: u64 = 60;
pub const MAX_COOLDOWN_SECS: u64 = 30 * 24 * 3600;
pub const MAX_RATE_LIMIT_PERIOD_SECS: u64 = 24 * 3600;
pub const MAX_CONFIRMATION_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub charts: ChartsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub allowed_user_ids: Vec<u64>,
    #[serde(default)]
    pub extra_alert_chat_ids: Vec<i64>,
    #[serde(default = "default_rate_limit_calls")]
    pub rate_limit_calls: u32,
    #[serde(default = "default_rate_limit_period_secs")]
    pub rate_limit_period_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertsConfig {
    #[serde(default = "default_cpu_rule")]
    pub cpu: RuleConfig,
    #[serde(default = "default_memory_rule")]
    pub memory: RuleConfig,
    #[serde(default = "default_disk_rule")]
    pub disk: RuleConfig,
    #[serde(default = "default_disk_mount")]
    pub disk_mount: String,
    #[serde(default = "default_cpu_settle_ms")]
    pub cpu_settle_ms: u64,
    #[serde(default)]
    pub max_active_alerts: Option<usize>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RuleConfig {
    pub threshold_percent: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_docker_binary")]
    pub binary: String,
    #[serde(default = "default_docker_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_docker_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_log_lines")]
    pub log_lines: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default)]
    pub power_actions_enabled: bool,
    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: Vec<String>,
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    #[serde(default = "default_confirmation_ttl_secs")]
    pub confirmation_ttl_secs: u64,
    #[serde(default = "default_host_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ChartsConfig {
    #[serde(default = "default_chart_width")]
    pub width: u32,
    #[serde(default = "default_chart_height")]
    pub height: u32,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu_rule(),
            memory: default_memory_rule(),
            disk: default_disk_rule(),
            disk_mount: default_disk_mount(),
            cpu_settle_ms: default_cpu_settle_ms(),
            max_active_alerts: None,
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_docker_binary(),
            command_timeout_secs: default_docker_command_timeout_secs(),
            stop_timeout_secs: default_docker_stop_timeout_secs(),
            log_lines: default_log_lines(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            power_actions_enabled: false,
            reboot_command: default_reboot_command(),
            shutdown_command: default_shutdown_command(),
            services: default_services(),
            confirmation_ttl_secs: default_confirmation_ttl_secs(),
            command_timeout_secs: default_host_command_timeout_secs(),
        }
    }
}

impl Default for ChartsConfig {
    fn default() -> Self {
        Self {
            width: default_chart_width(),
            height: default_chart_height(),
        }
    }
}

impl AlertsConfig {
    pub fn rules(&self) -> AlertRules {
        AlertRules {
            cpu: self.cpu.to_rule(),
            memory: self.memory.to_rule(),
            disk: self.disk.to_rule(),
        }
    }

    pub fn cpu_settle(&self) -> Duration {
        Duration::from_millis(self.cpu_settle_ms)
    }

    fn rule_config(&self, kind: AlertKind) -> &RuleConfig {
        match kind {
            AlertKind::Cpu => &self.cpu,
            AlertKind::Memory => &self.memory,
            AlertKind::Disk => &self.disk,
        }
    }
}

impl RuleConfig {
    fn to_rule(self) -> AlertRule {
        AlertRule {
            threshold: self.threshold_percent,
            cooldown_secs: self.cooldown_secs,
        }
    }
}

impl TelegramConfig {
    /// Chats that receive alerts at startup: every allowed user's private chat
    /// plus the extra alert chats, without duplicates.
    pub fn initial_recipients(&self) -> Vec<i64> {
        let mut seen = HashSet::new();
        self.allowed_user_ids
            .iter()
            .map(|id| *id as i64)
            .chain(self.extra_alert_chat_ids.iter().copied())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.interval_secs < MIN_INTERVAL_SECS {
            return Err(ConfigError::Validation(format!(
                "interval_secs must be >= {MIN_INTERVAL_SECS}"
            )));
        }

        validate_telegram(&self.telegram)?;
        validate_alerts(&self.alerts)?;
        validate_docker(&self.docker)?;
        validate_host(&self.host)?;
        validate_charts(&self.charts)?;

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_telegram(cfg: &TelegramConfig) -> Result<(), ConfigError> {
    if cfg.bot_token_env.trim().is_empty() {
        return Err(ConfigError::Validation(
            "telegram.bot_token_env must not be empty".to_string(),
        ));
    }
    if cfg.rate_limit_calls < 1 {
        return Err(ConfigError::Validation(
            "telegram.rate_limit_calls must be >= 1".to_string(),
        ));
    }
    if !(1..=MAX_RATE_LIMIT_PERIOD_SECS).contains(&cfg.rate_limit_period_secs) {
        return Err(ConfigError::Validation(format!(
            "telegram.rate_limit_period_secs must be within 1..{MAX_RATE_LIMIT_PERIOD_SECS}"
        )));
    }
    Ok(())
}

fn validate_alerts(cfg: &AlertsConfig) -> Result<(), ConfigError> {
    for kind in AlertKind::ALL {
        let rule = cfg.rule_config(kind);
        let threshold = rule.threshold_percent;
        if !threshold.is_finite() || !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::Validation(format!(
                "alerts.{}.threshold_percent must be within 0..100",
                kind.as_str()
            )));
        }
        if !(MIN_COOLDOWN_SECS..=MAX_COOLDOWN_SECS).contains(&rule.cooldown_secs) {
            return Err(ConfigError::Validation(format!(
                "alerts.{}.cooldown_secs must be within {MIN_COOLDOWN_SECS}..{MAX_COOLDOWN_SECS}",
                kind.as_str()
            )));
        }
    }
    if cfg.disk_mount.trim().is_empty() {
        return Err(ConfigError::Validation(
            "alerts.disk_mount must not be empty".to_string(),
        ));
    }
    if !(100..=5000).contains(&cfg.cpu_settle_ms) {
        return Err(ConfigError::Validation(
            "alerts.cpu_settle_ms must be within 100..5000".to_string(),
        ));
    }
    if cfg.max_active_alerts == Some(0) {
        return Err(ConfigError::Validation(
            "alerts.max_active_alerts must be >= 1 when set".to_string(),
        ));
    }
    Ok(())
}

fn validate_docker(cfg: &DockerConfig) -> Result<(), ConfigError> {
    if cfg.binary.trim().is_empty() {
        return Err(ConfigError::Validation(
            "docker.binary must not be empty".to_string(),
        ));
    }
    if cfg.command_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "docker.command_timeout_secs must be > 0".to_string(),
        ));
    }
    if cfg.stop_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "docker.stop_timeout_secs must be > 0".to_string(),
        ));
    }
    if !(1..=1000).contains(&cfg.log_lines) {
        return Err(ConfigError::Validation(
            "docker.log_lines must be within 1..1000".to_string(),
        ));
    }
    Ok(())
}

fn validate_host(cfg: &HostConfig) -> Result<(), ConfigError> {
    if cfg.reboot_command.is_empty() || cfg.reboot_command[0].trim().is_empty() {
        return Err(ConfigError::Validation(
            "host.reboot_command must not be empty".to_string(),
        ));
    }
    if cfg.shutdown_command.is_empty() || cfg.shutdown_command[0].trim().is_empty() {
        return Err(ConfigError::Validation(
            "host.shutdown_command must not be empty".to_string(),
        ));
    }
    let mut names = HashSet::new();
    for service in &cfg.services {
        if service.trim().is_empty() {
            return Err(ConfigError::Validation(
                "host.services[*] must not be empty".to_string(),
            ));
        }
        if !names.insert(service.as_str()) {
            return Err(ConfigError::Validation(format!(
                "host.services entry '{service}' is duplicated"
            )));
        }
    }
    if !(1..=MAX_CONFIRMATION_TTL_SECS).contains(&cfg.confirmation_ttl_secs) {
        return Err(ConfigError::Validation(format!(
            "host.confirmation_ttl_secs must be within 1..{MAX_CONFIRMATION_TTL_SECS}"
        )));
    }
    if cfg.command_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "host.command_timeout_secs must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_charts(cfg: &ChartsConfig) -> Result<(), ConfigError> {
    if !(320..=4000).contains(&cfg.width) {
        return Err(ConfigError::Validation(
            "charts.width must be within 320..4000".to_string(),
        ));
    }
    if !(240..=3000).contains(&cfg.height) {
        return Err(ConfigError::Validation(
            "charts.height must be within 240..3000".to_string(),
        ));
    }
    Ok(())
}

const fn default_interval_secs() -> u64 {
    300
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

const fn default_rate_limit_calls() -> u32 {
    10
}

const fn default_rate_limit_period_secs() -> u64 {
    60
}

const fn default_cooldown_secs() -> u64 {
    600
}

const fn default_cpu_rule() -> RuleConfig {
    RuleConfig {
        threshold_percent: 80.0,
        cooldown_secs: default_cooldown_secs(),
    }
}

const fn default_memory_rule() -> RuleConfig {
    RuleConfig {
        threshold_percent: 80.0,
        cooldown_secs: default_cooldown_secs(),
    }
}

const fn default_disk_rule() -> RuleConfig {
    RuleConfig {
        threshold_percent: 90.0,
        cooldown_secs: default_cooldown_secs(),
    }
}

fn default_disk_mount() -> String {
    "/".to_string()
}

const fn default_cpu_settle_ms() -> u64 {
    500
}

const fn default_true() -> bool {
    true
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

const fn default_docker_command_timeout_secs() -> u64 {
    20
}

const fn default_docker_stop_timeout_secs() -> u64 {
    10
}

const fn default_log_lines() -> u32 {
    50
}

fn default_reboot_command() -> Vec<String> {
    vec!["systemctl".to_string(), "reboot".to_string()]
}

fn default_shutdown_command() -> Vec<String> {
    vec!["systemctl".to_string(), "poweroff".to_string()]
}

fn default_services() -> Vec<String> {
    ["ssh", "cron", "docker"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

const fn default_confirmation_ttl_secs() -> u64 {
    120
}

const fn default_host_command_timeout_secs() -> u64 {
    10
}

const fn default_chart_width() -> u32 {
    1000
}

const fn default_chart_height() -> u32 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:9108".to_string(),
            interval_secs: 300,
            telegram: TelegramConfig {
                bot_token_env: "TEST_TOKEN_ENV".to_string(),
                bot_token: None,
                allowed_user_ids: vec![42],
                extra_alert_chat_ids: vec![],
                rate_limit_calls: 10,
                rate_limit_period_secs: 60,
            },
            alerts: AlertsConfig::default(),
            docker: DockerConfig::default(),
            host: HostConfig::default(),
            charts: ChartsConfig::default(),
        }
    }

    #[test]
    fn defaults_pass_validation() {
        valid_config().validate().expect("defaults must be valid");
    }

    #[test]
    fn bundled_example_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example validates");
        assert_eq!(cfg.interval_secs, 300);
        assert_eq!(cfg.alerts.disk.threshold_percent, 90.0);
        assert_eq!(cfg.alerts.max_active_alerts, None);
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let text = "listen: \"0.0.0.0:9108\"\ntelegram:\n  allowed_user_ids: [1, 2]\n";
        let cfg: Config = serde_yaml::from_str(text).expect("minimal config parses");
        cfg.validate().expect("minimal config validates");
        assert_eq!(cfg.interval_secs, 300);
        assert_eq!(cfg.telegram.bot_token_env, "TELEGRAM_BOT_TOKEN");
        assert_eq!(cfg.alerts.cpu.cooldown_secs, 600);
        assert_eq!(cfg.alerts.disk_mount, "/");
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let mut cfg = valid_config();
        cfg.alerts.cpu.threshold_percent = 101.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = valid_config();
        cfg.alerts.memory.threshold_percent = f64::NAN;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn zero_cooldown_is_rejected() {
        let mut cfg = valid_config();
        cfg.alerts.disk.cooldown_secs = 0;
        let err = cfg.validate().expect_err("cooldown 0 must fail");
        assert!(err.to_string().contains("alerts.disk.cooldown_secs"));
    }

    #[test]
    fn oversized_windows_are_rejected() {
        let mut cfg = valid_config();
        cfg.alerts.cpu.cooldown_secs = u64::MAX;
        let err = cfg.validate().expect_err("huge cooldown must fail");
        assert!(err.to_string().contains("alerts.cpu.cooldown_secs"));

        let mut cfg = valid_config();
        cfg.telegram.rate_limit_period_secs = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.host.confirmation_ttl_secs = MAX_CONFIRMATION_TTL_SECS + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.alerts.disk.cooldown_secs = MAX_COOLDOWN_SECS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn short_interval_is_rejected() {
        let mut cfg = valid_config();
        cfg.interval_secs = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_listen_is_rejected() {
        let mut cfg = valid_config();
        cfg.listen = "not-an-address".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_active_cap_is_rejected() {
        let mut cfg = valid_config();
        cfg.alerts.max_active_alerts = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn initial_recipients_merge_without_duplicates() {
        let mut cfg = valid_config();
        cfg.telegram.allowed_user_ids = vec![1, 2];
        cfg.telegram.extra_alert_chat_ids = vec![-100, 2];
        assert_eq!(cfg.telegram.initial_recipients(), vec![1, 2, -100]);
    }
}
