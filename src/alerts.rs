use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Values strictly above this are critical.
pub const CRITICAL_PERCENT: f64 = 95.0;

pub type SharedAlertEngine = Arc<Mutex<AlertEngine>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Cpu,
    Memory,
    Disk,
}

impl AlertKind {
    pub const ALL: [AlertKind; 3] = [AlertKind::Cpu, AlertKind::Memory, AlertKind::Disk];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Memory => "Memory",
            Self::Disk => "Disk",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Cpu => "High CPU Usage",
            Self::Memory => "High Memory Usage",
            Self::Disk => "High Disk Usage",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown alert kind '{0}'")]
pub struct UnknownAlertKind(pub String);

impl FromStr for AlertKind {
    type Err = UnknownAlertKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "memory" | "mem" | "ram" => Ok(Self::Memory),
            "disk" => Ok(Self::Disk),
            other => Err(UnknownAlertKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn from_value(value: f64) -> Self {
        if value > CRITICAL_PERCENT {
            Self::Critical
        } else {
            Self::Warning
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            Self::Warning => "⚠️",
            Self::Critical => "🚨",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertRule {
    pub threshold: f64,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertRules {
    pub cpu: AlertRule,
    pub memory: AlertRule,
    pub disk: AlertRule,
}

impl AlertRules {
    pub fn get(&self, kind: AlertKind) -> AlertRule {
        match kind {
            AlertKind::Cpu => self.cpu,
            AlertKind::Memory => self.memory,
            AlertKind::Disk => self.disk,
        }
    }
}

/// Point-in-time reading handed to [`AlertEngine::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub kind: AlertKind,
    pub value: f64,
    pub captured_at: i64,
    pub detail: Option<String>,
}

impl MetricSample {
    pub fn new(kind: AlertKind, value: f64, captured_at: i64) -> Self {
        Self {
            kind,
            value,
            captured_at,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: u64,
    pub kind: AlertKind,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub title: String,
    pub message: String,
    pub emitted_at: i64,
    pub acknowledged: bool,
}

/// Threshold evaluator with per-kind cooldown and the list of active alerts.
///
/// The cooldown is keyed by kind only: a warning that escalates to critical
/// inside the window stays suppressed. Clearing or acknowledging alerts never
/// resets the cooldown clock.
#[derive(Debug)]
pub struct AlertEngine {
    rules: AlertRules,
    last_emitted_at: HashMap<AlertKind, i64>,
    active: Vec<Alert>,
    next_id: u64,
    max_active: Option<usize>,
}

impl AlertEngine {
    pub fn new(rules: AlertRules) -> Self {
        info!(
            cpu_threshold = rules.cpu.threshold,
            memory_threshold = rules.memory.threshold,
            disk_threshold = rules.disk.threshold,
            "alert engine initialised"
        );
        Self {
            rules,
            last_emitted_at: HashMap::new(),
            active: Vec::new(),
            next_id: 1,
            max_active: None,
        }
    }

    pub fn with_max_active(mut self, max_active: Option<usize>) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn into_shared(self) -> SharedAlertEngine {
        Arc::new(Mutex::new(self))
    }

    pub fn rule(&self, kind: AlertKind) -> AlertRule {
        self.rules.get(kind)
    }

    pub fn evaluate(&mut self, sample: &MetricSample) -> Option<Alert> {
        let rule = self.rules.get(sample.kind);
        // NaN compares false here and never alerts.
        if !(sample.value > rule.threshold) {
            return None;
        }

        let now = sample.captured_at;
        if let Some(last) = self.last_emitted_at.get(&sample.kind) {
            let elapsed = u64::try_from(now.saturating_sub(*last)).unwrap_or(0);
            if elapsed < rule.cooldown_secs {
                debug!(
                    kind = %sample.kind,
                    value = sample.value,
                    last_emitted_at = *last,
                    "alert suppressed by cooldown"
                );
                return None;
            }
        }

        let severity = Severity::from_value(sample.value);
        let mut message = format!("{} usage is at {:.1}%", sample.kind.label(), sample.value);
        if let Some(detail) = &sample.detail {
            message.push(' ');
            message.push_str(detail);
        }

        let alert = Alert {
            id: self.next_id,
            kind: sample.kind,
            severity,
            value: sample.value,
            threshold: rule.threshold,
            title: sample.kind.title().to_string(),
            message,
            emitted_at: now,
            acknowledged: false,
        };
        self.next_id += 1;
        self.last_emitted_at.insert(sample.kind, now);
        self.active.push(alert.clone());
        self.enforce_cap();

        warn!(
            id = alert.id,
            kind = %alert.kind,
            severity = alert.severity.as_str(),
            value = alert.value,
            threshold = alert.threshold,
            "alert emitted"
        );
        Some(alert)
    }

    pub fn acknowledge(&mut self, id: u64) -> Option<Alert> {
        let pos = self.active.iter().position(|a| a.id == id)?;
        let mut alert = self.active.remove(pos);
        alert.acknowledged = true;
        info!(id, kind = %alert.kind, "alert acknowledged");
        Some(alert)
    }

    pub fn clear(&mut self, kind: Option<AlertKind>) -> usize {
        let before = self.active.len();
        match kind {
            Some(kind) => self.active.retain(|a| a.kind != kind),
            None => self.active.clear(),
        }
        let removed = before - self.active.len();
        info!(
            kind = kind.map(AlertKind::as_str).unwrap_or("all"),
            removed, "active alerts cleared"
        );
        removed
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> BTreeMap<Severity, usize> {
        let mut out = BTreeMap::from([(Severity::Warning, 0), (Severity::Critical, 0)]);
        for alert in self.active.iter().filter(|a| !a.acknowledged) {
            *out.entry(alert.severity).or_insert(0) += 1;
        }
        out
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn enforce_cap(&mut self) {
        let Some(cap) = self.max_active else {
            return;
        };
        if self.active.len() > cap {
            let evicted = self.active.len() - cap;
            self.active.drain(..evicted);
            debug!(evicted, cap, "oldest active alerts evicted");
        }
    }
}
