use crate::alerts::{Alert, AlertKind, AlertRule, Severity};
use crate::collectors::docker::{ContainerInfo, ContainerStats};
use crate::collectors::host::ServiceStatus;
use crate::collectors::system::{HostOverview, NetworkStat, ProcessStat, TempStat};
use crate::collectors::{CpuSample, DiskSample, MemorySample};
use crate::monitor::TickReport;
use std::collections::BTreeMap;
use std::fmt::{Display, Write as _};
use std::time::{Duration, UNIX_EPOCH};
use teloxide::utils::html::escape;

pub const ERROR_TEXT_LIMIT: usize = 200;
pub const LOG_TEXT_LIMIT: usize = 3500;
pub const ALERTS_PAGE_LIMIT: usize = 5;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn progress_bar(percent: f64, len: usize) -> String {
    let ratio = (percent / 100.0).clamp(0.0, 1.0);
    let filled = ((ratio * len as f64) as usize).min(len);
    format!("{}{}", "█".repeat(filled), "░".repeat(len - filled))
}

pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} PB")
}

pub fn human_duration(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let mins = (secs % 3600) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if mins > 0 || parts.is_empty() {
        parts.push(format!("{mins}m"));
    }
    parts.join(" ")
}

pub fn format_unix(ts: i64) -> String {
    let time = UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64);
    humantime::format_rfc3339_seconds(time)
        .to_string()
        .replace('T', " ")
        .replace('Z', " UTC")
}

/// Keeps at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Keeps the last `max` characters.
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

pub fn error_reply(err: &dyn Display) -> String {
    format!(
        "❌ <b>Error:</b> {}",
        escape(&truncate_chars(&err.to_string(), ERROR_TEXT_LIMIT))
    )
}

fn level_emoji(percent: f64) -> &'static str {
    if percent > 80.0 {
        "🔥"
    } else if percent > 60.0 {
        "⚠️"
    } else {
        "✅"
    }
}

pub fn welcome_text() -> String {
    "👋 <b>hostwatch</b>\n\nMonitoring this host and sending alerts when CPU, memory or disk usage crosses its threshold.\nPick a section below or send /help.".to_string()
}

pub fn help_text() -> String {
    [
        "<b>Commands</b>",
        "",
        "/status - system overview",
        "/cpu - CPU usage per core",
        "/memory - memory and swap",
        "/disk - mounted disks",
        "/network - network interfaces",
        "/top - top processes by CPU",
        "/temp - temperature sensors",
        "/uptime - uptime and boot time",
        "/services - systemd services",
        "",
        "/alerts - thresholds and active alerts",
        "/check - run the health check now",
        "/ack &lt;id&gt; - acknowledge an alert",
        "/clear [cpu|memory|disk] - clear active alerts",
        "/subscribe, /unsubscribe - alerts in this chat",
        "",
        "/docker - containers",
        "/docker_stats - container resource usage",
        "/docker_logs &lt;name&gt; - recent container logs",
        "/docker_restart, /docker_stop, /docker_start &lt;name&gt;",
        "",
        "/reboot, /shutdown - power actions (confirmation required)",
    ]
    .join("\n")
}

pub fn format_status(
    cpu: &CpuSample,
    memory: &MemorySample,
    disk: &DiskSample,
    host: &HostOverview,
) -> String {
    let mut out = String::from("ℹ️ <b>System Status</b>\n");
    if let Some(name) = &host.host_name {
        let _ = write!(out, "<i>{}</i>\n", escape(name));
    }
    let _ = write!(
        out,
        "\n🖥 <b>CPU:</b> {} {:.1}%\n└ Cores: {}\n",
        level_emoji(cpu.percent),
        cpu.percent,
        cpu.core_count
    );
    let _ = write!(
        out,
        "\n🧠 <b>Memory:</b> {} {:.1}%\n└ {:.1} GB / {:.1} GB\n",
        level_emoji(memory.percent),
        memory.percent,
        memory.used_bytes as f64 / GIB,
        memory.total_bytes as f64 / GIB
    );
    let _ = write!(
        out,
        "\n💾 <b>Disk</b> <code>{}</code>: {} {:.1}%\n└ {:.1} GB / {:.1} GB\n",
        escape(&disk.mount_point),
        level_emoji(disk.percent),
        disk.percent,
        disk.used_bytes as f64 / GIB,
        disk.total_bytes as f64 / GIB
    );
    let _ = write!(out, "\n⏱ <b>Uptime:</b> {}", human_duration(host.uptime_secs));
    out
}

pub fn format_cpu(cpu: &CpuSample) -> String {
    let mut out = format!(
        "🖥 <b>CPU Information</b>\n\n<b>Overall usage:</b> {} {:.1}%\n<b>Cores:</b> {}\n",
        level_emoji(cpu.percent),
        cpu.percent,
        cpu.core_count
    );
    if cpu.frequency_mhz > 0 {
        let _ = writeln!(out, "<b>Frequency:</b> {} MHz", cpu.frequency_mhz);
    }
    let [one, five, fifteen] = cpu.load_avg;
    let _ = writeln!(out, "<b>Load average:</b> {one:.2}, {five:.2}, {fifteen:.2}");
    out.push_str("\n<b>Per core:</b>\n<code>");
    for (idx, usage) in cpu.per_core.iter().enumerate() {
        let _ = writeln!(out, "CPU{idx:<3} {} {usage:>5.1}%", progress_bar(*usage, 10));
    }
    out.push_str("</code>");
    out
}

pub fn format_memory(memory: &MemorySample) -> String {
    let mut out = format!(
        "🧠 <b>Memory Information</b>\n\n<b>Usage:</b> {} {:.1}%\n<code>{}</code>\n\n<b>Total:</b> {}\n<b>Used:</b> {}\n<b>Available:</b> {}\n",
        level_emoji(memory.percent),
        memory.percent,
        progress_bar(memory.percent, 15),
        format_bytes(memory.total_bytes),
        format_bytes(memory.used_bytes),
        format_bytes(memory.available_bytes)
    );
    if memory.swap_total_bytes > 0 {
        let _ = write!(
            out,
            "\n<b>Swap:</b> {:.1}%\n└ {} / {}",
            memory.swap_percent(),
            format_bytes(memory.swap_used_bytes),
            format_bytes(memory.swap_total_bytes)
        );
    }
    out
}

pub fn format_disks(disks: &[DiskSample], alert_mount: &str) -> String {
    if disks.is_empty() {
        return "💾 <b>Disks</b>\n\nNo mounted disks found.".to_string();
    }
    let mut out = String::from("💾 <b>Disks</b>\n");
    for disk in disks {
        let marker = if disk.mount_point == alert_mount {
            " 🔔"
        } else {
            ""
        };
        let _ = write!(
            out,
            "\n<b>{}</b>{marker}\n<code>{}</code> {} {:.1}%\n└ {} used of {}, {} free\n",
            escape(&disk.mount_point),
            progress_bar(disk.percent, 15),
            level_emoji(disk.percent),
            disk.percent,
            format_bytes(disk.used_bytes),
            format_bytes(disk.total_bytes),
            format_bytes(disk.free_bytes)
        );
    }
    out
}

pub fn format_network(ifaces: &[NetworkStat]) -> String {
    if ifaces.is_empty() {
        return "🌐 <b>Network</b>\n\nNo interfaces found.".to_string();
    }
    let mut out = String::from("🌐 <b>Network</b>\n");
    for iface in ifaces {
        let _ = write!(
            out,
            "\n<b>{}</b>\n↓ {} ({} packets)\n↑ {} ({} packets)\n",
            escape(&iface.iface),
            format_bytes(iface.rx_bytes),
            iface.rx_packets,
            format_bytes(iface.tx_bytes),
            iface.tx_packets
        );
        if iface.rx_errors > 0 || iface.tx_errors > 0 {
            let _ = writeln!(out, "⚠️ errors: rx {}, tx {}", iface.rx_errors, iface.tx_errors);
        }
    }
    out
}

pub fn format_top(processes: &[ProcessStat]) -> String {
    let mut out = String::from("⚙️ <b>Top Processes by CPU</b>\n\n");
    for (idx, proc) in processes.iter().enumerate() {
        let _ = write!(
            out,
            "{}. <b>{}</b>\n   CPU: {:.1}% | MEM: {:.0} MB | PID: {}\n",
            idx + 1,
            escape(&truncate_chars(&proc.name, 30)),
            proc.cpu_percent,
            proc.memory_bytes as f64 / (1024.0 * 1024.0),
            proc.pid
        );
    }
    out
}

pub fn format_temperatures(temps: &[TempStat]) -> String {
    if temps.is_empty() {
        return "🌡 <b>Temperatures</b>\n\nNo temperature sensors available on this host.".to_string();
    }
    let mut out = String::from("🌡 <b>Temperatures</b>\n\n");
    for t in temps {
        let marker = match t.critical_celsius {
            Some(crit) if t.celsius >= crit => " 🔥",
            _ if t.celsius >= 80.0 => " ⚠️",
            _ => "",
        };
        let _ = write!(out, "<b>{}</b>: {:.1}°C{marker}", escape(&t.label), t.celsius);
        let mut extras = Vec::new();
        if let Some(max) = t.max_celsius {
            extras.push(format!("max {max:.0}°C"));
        }
        if let Some(crit) = t.critical_celsius {
            extras.push(format!("crit {crit:.0}°C"));
        }
        if !extras.is_empty() {
            let _ = write!(out, " ({})", extras.join(", "));
        }
        out.push('\n');
    }
    out
}

pub fn format_uptime(host: &HostOverview) -> String {
    let mut out = format!(
        "⏱ <b>Uptime</b>\n\n<b>Up:</b> {}\n<b>Booted:</b> {}\n<b>Processes:</b> {}\n",
        human_duration(host.uptime_secs),
        format_unix(host.boot_time_unix as i64),
        host.process_count
    );
    if let Some(os) = &host.os_name {
        let _ = writeln!(out, "<b>OS:</b> {}", escape(os));
    }
    if let Some(kernel) = &host.kernel_version {
        let _ = writeln!(out, "<b>Kernel:</b> {}", escape(kernel));
    }
    if let Some(cpu) = &host.cpu_brand {
        let _ = writeln!(out, "<b>CPU:</b> {}", escape(cpu));
    }
    out
}

pub fn format_services(services: &[ServiceStatus]) -> String {
    if services.is_empty() {
        return "🛠 <b>Services</b>\n\nNo services configured.".to_string();
    }
    let mut out = String::from("🛠 <b>Services</b>\n\n");
    for svc in services {
        let mark = if svc.is_active() {
            "🟢"
        } else if svc.active_state == "unknown" {
            "⚪️"
        } else {
            "🔴"
        };
        let _ = writeln!(
            out,
            "{mark} <b>{}</b>: {} ({})",
            escape(&svc.name),
            escape(&svc.active_state),
            escape(&svc.sub_state)
        );
    }
    out
}

pub fn format_alert(alert: &Alert) -> String {
    format!(
        "{} <b>{}</b> [{}]\n\n{}\nThreshold: {:.1}%\nTime: {}\nID: <code>{}</code>",
        alert.severity.emoji(),
        escape(&alert.title),
        alert.severity.as_str().to_uppercase(),
        escape(&alert.message),
        alert.threshold,
        format_unix(alert.emitted_at),
        alert.id
    )
}

pub fn format_alerts_page(
    rules: &[(AlertKind, AlertRule)],
    summary: &BTreeMap<Severity, usize>,
    active: &[Alert],
    subscribed: bool,
) -> String {
    let mut out = String::from("🔔 <b>Alerts</b>\n\n<b>Thresholds</b>\n");
    for (kind, rule) in rules {
        let _ = writeln!(
            out,
            "• {}: &gt; {:.0}% (cooldown {})",
            kind.label(),
            rule.threshold,
            human_duration(rule.cooldown_secs)
        );
    }
    let warnings = summary.get(&Severity::Warning).copied().unwrap_or(0);
    let critical = summary.get(&Severity::Critical).copied().unwrap_or(0);
    let _ = write!(
        out,
        "\n<b>Active:</b> {} (⚠️ {warnings}, 🚨 {critical})\n",
        active.len()
    );
    for alert in active.iter().rev().take(ALERTS_PAGE_LIMIT) {
        let _ = writeln!(
            out,
            "{} <code>#{}</code> {} {:.1}% at {}",
            alert.severity.emoji(),
            alert.id,
            alert.kind.label(),
            alert.value,
            format_unix(alert.emitted_at)
        );
    }
    if active.len() > ALERTS_PAGE_LIMIT {
        let _ = writeln!(out, "… and {} more", active.len() - ALERTS_PAGE_LIMIT);
    }
    let _ = write!(
        out,
        "\nThis chat is {}subscribed to alerts.",
        if subscribed { "" } else { "not " }
    );
    out
}

pub fn format_tick_report(report: &TickReport) -> String {
    let mut out = String::from("🔍 <b>Health check</b>\n\n");
    for sample in &report.samples {
        let _ = writeln!(
            out,
            "{} {}: {:.1}%",
            level_emoji(sample.value),
            sample.kind.label(),
            sample.value
        );
    }
    for (kind, err) in &report.failed {
        let _ = writeln!(
            out,
            "❌ {}: {}",
            kind.label(),
            escape(&truncate_chars(err, ERROR_TEXT_LIMIT))
        );
    }
    if report.alerts.is_empty() {
        out.push_str("\nNo new alerts.");
    } else {
        let _ = write!(
            out,
            "\n{} new alert(s), delivered {} time(s).",
            report.alerts.len(),
            report.broadcast.delivered
        );
    }
    out
}

pub fn format_containers(containers: &[ContainerInfo]) -> String {
    if containers.is_empty() {
        return "🐳 <b>Containers</b>\n\nNo containers found.".to_string();
    }
    let running = containers.iter().filter(|c| c.is_running()).count();
    let mut out = format!(
        "🐳 <b>Containers</b> ({running}/{} running)\n\n",
        containers.len()
    );
    for c in containers {
        let mark = if c.is_running() { "🟢" } else { "🔴" };
        let _ = writeln!(
            out,
            "{mark} <b>{}</b> <code>{}</code>\n   {} | {}",
            escape(&c.name),
            escape(&c.id),
            escape(&c.image),
            escape(&c.status)
        );
    }
    out
}

pub fn format_container_stats(stats: &[ContainerStats]) -> String {
    if stats.is_empty() {
        return "📊 <b>Container stats</b>\n\nNo running containers.".to_string();
    }
    let mut out = String::from("📊 <b>Container stats</b>\n\n");
    for s in stats {
        let _ = writeln!(
            out,
            "<b>{}</b>\n   CPU: {:.1}% | MEM: {:.1}% ({} / {}) | PIDs: {}\n   NET: {}",
            escape(&s.name),
            s.cpu_percent,
            s.mem_percent,
            format_bytes(s.mem_used_bytes),
            format_bytes(s.mem_limit_bytes),
            s.pids,
            escape(&s.net_io)
        );
    }
    out
}

pub fn format_logs(name: &str, logs: &str) -> String {
    let trimmed = logs.trim_end();
    if trimmed.is_empty() {
        return format!("📜 <b>{}</b>\n\nNo log output.", escape(name));
    }
    format!(
        "📜 <b>Logs: {}</b>\n\n<pre>{}</pre>",
        escape(name),
        escape(tail_chars(trimmed, LOG_TEXT_LIMIT))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(id: u64, severity: Severity) -> Alert {
        Alert {
            id,
            kind: AlertKind::Memory,
            severity,
            value: 97.0,
            threshold: 80.0,
            title: "High Memory Usage".to_string(),
            message: "Memory usage is at 97.0% (7.8 GB / 8.0 GB)".to_string(),
            emitted_at: 0,
            acknowledged: false,
        }
    }

    #[test]
    fn progress_bar_clamps_and_fills() {
        assert_eq!(progress_bar(50.0, 10), "█████░░░░░");
        assert_eq!(progress_bar(150.0, 4), "████");
        assert_eq!(progress_bar(-3.0, 4), "░░░░");
    }

    #[test]
    fn bytes_and_durations_are_human_readable() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(human_duration(0), "0m");
        assert_eq!(human_duration(3600), "1h");
        assert_eq!(human_duration(2 * 86_400 + 5 * 3600 + 30 * 60), "2d 5h 30m");
    }

    #[test]
    fn unix_times_render_in_utc() {
        assert_eq!(format_unix(0), "1970-01-01 00:00:00 UTC");
    }

    #[test]
    fn error_reply_is_escaped_and_truncated() {
        let long = format!("<boom> {}", "x".repeat(500));
        let text = error_reply(&long);
        assert!(text.contains("&lt;boom&gt;"));
        assert!(text.ends_with('…'));
        assert!(text.chars().count() < 260);
    }

    #[test]
    fn tail_keeps_last_characters() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }

    #[test]
    fn logs_are_tail_truncated_and_escaped() {
        let logs = format!("{}<tag>", "a".repeat(5000));
        let text = format_logs("web", &logs);
        assert!(text.contains("&lt;tag&gt;"));
        assert!(text.len() < 3700);
    }

    #[test]
    fn alert_message_contains_severity_and_id() {
        let text = format_alert(&alert(12, Severity::Critical));
        assert!(text.contains("🚨 <b>High Memory Usage</b> [CRITICAL]"));
        assert!(text.contains("<code>12</code>"));
    }

    #[test]
    fn alerts_page_lists_at_most_five_newest() {
        let active: Vec<Alert> = (1..=7).map(|id| alert(id, Severity::Warning)).collect();
        let summary = BTreeMap::from([(Severity::Warning, 7), (Severity::Critical, 0)]);
        let rules = [(
            AlertKind::Cpu,
            AlertRule {
                threshold: 80.0,
                cooldown_secs: 600,
            },
        )];
        let text = format_alerts_page(&rules, &summary, &active, true);
        assert!(text.contains("CPU: &gt; 80% (cooldown 10m)"));
        assert!(text.contains("#7"));
        assert!(!text.contains("<code>#2</code>"));
        assert!(text.contains("… and 2 more"));
        assert!(text.contains("is subscribed"));
    }
}
