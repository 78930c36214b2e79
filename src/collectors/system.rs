use crate::collectors::{percent_of, CpuSample, DiskSample, MemorySample, MetricsSource, SampleError};
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use sysinfo::{
    ComponentExt, CpuExt, CpuRefreshKind, DiskExt, NetworkExt, NetworksExt, PidExt, ProcessExt,
    ProcessRefreshKind, System, SystemExt,
};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HostOverview {
    pub host_name: Option<String>,
    pub os_name: Option<String>,
    pub kernel_version: Option<String>,
    pub cpu_brand: Option<String>,
    pub uptime_secs: u64,
    pub boot_time_unix: u64,
    pub process_count: usize,
}

#[derive(Debug, Clone)]
pub struct NetworkStat {
    pub iface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessStat {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TempStat {
    pub label: String,
    pub celsius: f64,
    pub max_celsius: Option<f64>,
    pub critical_celsius: Option<f64>,
}

/// `sysinfo`-backed metrics source. One `System` handle is shared behind a
/// std mutex; every method is meant to run on the blocking pool.
pub struct SysinfoSource {
    system: Mutex<System>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks_list();
        Self {
            system: Mutex::new(system),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, System>, SampleError> {
        self.system.lock().map_err(|_| SampleError::Poisoned)
    }

    pub fn host_overview(&self) -> Result<HostOverview, SampleError> {
        let mut system = self.lock()?;
        system.refresh_processes_specifics(ProcessRefreshKind::new());
        Ok(HostOverview {
            host_name: system.host_name(),
            os_name: system.long_os_version().or_else(|| system.name()),
            kernel_version: system.kernel_version(),
            cpu_brand: system
                .cpus()
                .first()
                .map(|c| c.brand().trim().to_string())
                .filter(|b| !b.is_empty()),
            uptime_secs: system.uptime(),
            boot_time_unix: system.boot_time(),
            process_count: system.processes().len(),
        })
    }

    pub fn disks(&self) -> Result<Vec<DiskSample>, SampleError> {
        let mut system = self.lock()?;
        system.refresh_disks_list();
        system.refresh_disks();
        let mut out: Vec<DiskSample> = system
            .disks()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(disk_sample)
            .collect();
        out.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
        out.dedup_by(|a, b| a.mount_point == b.mount_point);
        Ok(out)
    }

    pub fn networks(&self) -> Result<Vec<NetworkStat>, SampleError> {
        let mut system = self.lock()?;
        system.refresh_networks_list();
        system.refresh_networks();
        let mut out: Vec<NetworkStat> = system
            .networks()
            .iter()
            .filter(|(iface, _)| iface.as_str() != "lo")
            .map(|(iface, data)| NetworkStat {
                iface: iface.to_string(),
                rx_bytes: data.total_received(),
                tx_bytes: data.total_transmitted(),
                rx_packets: data.total_packets_received(),
                tx_packets: data.total_packets_transmitted(),
                rx_errors: data.total_errors_on_received(),
                tx_errors: data.total_errors_on_transmitted(),
            })
            .collect();
        out.sort_by(|a, b| a.iface.cmp(&b.iface));
        Ok(out)
    }

    /// Process CPU usage needs two refreshes with a gap in between.
    pub fn top_processes(
        &self,
        limit: usize,
        settle: Duration,
    ) -> Result<Vec<ProcessStat>, SampleError> {
        {
            let mut system = self.lock()?;
            system.refresh_processes_specifics(ProcessRefreshKind::new().with_cpu());
        }
        std::thread::sleep(settle.max(System::MINIMUM_CPU_UPDATE_INTERVAL));

        let mut system = self.lock()?;
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_cpu());
        system.refresh_memory();
        let processes = system
            .processes()
            .values()
            .map(|p| ProcessStat {
                pid: p.pid().as_u32(),
                name: p.name().to_string(),
                cpu_percent: p.cpu_usage() as f64,
                memory_bytes: p.memory(),
            })
            .collect();
        Ok(rank_processes(processes, limit))
    }

    pub fn temperatures(&self) -> Result<Vec<TempStat>, SampleError> {
        let mut system = self.lock()?;
        system.refresh_components_list();
        system.refresh_components();
        let mut temps: Vec<TempStat> = system
            .components()
            .iter()
            .filter(|c| c.temperature() > 0.0)
            .map(|c| TempStat {
                label: c.label().to_string(),
                celsius: c.temperature() as f64,
                max_celsius: Some(c.max() as f64).filter(|v| *v > 0.0),
                critical_celsius: c.critical().map(|v| v as f64),
            })
            .collect();
        if temps.is_empty() {
            temps = thermal_zone_temps();
        }
        debug!(sensors = temps.len(), "temperature sensors read");
        Ok(temps)
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn sample_cpu(&self, settle: Duration) -> Result<CpuSample, SampleError> {
        {
            let mut system = self.lock()?;
            system.refresh_cpu_specifics(CpuRefreshKind::new().with_cpu_usage());
        }
        std::thread::sleep(settle.max(System::MINIMUM_CPU_UPDATE_INTERVAL));

        let mut system = self.lock()?;
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        let cpus = system.cpus();
        if cpus.is_empty() {
            return Err(SampleError::NoCpuData);
        }
        let per_core: Vec<f64> = cpus.iter().map(|c| c.cpu_usage() as f64).collect();
        let percent = per_core.iter().sum::<f64>() / per_core.len() as f64;
        let frequency_mhz = cpus.iter().map(|c| c.frequency()).max().unwrap_or(0);
        let load = system.load_average();

        Ok(CpuSample {
            percent,
            core_count: per_core.len(),
            per_core,
            frequency_mhz,
            load_avg: [load.one, load.five, load.fifteen],
        })
    }

    fn sample_memory(&self) -> Result<MemorySample, SampleError> {
        let mut system = self.lock()?;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(SampleError::NoMemoryData);
        }
        let used = system.used_memory();
        Ok(MemorySample {
            total_bytes: total,
            used_bytes: used,
            available_bytes: system.available_memory(),
            percent: percent_of(used, total),
            swap_total_bytes: system.total_swap(),
            swap_used_bytes: system.used_swap(),
        })
    }

    fn sample_disk(&self, mount_point: &str) -> Result<DiskSample, SampleError> {
        let mut system = self.lock()?;
        system.refresh_disks_list();
        system.refresh_disks();
        let samples: Vec<DiskSample> = system.disks().iter().map(disk_sample).collect();
        select_mount(&samples, mount_point)
            .ok_or_else(|| SampleError::MountNotFound(mount_point.to_string()))
    }
}

fn disk_sample(disk: &sysinfo::Disk) -> DiskSample {
    let total = disk.total_space();
    let free = disk.available_space();
    let used = total.saturating_sub(free);
    DiskSample {
        mount_point: disk.mount_point().to_string_lossy().to_string(),
        total_bytes: total,
        used_bytes: used,
        free_bytes: free,
        percent: percent_of(used, total),
    }
}

fn select_mount(samples: &[DiskSample], mount_point: &str) -> Option<DiskSample> {
    let wanted = normalize_mount(mount_point);
    samples
        .iter()
        .find(|d| normalize_mount(&d.mount_point) == wanted)
        .cloned()
}

fn normalize_mount(mount: &str) -> &str {
    let trimmed = mount.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn rank_processes(mut processes: Vec<ProcessStat>, limit: usize) -> Vec<ProcessStat> {
    processes.sort_by(|a, b| {
        b.cpu_percent
            .total_cmp(&a.cpu_percent)
            .then_with(|| b.memory_bytes.cmp(&a.memory_bytes))
    });
    processes.truncate(limit);
    processes
}

/// Kernel thermal zones report millidegrees; some drivers report whole degrees.
fn thermal_zone_celsius(raw: &str) -> Option<f64> {
    let v = raw.trim().parse::<f64>().ok()?;
    let celsius = if v > 1000.0 { v / 1000.0 } else { v };
    (celsius > 0.0).then_some(celsius)
}

#[cfg(target_os = "linux")]
fn thermal_zone_temps() -> Vec<TempStat> {
    let Ok(entries) = fs::read_dir("/sys/class/thermal") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with("thermal_zone") {
            continue;
        }
        let Some(celsius) = fs::read_to_string(path.join("temp"))
            .ok()
            .and_then(|raw| thermal_zone_celsius(&raw))
        else {
            continue;
        };
        let label = fs::read_to_string(path.join("type"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| name.to_string());
        out.push(TempStat {
            label,
            celsius,
            max_celsius: None,
            critical_celsius: None,
        });
    }
    out.sort_by(|a, b| a.label.cmp(&b.label));
    out
}

#[cfg(not(target_os = "linux"))]
fn thermal_zone_temps() -> Vec<TempStat> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(mount: &str, used: u64) -> DiskSample {
        DiskSample {
            mount_point: mount.to_string(),
            total_bytes: 100,
            used_bytes: used,
            free_bytes: 100 - used,
            percent: used as f64,
        }
    }

    #[test]
    fn select_mount_matches_exact_and_trailing_slash() {
        let disks = vec![disk("/", 40), disk("/data", 70)];
        assert_eq!(select_mount(&disks, "/").map(|d| d.used_bytes), Some(40));
        assert_eq!(select_mount(&disks, "/data/").map(|d| d.used_bytes), Some(70));
        assert!(select_mount(&disks, "/srv").is_none());
    }

    #[test]
    fn rank_processes_orders_by_cpu_then_memory() {
        let procs = vec![
            ProcessStat {
                pid: 1,
                name: "a".to_string(),
                cpu_percent: 1.0,
                memory_bytes: 10,
            },
            ProcessStat {
                pid: 2,
                name: "b".to_string(),
                cpu_percent: 50.0,
                memory_bytes: 10,
            },
            ProcessStat {
                pid: 3,
                name: "c".to_string(),
                cpu_percent: 1.0,
                memory_bytes: 99,
            },
        ];
        let ranked: Vec<u32> = rank_processes(procs, 2).iter().map(|p| p.pid).collect();
        assert_eq!(ranked, vec![2, 3]);
    }

    #[test]
    fn thermal_zone_values_are_normalized() {
        assert_eq!(thermal_zone_celsius("45000\n"), Some(45.0));
        assert_eq!(thermal_zone_celsius("52"), Some(52.0));
        assert_eq!(thermal_zone_celsius("0"), None);
        assert_eq!(thermal_zone_celsius("n/a"), None);
    }

    #[test]
    fn memory_sample_is_consistent() {
        let source = SysinfoSource::new();
        let memory = source.sample_memory().expect("memory is readable");
        assert!(memory.total_bytes > 0);
        assert!(memory.used_bytes <= memory.total_bytes);
        assert!((0.0..=100.0).contains(&memory.percent));
    }

    #[test]
    fn unknown_mount_is_reported() {
        let source = SysinfoSource::new();
        let err = source
            .sample_disk("/definitely/not/a/mount")
            .expect_err("mount is missing");
        assert!(matches!(err, SampleError::MountNotFound(_)));
    }
}
