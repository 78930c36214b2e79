pub mod docker;
pub mod host;
pub mod system;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct CpuSample {
    pub percent: f64,
    pub per_core: Vec<f64>,
    pub frequency_mhz: u64,
    pub core_count: usize,
    pub load_avg: [f64; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemorySample {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub percent: f64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

impl MemorySample {
    pub fn swap_percent(&self) -> f64 {
        percent_of(self.swap_used_bytes, self.swap_total_bytes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskSample {
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub percent: f64,
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("mount point {0} not found")]
    MountNotFound(String),
    #[error("no CPU data available")]
    NoCpuData,
    #[error("memory totals are unavailable")]
    NoMemoryData,
    #[error("system handle lock poisoned")]
    Poisoned,
    #[error("sampling task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Point-in-time CPU, memory and disk readings. Calls may block for the CPU
/// settle window, so async callers go through [`blocking`].
pub trait MetricsSource: Send + Sync + 'static {
    fn sample_cpu(&self, settle: Duration) -> Result<CpuSample, SampleError>;
    fn sample_memory(&self) -> Result<MemorySample, SampleError>;
    fn sample_disk(&self, mount_point: &str) -> Result<DiskSample, SampleError>;
}

/// Runs a synchronous sampling call on the blocking pool.
pub async fn blocking<S, T, F>(source: Arc<S>, f: F) -> Result<T, SampleError>
where
    S: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, SampleError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&source)).await?
}

pub fn percent_of(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;

    impl MetricsSource for FixedSource {
        fn sample_cpu(&self, _settle: Duration) -> Result<CpuSample, SampleError> {
            Err(SampleError::NoCpuData)
        }

        fn sample_memory(&self) -> Result<MemorySample, SampleError> {
            Ok(MemorySample {
                total_bytes: 200,
                used_bytes: 50,
                available_bytes: 150,
                percent: 25.0,
                swap_total_bytes: 0,
                swap_used_bytes: 0,
            })
        }

        fn sample_disk(&self, mount_point: &str) -> Result<DiskSample, SampleError> {
            Err(SampleError::MountNotFound(mount_point.to_string()))
        }
    }

    #[test]
    fn percent_of_handles_zero_total() {
        assert_eq!(percent_of(10, 0), 0.0);
        assert_eq!(percent_of(25, 100), 25.0);
    }

    #[tokio::test]
    async fn blocking_bridge_returns_value_and_error() {
        let source: Arc<dyn MetricsSource> = Arc::new(FixedSource);
        let memory = blocking(source.clone(), |s| s.sample_memory())
            .await
            .expect("memory sample");
        assert_eq!(memory.percent, 25.0);
        assert_eq!(memory.swap_percent(), 0.0);

        let err = blocking(source, |s| s.sample_disk("/data"))
            .await
            .expect_err("missing mount");
        assert!(matches!(err, SampleError::MountNotFound(m) if m == "/data"));
    }
}
