use crate::alerts::{Alert, AlertKind, MetricSample, SharedAlertEngine};
use crate::collectors::{blocking, MetricsSource, SampleError};
use crate::metrics::{now_unix, Metrics};
use crate::notifier::{AlertSink, BroadcastReport, Notifier};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub cpu_settle: Duration,
    pub disk_mount: String,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub samples: Vec<MetricSample>,
    pub failed: Vec<(AlertKind, String)>,
    pub alerts: Vec<Alert>,
    pub broadcast: BroadcastReport,
}

struct RunningTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic sample → evaluate → broadcast cycle.
pub struct HealthMonitor<S> {
    source: Arc<dyn MetricsSource>,
    engine: SharedAlertEngine,
    notifier: Arc<Notifier<S>>,
    metrics: Option<Arc<Metrics>>,
    settings: MonitorSettings,
    running: Mutex<Option<RunningTask>>,
}

impl<S: AlertSink> HealthMonitor<S> {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        engine: SharedAlertEngine,
        notifier: Arc<Notifier<S>>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            source,
            engine,
            notifier,
            metrics: None,
            settings,
            running: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn engine(&self) -> &SharedAlertEngine {
        &self.engine
    }

    pub fn notifier(&self) -> &Arc<Notifier<S>> {
        &self.notifier
    }

    /// Starts the schedule; the first tick fires one full `period` from now.
    /// Returns `false` when the monitor is already running.
    pub async fn start(self: &Arc<Self>, period: Duration) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("health monitor already running, start ignored");
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                // A pending stop wins over a tick that came due meanwhile.
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let report = monitor.tick_at(now_unix()).await;
                        info!(
                            samples = report.samples.len(),
                            failed = report.failed.len(),
                            alerts = report.alerts.len(),
                            delivered = report.broadcast.delivered,
                            "health check completed"
                        );
                    }
                }
            }
        });

        *running = Some(RunningTask { stop_tx, handle });
        info!(interval_secs = period.as_secs(), "health monitor started");
        true
    }

    /// Stops future ticks and waits for an in-flight tick to finish.
    pub async fn stop(&self) {
        let Some(task) = self.running.lock().await.take() else {
            return;
        };
        let _ = task.stop_tx.send(true);
        if let Err(err) = task.handle.await {
            error!(error = %err, "health monitor task ended abnormally");
        }
        info!("health monitor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn evaluate_once(&self) -> TickReport {
        self.tick_at(now_unix()).await
    }

    /// One cycle at the given unix time. Each metric is sampled and evaluated
    /// on its own; a failing metric is logged and skipped for this tick.
    pub async fn tick_at(&self, now: i64) -> TickReport {
        let mut report = TickReport::default();

        for kind in AlertKind::ALL {
            match self.sample(kind, now).await {
                Ok(sample) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.set_metric_percent(kind.as_str(), sample.value);
                    }
                    report.samples.push(sample);
                }
                Err(err) => {
                    warn!(kind = %kind, error = %err, "metric sampling failed, skipped this tick");
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_sample_error(kind.as_str());
                    }
                    report.failed.push((kind, err.to_string()));
                }
            }
        }

        let active = {
            let mut engine = self.engine.lock().await;
            for sample in &report.samples {
                if let Some(alert) = engine.evaluate(sample) {
                    report.alerts.push(alert);
                }
            }
            engine.active_count()
        };

        if !report.alerts.is_empty() {
            report.broadcast = self.notifier.broadcast(&report.alerts).await;
        }

        if let Some(metrics) = &self.metrics {
            for alert in &report.alerts {
                metrics.inc_alert_emitted(alert.kind.as_str(), alert.severity.as_str());
            }
            metrics.add_deliveries(
                report.broadcast.delivered,
                report.broadcast.failed,
                report.broadcast.dropped,
            );
            metrics.set_active_alerts(active);
            metrics.observe_tick(now);
        }

        report
    }

    async fn sample(&self, kind: AlertKind, now: i64) -> Result<MetricSample, SampleError> {
        let source = Arc::clone(&self.source);
        match kind {
            AlertKind::Cpu => {
                let settle = self.settings.cpu_settle;
                let cpu = blocking(source, move |s| s.sample_cpu(settle)).await?;
                Ok(MetricSample::new(kind, cpu.percent, now))
            }
            AlertKind::Memory => {
                let mem = blocking(source, |s| s.sample_memory()).await?;
                Ok(MetricSample::new(kind, mem.percent, now).with_detail(format!(
                    "({:.1} GB / {:.1} GB)",
                    mem.used_bytes as f64 / GIB,
                    mem.total_bytes as f64 / GIB
                )))
            }
            AlertKind::Disk => {
                let mount = self.settings.disk_mount.clone();
                let disk = blocking(source, move |s| s.sample_disk(&mount)).await?;
                Ok(MetricSample::new(kind, disk.percent, now).with_detail(format!(
                    "({:.1} GB / {:.1} GB) on {}",
                    disk.used_bytes as f64 / GIB,
                    disk.total_bytes as f64 / GIB,
                    disk.mount_point
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertEngine, AlertRule, AlertRules, Severity};
    use crate::collectors::{CpuSample, DiskSample, MemorySample};
    use crate::notifier::tests::RecordingSink;
    use crate::notifier::RecipientSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeSource {
        cpu: StdMutex<f64>,
        memory: StdMutex<Option<f64>>,
        disk: StdMutex<Option<f64>>,
        cpu_calls: AtomicUsize,
        cpu_delay: Duration,
    }

    impl FakeSource {
        fn new(cpu: f64, memory: Option<f64>, disk: Option<f64>) -> Self {
            Self {
                cpu: StdMutex::new(cpu),
                memory: StdMutex::new(memory),
                disk: StdMutex::new(disk),
                cpu_calls: AtomicUsize::new(0),
                cpu_delay: Duration::ZERO,
            }
        }

        fn with_cpu_delay(mut self, delay: Duration) -> Self {
            self.cpu_delay = delay;
            self
        }

        fn set_cpu(&self, value: f64) {
            *self.cpu.lock().expect("cpu lock") = value;
        }
    }

    impl MetricsSource for FakeSource {
        fn sample_cpu(&self, _settle: Duration) -> Result<CpuSample, SampleError> {
            self.cpu_calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.cpu_delay);
            let percent = *self.cpu.lock().map_err(|_| SampleError::Poisoned)?;
            Ok(CpuSample {
                percent,
                per_core: vec![percent],
                frequency_mhz: 0,
                core_count: 1,
                load_avg: [0.0; 3],
            })
        }

        fn sample_memory(&self) -> Result<MemorySample, SampleError> {
            let percent = self
                .memory
                .lock()
                .map_err(|_| SampleError::Poisoned)?
                .ok_or(SampleError::NoMemoryData)?;
            Ok(MemorySample {
                total_bytes: 100,
                used_bytes: percent as u64,
                available_bytes: 100 - percent as u64,
                percent,
                swap_total_bytes: 0,
                swap_used_bytes: 0,
            })
        }

        fn sample_disk(&self, mount_point: &str) -> Result<DiskSample, SampleError> {
            let percent = self
                .disk
                .lock()
                .map_err(|_| SampleError::Poisoned)?
                .ok_or_else(|| SampleError::MountNotFound(mount_point.to_string()))?;
            Ok(DiskSample {
                mount_point: mount_point.to_string(),
                total_bytes: 100,
                used_bytes: percent as u64,
                free_bytes: 100 - percent as u64,
                percent,
            })
        }
    }

    fn rules() -> AlertRules {
        let rule = AlertRule {
            threshold: 80.0,
            cooldown_secs: 60,
        };
        AlertRules {
            cpu: rule,
            memory: rule,
            disk: rule,
        }
    }

    async fn monitor(
        source: Arc<FakeSource>,
        recipients: &[i64],
    ) -> (Arc<HealthMonitor<Arc<RecordingSink>>>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let set = RecipientSet::new();
        for id in recipients {
            set.register(*id).await;
        }
        let notifier = Arc::new(Notifier::new(sink.clone(), set));
        let monitor = HealthMonitor::new(
            source,
            AlertEngine::new(rules()).into_shared(),
            notifier,
            MonitorSettings {
                cpu_settle: Duration::from_millis(0),
                disk_mount: "/".to_string(),
            },
        );
        (Arc::new(monitor), sink)
    }

    #[tokio::test]
    async fn end_to_end_cooldown_and_escalation() {
        let source = Arc::new(FakeSource::new(85.0, Some(20.0), Some(30.0)));
        let (monitor, sink) = monitor(source.clone(), &[1, 2]).await;

        let tick1 = monitor.tick_at(0).await;
        assert_eq!(tick1.alerts.len(), 1);
        assert_eq!(tick1.broadcast.delivered, 2);
        assert_eq!(sink.deliveries(), vec![(1, 1), (2, 1)]);

        source.set_cpu(90.0);
        let tick2 = monitor.tick_at(30).await;
        assert!(tick2.alerts.is_empty());
        assert_eq!(sink.deliveries().len(), 2);

        source.set_cpu(40.0);
        let tick3 = monitor.tick_at(120).await;
        assert!(tick3.alerts.is_empty());

        source.set_cpu(96.0);
        let tick4 = monitor.tick_at(180).await;
        assert_eq!(tick4.alerts.len(), 1);
        assert_eq!(tick4.alerts[0].severity, Severity::Critical);
        assert_eq!(sink.deliveries(), vec![(1, 1), (2, 1), (1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn failing_metric_does_not_block_the_others() {
        let source = Arc::new(FakeSource::new(85.0, None, Some(90.0)));
        let (monitor, _sink) = monitor(source, &[1]).await;

        let report = monitor.tick_at(0).await;
        let sampled: Vec<_> = report.samples.iter().map(|s| s.kind).collect();
        assert_eq!(sampled, vec![AlertKind::Cpu, AlertKind::Disk]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, AlertKind::Memory);
        assert_eq!(report.alerts.len(), 2);
        assert_eq!(report.broadcast.delivered, 2);
    }

    #[tokio::test]
    async fn disk_alert_message_names_the_mount() {
        let source = Arc::new(FakeSource::new(10.0, Some(10.0), Some(91.0)));
        let (monitor, _sink) = monitor(source, &[]).await;

        let report = monitor.tick_at(0).await;
        assert_eq!(report.alerts.len(), 1);
        assert!(report.alerts[0].message.ends_with("on /"));
        assert_eq!(report.broadcast.dropped, 1);
    }

    #[tokio::test]
    async fn start_is_not_reentrant_and_stop_halts() {
        let source = Arc::new(FakeSource::new(10.0, Some(10.0), Some(10.0)));
        let (monitor, _sink) = monitor(source, &[1]).await;

        assert!(monitor.start(Duration::from_secs(3600)).await);
        assert!(monitor.is_running().await);
        assert!(!monitor.start(Duration::from_secs(60)).await);

        monitor.stop().await;
        assert!(!monitor.is_running().await);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn stop_lets_the_running_tick_finish() {
        let source = Arc::new(
            FakeSource::new(85.0, Some(10.0), Some(10.0))
                .with_cpu_delay(Duration::from_millis(200)),
        );
        let (monitor, sink) = monitor(source.clone(), &[1]).await;

        monitor.start(Duration::from_millis(100)).await;
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while source.cpu_calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "first tick never started");

        monitor.stop().await;
        assert!(!monitor.is_running().await);
        assert_eq!(sink.deliveries(), vec![(1, 1)]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(source.cpu_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_tick_waits_one_full_interval() {
        let source = Arc::new(FakeSource::new(10.0, Some(10.0), Some(10.0)));
        let (monitor, _sink) = monitor(source.clone(), &[1]).await;

        monitor.start(Duration::from_millis(300)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.cpu_calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(source.cpu_calls.load(Ordering::SeqCst) >= 1);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn evaluate_once_updates_metrics() {
        let source = Arc::new(FakeSource::new(85.0, Some(10.0), Some(10.0)));
        let sink = Arc::new(RecordingSink::default());
        let metrics = Metrics::new().expect("metrics");
        let notifier = Arc::new(Notifier::new(sink, RecipientSet::new()));
        let monitor = HealthMonitor::new(
            source,
            AlertEngine::new(rules()).into_shared(),
            notifier,
            MonitorSettings {
                cpu_settle: Duration::from_millis(0),
                disk_mount: "/".to_string(),
            },
        )
        .with_metrics(metrics.clone());

        let report = monitor.evaluate_once().await;
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(metrics.hostwatch_active_alerts.get(), 1.0);
        assert_eq!(metrics.hostwatch_ticks_total.get(), 1.0);
        assert_eq!(monitor.engine().lock().await.active_alerts().len(), 1);
    }
}
