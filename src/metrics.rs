use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub hostwatch_ticks_total: Counter,
    pub hostwatch_sample_errors_total: CounterVec,
    pub hostwatch_alerts_emitted_total: CounterVec,
    pub hostwatch_deliveries_total: CounterVec,
    pub hostwatch_active_alerts: Gauge,
    pub hostwatch_metric_percent: GaugeVec,
    pub hostwatch_last_tick_timestamp_seconds: Gauge,
    pub hostwatch_uptime_seconds: Gauge,
    pub hostwatch_requests_total: CounterVec,
    pub hostwatch_requests_rejected_total: CounterVec,
    pub hostwatch_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let hostwatch_ticks_total = Counter::with_opts(opts!(
            "hostwatch_ticks_total",
            "Completed health check cycles"
        ))?;
        let hostwatch_sample_errors_total = CounterVec::new(
            opts!(
                "hostwatch_sample_errors_total",
                "Sampling failures by metric"
            ),
            &["metric"],
        )?;
        let hostwatch_alerts_emitted_total = CounterVec::new(
            opts!(
                "hostwatch_alerts_emitted_total",
                "Alerts emitted by kind and severity"
            ),
            &["kind", "severity"],
        )?;
        let hostwatch_deliveries_total = CounterVec::new(
            opts!(
                "hostwatch_deliveries_total",
                "Alert deliveries by result (ok, failed, dropped)"
            ),
            &["result"],
        )?;
        let hostwatch_active_alerts = Gauge::with_opts(opts!(
            "hostwatch_active_alerts",
            "Alerts neither acknowledged nor cleared"
        ))?;
        let hostwatch_metric_percent = GaugeVec::new(
            opts!(
                "hostwatch_metric_percent",
                "Last sampled usage in percent by metric"
            ),
            &["metric"],
        )?;
        let hostwatch_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "hostwatch_last_tick_timestamp_seconds",
            "Unix time of the last health check cycle"
        ))?;
        let hostwatch_uptime_seconds =
            Gauge::with_opts(opts!("hostwatch_uptime_seconds", "Process uptime in seconds"))?;
        let hostwatch_requests_total = CounterVec::new(
            opts!(
                "hostwatch_requests_total",
                "Chat requests handled by action"
            ),
            &["action"],
        )?;
        let hostwatch_requests_rejected_total = CounterVec::new(
            opts!(
                "hostwatch_requests_rejected_total",
                "Chat requests rejected by pipeline stage"
            ),
            &["stage"],
        )?;
        let hostwatch_scrape_count_total = Counter::with_opts(opts!(
            "hostwatch_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &hostwatch_ticks_total)?;
        register(&registry, &hostwatch_sample_errors_total)?;
        register(&registry, &hostwatch_alerts_emitted_total)?;
        register(&registry, &hostwatch_deliveries_total)?;
        register(&registry, &hostwatch_active_alerts)?;
        register(&registry, &hostwatch_metric_percent)?;
        register(&registry, &hostwatch_last_tick_timestamp_seconds)?;
        register(&registry, &hostwatch_uptime_seconds)?;
        register(&registry, &hostwatch_requests_total)?;
        register(&registry, &hostwatch_requests_rejected_total)?;
        register(&registry, &hostwatch_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            hostwatch_ticks_total,
            hostwatch_sample_errors_total,
            hostwatch_alerts_emitted_total,
            hostwatch_deliveries_total,
            hostwatch_active_alerts,
            hostwatch_metric_percent,
            hostwatch_last_tick_timestamp_seconds,
            hostwatch_uptime_seconds,
            hostwatch_requests_total,
            hostwatch_requests_rejected_total,
            hostwatch_scrape_count_total,
        }))
    }

    pub fn observe_tick(&self, now_unix: i64) {
        self.hostwatch_ticks_total.inc();
        self.hostwatch_last_tick_timestamp_seconds
            .set(now_unix as f64);
    }

    pub fn set_metric_percent(&self, metric: &str, value: f64) {
        self.hostwatch_metric_percent
            .with_label_values(&[metric])
            .set(value);
    }

    pub fn inc_sample_error(&self, metric: &str) {
        self.hostwatch_sample_errors_total
            .with_label_values(&[metric])
            .inc();
    }

    pub fn inc_alert_emitted(&self, kind: &str, severity: &str) {
        self.hostwatch_alerts_emitted_total
            .with_label_values(&[kind, severity])
            .inc();
    }

    pub fn add_deliveries(&self, delivered: usize, failed: usize, dropped: usize) {
        for (result, count) in [("ok", delivered), ("failed", failed), ("dropped", dropped)] {
            if count > 0 {
                self.hostwatch_deliveries_total
                    .with_label_values(&[result])
                    .inc_by(count as f64);
            }
        }
    }

    pub fn set_active_alerts(&self, count: usize) {
        self.hostwatch_active_alerts.set(count as f64);
    }

    pub fn inc_request(&self, action: &str) {
        self.hostwatch_requests_total
            .with_label_values(&[action])
            .inc();
    }

    pub fn inc_rejected(&self, stage: &str) {
        self.hostwatch_requests_rejected_total
            .with_label_values(&[stage])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.hostwatch_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix);
        self.hostwatch_uptime_seconds.set(uptime as f64);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
