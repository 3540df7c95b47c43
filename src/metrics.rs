use crate::snapshot::Snapshot;
use prometheus::core::Collector;
use prometheus::{
    opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub hwmond_polls_total: Counter,
    pub hwmond_last_poll_duration_seconds: Gauge,
    pub hwmond_last_poll_timestamp_seconds: Gauge,
    pub hwmond_provider_available: Gauge,
    pub hwmond_extraction_failures_total: CounterVec,
    pub hwmond_refresh_failures_total: Counter,
    pub hwmond_scrape_count_total: Counter,
    pub hwmond_stream_subscribers: IntGauge,
    pub hwmond_stream_messages_total: Counter,
    pub hwmond_stream_dropped_total: Counter,
    pub hwmond_cpu_usage_percent: Gauge,
    pub hwmond_cpu_temperature_celsius: Gauge,
    pub hwmond_ram_usage_percent: Gauge,
    pub hwmond_gpu_utilization_percent: GaugeVec,
    pub hwmond_gpu_temperature_celsius: GaugeVec,
    pub hwmond_drive_usage_percent: GaugeVec,
    pub hwmond_network_upload_mbps: Gauge,
    pub hwmond_network_download_mbps: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let hwmond_polls_total = Counter::with_opts(opts!(
            "hwmond_polls_total",
            "Number of computed snapshots (shared results are not counted)"
        ))?;
        let hwmond_last_poll_duration_seconds = Gauge::with_opts(opts!(
            "hwmond_last_poll_duration_seconds",
            "Wall time of the last sensor poll in seconds"
        ))?;
        let hwmond_last_poll_timestamp_seconds = Gauge::with_opts(opts!(
            "hwmond_last_poll_timestamp_seconds",
            "Unix timestamp of the last computed snapshot"
        ))?;
        let hwmond_provider_available = Gauge::with_opts(opts!(
            "hwmond_provider_available",
            "1 if the sensor provider initialized, 0 otherwise"
        ))?;
        let hwmond_extraction_failures_total = CounterVec::new(
            opts!(
                "hwmond_extraction_failures_total",
                "Faults isolated while extracting a hardware category"
            ),
            &["category"],
        )?;
        let hwmond_refresh_failures_total = Counter::with_opts(opts!(
            "hwmond_refresh_failures_total",
            "Hardware nodes that failed to refresh"
        ))?;
        let hwmond_scrape_count_total = Counter::with_opts(opts!(
            "hwmond_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let hwmond_stream_subscribers = IntGauge::with_opts(opts!(
            "hwmond_stream_subscribers",
            "Currently connected push subscribers"
        ))?;
        let hwmond_stream_messages_total = Counter::with_opts(opts!(
            "hwmond_stream_messages_total",
            "Snapshots queued to push subscribers"
        ))?;
        let hwmond_stream_dropped_total = Counter::with_opts(opts!(
            "hwmond_stream_dropped_total",
            "Subscribers dropped because their queue was full or closed"
        ))?;
        let hwmond_cpu_usage_percent =
            Gauge::with_opts(opts!("hwmond_cpu_usage_percent", "CPU load in percent"))?;
        let hwmond_cpu_temperature_celsius = Gauge::with_opts(opts!(
            "hwmond_cpu_temperature_celsius",
            "CPU package temperature in Celsius"
        ))?;
        let hwmond_ram_usage_percent =
            Gauge::with_opts(opts!("hwmond_ram_usage_percent", "RAM usage in percent"))?;
        let hwmond_gpu_utilization_percent = GaugeVec::new(
            opts!("hwmond_gpu_utilization_percent", "GPU core load in percent"),
            &["index", "name"],
        )?;
        let hwmond_gpu_temperature_celsius = GaugeVec::new(
            opts!(
                "hwmond_gpu_temperature_celsius",
                "GPU core temperature in Celsius"
            ),
            &["index", "name"],
        )?;
        let hwmond_drive_usage_percent = GaugeVec::new(
            opts!("hwmond_drive_usage_percent", "Drive used space in percent"),
            &["name", "mount"],
        )?;
        let hwmond_network_upload_mbps = Gauge::with_opts(opts!(
            "hwmond_network_upload_mbps",
            "Upload throughput across adapters in Mbps"
        ))?;
        let hwmond_network_download_mbps = Gauge::with_opts(opts!(
            "hwmond_network_download_mbps",
            "Download throughput across adapters in Mbps"
        ))?;

        register(&registry, &hwmond_polls_total)?;
        register(&registry, &hwmond_last_poll_duration_seconds)?;
        register(&registry, &hwmond_last_poll_timestamp_seconds)?;
        register(&registry, &hwmond_provider_available)?;
        register(&registry, &hwmond_extraction_failures_total)?;
        register(&registry, &hwmond_refresh_failures_total)?;
        register(&registry, &hwmond_scrape_count_total)?;
        register(&registry, &hwmond_stream_subscribers)?;
        register(&registry, &hwmond_stream_messages_total)?;
        register(&registry, &hwmond_stream_dropped_total)?;
        register(&registry, &hwmond_cpu_usage_percent)?;
        register(&registry, &hwmond_cpu_temperature_celsius)?;
        register(&registry, &hwmond_ram_usage_percent)?;
        register(&registry, &hwmond_gpu_utilization_percent)?;
        register(&registry, &hwmond_gpu_temperature_celsius)?;
        register(&registry, &hwmond_drive_usage_percent)?;
        register(&registry, &hwmond_network_upload_mbps)?;
        register(&registry, &hwmond_network_download_mbps)?;

        Ok(Arc::new(Self {
            registry,
            hwmond_polls_total,
            hwmond_last_poll_duration_seconds,
            hwmond_last_poll_timestamp_seconds,
            hwmond_provider_available,
            hwmond_extraction_failures_total,
            hwmond_refresh_failures_total,
            hwmond_scrape_count_total,
            hwmond_stream_subscribers,
            hwmond_stream_messages_total,
            hwmond_stream_dropped_total,
            hwmond_cpu_usage_percent,
            hwmond_cpu_temperature_celsius,
            hwmond_ram_usage_percent,
            hwmond_gpu_utilization_percent,
            hwmond_gpu_temperature_celsius,
            hwmond_drive_usage_percent,
            hwmond_network_upload_mbps,
            hwmond_network_download_mbps,
        }))
    }

    pub fn record_poll(&self, snapshot: &Snapshot, elapsed: Duration) {
        self.hwmond_polls_total.inc();
        self.hwmond_last_poll_duration_seconds.set(elapsed.as_secs_f64());
        self.hwmond_last_poll_timestamp_seconds
            .set(snapshot.timestamp.timestamp_millis() as f64 / 1000.0);
        self.update_from_snapshot(snapshot);
    }

    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        self.hwmond_cpu_usage_percent.set(snapshot.cpu.usage);
        self.hwmond_cpu_temperature_celsius.set(snapshot.cpu.temp);
        self.hwmond_ram_usage_percent.set(snapshot.ram.used_percent);
        self.hwmond_network_upload_mbps.set(snapshot.network.upload_mbps);
        self.hwmond_network_download_mbps.set(snapshot.network.download_mbps);

        self.hwmond_gpu_utilization_percent.reset();
        self.hwmond_gpu_temperature_celsius.reset();
        self.hwmond_drive_usage_percent.reset();

        for (i, g) in snapshot.gpu.iter().enumerate() {
            let index = i.to_string();
            let labels: [&str; 2] = [&index, &g.name];
            self.hwmond_gpu_utilization_percent
                .with_label_values(&labels)
                .set(g.usage);
            self.hwmond_gpu_temperature_celsius
                .with_label_values(&labels)
                .set(g.temp);
        }

        for d in &snapshot.storage {
            self.hwmond_drive_usage_percent
                .with_label_values(&[&d.name, &d.mount])
                .set(d.percent);
        }
    }

    pub fn set_provider_available(&self, available: bool) {
        self.hwmond_provider_available.set(if available { 1.0 } else { 0.0 });
    }

    pub fn inc_extraction_failure(&self, category: &str) {
        self.hwmond_extraction_failures_total
            .with_label_values(&[category])
            .inc();
    }

    pub fn inc_refresh_failures(&self, count: usize) {
        self.hwmond_refresh_failures_total.inc_by(count as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.hwmond_scrape_count_total.inc();
    }

    pub fn set_stream_subscribers(&self, count: usize) {
        self.hwmond_stream_subscribers.set(count as i64);
    }

    pub fn inc_stream_messages(&self, count: usize) {
        self.hwmond_stream_messages_total.inc_by(count as f64);
    }

    pub fn inc_stream_dropped(&self, count: usize) {
        self.hwmond_stream_dropped_total.inc_by(count as f64);
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{DriveMetrics, GpuMetrics};
    use chrono::Utc;

    #[test]
    fn snapshot_values_are_exported() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut snap = Snapshot::empty(Utc::now());
        snap.cpu.usage = 42.0;
        snap.gpu.push(GpuMetrics {
            name: "RTX 4070".to_string(),
            usage: 10.0,
            ..GpuMetrics::default()
        });
        snap.storage.push(DriveMetrics {
            name: "nvme0n1".to_string(),
            mount: "/".to_string(),
            total_gb: 100.0,
            percent: 50.0,
            ..DriveMetrics::default()
        });
        metrics.record_poll(&snap, Duration::from_millis(120));
        metrics.inc_extraction_failure("gpu");

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("hwmond_cpu_usage_percent 42"));
        assert!(text.contains("hwmond_gpu_utilization_percent{index=\"0\",name=\"RTX 4070\"} 10"));
        assert!(text.contains("hwmond_drive_usage_percent{mount=\"/\",name=\"nvme0n1\"} 50"));
        assert!(text.contains("hwmond_extraction_failures_total{category=\"gpu\"} 1"));
        assert!(text.contains("hwmond_polls_total 1"));
    }
}
