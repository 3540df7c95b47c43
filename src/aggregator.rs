use crate::classify::{
    accumulate_network, contains_ci, cpu_fan, extract_cpu, extract_drive, extract_gpu, extract_ram,
};
use crate::hardware::refresh::refresh_tree;
use crate::hardware::{HardwareCategory, HardwareNode, ProviderError, SensorProvider};
use crate::metrics::Metrics;
use crate::snapshot::{ProcessInfo, Snapshot};
use chrono::{DateTime, Utc};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("рабочий поток опроса датчиков завершился с ошибкой: {0}")]
    Worker(String),
}

struct Backend {
    provider: Box<dyn SensorProvider>,
    tree: Vec<HardwareNode>,
}

#[derive(Default)]
struct PollSlot {
    last: Option<Arc<Snapshot>>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Owns the sensor provider and produces snapshots one poll at a time.
///
/// Callers that arrive while a poll is running wait for it and receive its
/// result instead of starting another one.
pub struct Aggregator {
    backend: Option<Arc<Mutex<Backend>>>,
    gate: tokio::sync::Mutex<PollSlot>,
    latest: Mutex<Option<Arc<Snapshot>>>,
    completed: AtomicU64,
    top_processes: usize,
    metrics: Arc<Metrics>,
}

impl Aggregator {
    /// A provider that failed to open or discover is logged here once; the
    /// aggregator then serves all-default snapshots.
    pub fn open(
        provider: Result<Box<dyn SensorProvider>, ProviderError>,
        top_processes: usize,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let backend = match provider {
            Ok(mut provider) => match provider.discover() {
                Ok(tree) => {
                    info!(nodes = tree.len(), "провайдер датчиков инициализирован");
                    Some(Arc::new(Mutex::new(Backend { provider, tree })))
                }
                Err(err) => {
                    error!(error = %err, "не удалось обнаружить оборудование, будут отдаваться пустые снимки");
                    provider.close();
                    None
                }
            },
            Err(err) => {
                error!(error = %err, "не удалось открыть провайдер датчиков, будут отдаваться пустые снимки");
                None
            }
        };
        metrics.set_provider_available(backend.is_some());

        Arc::new(Self {
            backend,
            gate: tokio::sync::Mutex::new(PollSlot::default()),
            latest: Mutex::new(None),
            completed: AtomicU64::new(0),
            top_processes,
            metrics,
        })
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn poll(&self) -> Result<Arc<Snapshot>, PollError> {
        let seen = self.completed.load(Ordering::Acquire);
        let mut slot = self.gate.lock().await;
        if self.completed.load(Ordering::Acquire) != seen {
            if let Some(last) = &slot.last {
                debug!("опрос уже выполнен параллельно, отдаём общий результат");
                return Ok(last.clone());
            }
        }

        let started = Instant::now();
        let mut snapshot = match &self.backend {
            None => Snapshot::empty(Utc::now()),
            Some(backend) => {
                let backend = backend.clone();
                let metrics = self.metrics.clone();
                let top_n = self.top_processes;
                tokio::task::spawn_blocking(move || {
                    let mut guard = backend.lock().unwrap_or_else(|p| p.into_inner());
                    collect(&mut guard, top_n, &metrics)
                })
                .await
                .map_err(|err| PollError::Worker(err.to_string()))?
            }
        };

        snapshot.timestamp = next_timestamp(slot.last_timestamp, Utc::now());
        slot.last_timestamp = Some(snapshot.timestamp);
        let snapshot = Arc::new(snapshot);
        slot.last = Some(snapshot.clone());
        *self.latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(snapshot.clone());
        self.completed.fetch_add(1, Ordering::AcqRel);

        self.metrics.record_poll(&snapshot, started.elapsed());
        Ok(snapshot)
    }

    /// Last computed snapshot, without polling or waiting for a running poll.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub async fn close(&self) {
        let _slot = self.gate.lock().await;
        if let Some(backend) = &self.backend {
            let mut guard = backend.lock().unwrap_or_else(|p| p.into_inner());
            guard.provider.close();
            guard.tree.clear();
        }
        info!("агрегатор остановлен");
    }
}

fn next_timestamp(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

fn collect(backend: &mut Backend, top_n: usize, metrics: &Metrics) -> Snapshot {
    let Backend { provider, tree } = backend;

    let refreshed = isolate("refresh", metrics, || {
        refresh_tree(&mut **provider, tree.as_mut_slice())
    });
    if let Some(failed) = refreshed.filter(|failed| *failed > 0) {
        metrics.inc_refresh_failures(failed);
    }

    let mut snap = Snapshot::empty(Utc::now());
    for node in tree.iter() {
        let category = node.category.as_str();
        match node.category {
            HardwareCategory::Cpu => {
                if let Some(cpu) = isolate(category, metrics, || extract_cpu(node)) {
                    snap.cpu = cpu;
                }
            }
            HardwareCategory::Gpu => {
                if let Some(gpu) = isolate(category, metrics, || extract_gpu(node)) {
                    snap.gpu.push(gpu);
                }
            }
            HardwareCategory::Memory => {
                if contains_ci(&node.name, "Virtual") {
                    continue;
                }
                if let Some(ram) = isolate(category, metrics, || extract_ram(node)) {
                    snap.ram = ram;
                }
            }
            HardwareCategory::Storage => {
                if let Some(Some(drive)) = isolate(category, metrics, || extract_drive(node)) {
                    snap.storage.push(drive);
                }
            }
            HardwareCategory::Network => {
                let mut totals = snap.network.clone();
                let accumulated = isolate(category, metrics, move || {
                    accumulate_network(node, &mut totals);
                    totals
                });
                if let Some(totals) = accumulated {
                    snap.network = totals;
                }
            }
            HardwareCategory::Motherboard | HardwareCategory::SuperIo => {}
        }
    }

    snap.cpu.fan_speed = isolate("fan", metrics, || cpu_fan(tree.as_slice())).unwrap_or(0.0);

    if let Some(host) = isolate("host", metrics, || provider.host_info(top_n)) {
        snap.os_name = host.os_name;
        snap.uptime = format_uptime(host.uptime_secs);
        snap.processes = host
            .processes
            .into_iter()
            .map(|p| ProcessInfo {
                name: p.name,
                id: p.pid,
                memory_mb: (p.memory_bytes as f64 / (1024.0 * 1024.0) * 10.0).round() / 10.0,
            })
            .collect();
    }

    snap
}

fn format_uptime(secs: u64) -> String {
    humantime::format_duration(Duration::from_secs(secs)).to_string()
}

/// Runs one extraction step; a panic is logged, counted and turned into `None`
/// so the rest of the snapshot is still produced.
fn isolate<T>(scope: &str, metrics: &Metrics, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "неизвестная причина".to_string());
            warn!(category = scope, reason = %reason, "сбой извлечения категории, пропускаем");
            metrics.inc_extraction_failure(scope);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HostInfo, ProcessSample, Sensor, SensorKind};

    struct FakeProvider {
        delay: Duration,
        panic_on_host_info: bool,
        refreshes: Arc<AtomicU64>,
    }

    impl FakeProvider {
        fn boxed(delay: Duration, refreshes: Arc<AtomicU64>) -> Box<dyn SensorProvider> {
            Box::new(Self {
                delay,
                panic_on_host_info: false,
                refreshes,
            })
        }
    }

    impl SensorProvider for FakeProvider {
        fn discover(&mut self) -> Result<Vec<HardwareNode>, ProviderError> {
            Ok(vec![
                HardwareNode::new(HardwareCategory::Cpu, "/cpu/0", "Test CPU")
                    .with_sensor(SensorKind::Load, "CPU Total", Some(12.0))
                    .with_sensor(SensorKind::Temperature, "CPU Package", Some(55.0)),
                HardwareNode::new(HardwareCategory::Gpu, "/gpu/0", "GPU A")
                    .with_sensor(SensorKind::Load, "GPU Core", Some(30.0)),
                HardwareNode::new(HardwareCategory::Gpu, "/gpu/1", "GPU B")
                    .with_sensor(SensorKind::Load, "GPU Core", Some(60.0)),
                HardwareNode::new(HardwareCategory::Memory, "/ram", "Generic Memory")
                    .with_sensor(SensorKind::Data, "Memory Used", Some(4.0))
                    .with_sensor(SensorKind::Data, "Memory Available", Some(12.0)),
                HardwareNode::new(HardwareCategory::Memory, "/vram", "Virtual Memory")
                    .with_sensor(SensorKind::Data, "Memory Used", Some(99.0)),
                HardwareNode::new(HardwareCategory::Storage, "/storage/0", "Empty")
                    .with_sensor(SensorKind::Data, "Total Space", Some(0.0)),
                HardwareNode::new(HardwareCategory::Storage, "/storage/1", "SSD")
                    .at("/")
                    .with_sensor(SensorKind::Data, "Total Space", Some(500.0)),
                HardwareNode::new(HardwareCategory::Network, "/nic/a", "a")
                    .with_sensor(SensorKind::Throughput, "Download Speed", Some(1_000_000.0)),
                HardwareNode::new(HardwareCategory::Network, "/nic/b", "b")
                    .with_sensor(SensorKind::Throughput, "Download Speed", Some(1_000_000.0)),
                HardwareNode::new(HardwareCategory::Motherboard, "/motherboard", "Board")
                    .with_child(
                        HardwareNode::new(HardwareCategory::SuperIo, "/lpc/it87", "IT8688E")
                            .with_sensor(SensorKind::Fan, "Fan #1", Some(950.0)),
                    ),
            ])
        }

        fn refresh(&mut self, node: &mut HardwareNode) -> Result<(), ProviderError> {
            if node.category == HardwareCategory::Cpu {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(self.delay);
            }
            Ok(())
        }

        fn host_info(&mut self, top_n: usize) -> HostInfo {
            if self.panic_on_host_info {
                panic!("process table unavailable");
            }
            let processes = (0..10)
                .map(|i| ProcessSample {
                    name: format!("proc{i}"),
                    pid: i,
                    memory_bytes: 1_572_864 * (10 - i as u64),
                })
                .take(top_n)
                .collect();
            HostInfo {
                os_name: "TestOS 1.0".to_string(),
                uptime_secs: 3_725,
                processes,
            }
        }
    }

    fn metrics() -> Arc<Metrics> {
        Metrics::new().expect("инициализация метрик")
    }

    #[tokio::test]
    async fn poll_assembles_every_category() {
        let agg = Aggregator::open(
            Ok(FakeProvider::boxed(Duration::ZERO, Arc::default())),
            5,
            metrics(),
        );
        let snap = agg.poll().await.unwrap();

        assert_eq!(snap.cpu.name, "Test CPU");
        assert_eq!(snap.cpu.usage, 12.0);
        assert_eq!(snap.cpu.temp, 55.0);
        assert_eq!(snap.cpu.fan_speed, 950.0);
        assert_eq!(snap.gpu.len(), 2);
        assert_eq!(snap.gpu[1].usage, 60.0);
        assert_eq!(snap.ram.used_gb, 4.0);
        assert_eq!(snap.ram.total_gb, 16.0);
        assert_eq!(snap.storage.len(), 1);
        assert_eq!(snap.storage[0].mount, "/");
        assert!((snap.network.download_mbps - 16.0).abs() < 1e-9);
        assert_eq!(snap.os_name, "TestOS 1.0");
        assert_eq!(snap.uptime, "1h 2m 5s");
        assert_eq!(snap.processes.len(), 5);
        assert_eq!(snap.processes[0].memory_mb, 15.0);
    }

    #[tokio::test]
    async fn concurrent_polls_share_one_result() {
        let refreshes = Arc::new(AtomicU64::new(0));
        let agg = Aggregator::open(
            Ok(FakeProvider::boxed(Duration::from_millis(50), refreshes.clone())),
            5,
            metrics(),
        );

        let (a, b, c) = tokio::join!(agg.poll(), agg.poll(), agg.poll());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_polls_have_increasing_timestamps() {
        let agg = Aggregator::open(
            Ok(FakeProvider::boxed(Duration::ZERO, Arc::default())),
            5,
            metrics(),
        );
        let mut previous = agg.poll().await.unwrap().timestamp;
        for _ in 0..5 {
            let next = agg.poll().await.unwrap().timestamp;
            assert!(next > previous);
            previous = next;
        }
    }

    #[tokio::test]
    async fn failed_provider_yields_default_snapshots() {
        let agg = Aggregator::open(Err(ProviderError::Unsupported), 5, metrics());
        assert!(!agg.is_available());

        let first = agg.poll().await.unwrap();
        let second = agg.poll().await.unwrap();
        assert_eq!(first.cpu.usage, 0.0);
        assert!(first.gpu.is_empty());
        assert!(first.storage.is_empty());
        assert!(second.timestamp > first.timestamp);
    }

    #[tokio::test]
    async fn host_info_fault_keeps_hardware_metrics() {
        let m = metrics();
        let provider: Box<dyn SensorProvider> = Box::new(FakeProvider {
            delay: Duration::ZERO,
            panic_on_host_info: true,
            refreshes: Arc::default(),
        });
        let agg = Aggregator::open(Ok(provider), 5, m.clone());

        let snap = agg.poll().await.unwrap();
        assert_eq!(snap.cpu.usage, 12.0);
        assert!(snap.processes.is_empty());
        assert_eq!(
            m.hwmond_extraction_failures_total
                .with_label_values(&["host"])
                .get(),
            1.0
        );
    }

    struct CrashingGpuProvider;

    impl SensorProvider for CrashingGpuProvider {
        fn discover(&mut self) -> Result<Vec<HardwareNode>, ProviderError> {
            Ok(vec![
                HardwareNode::new(HardwareCategory::Gpu, "/gpu/0", "Flaky GPU"),
                HardwareNode::new(HardwareCategory::Cpu, "/cpu/0", "Test CPU"),
            ])
        }

        fn refresh(&mut self, node: &mut HardwareNode) -> Result<(), ProviderError> {
            match node.category {
                HardwareCategory::Gpu => panic!("driver reset"),
                _ => {
                    node.sensors = vec![Sensor::new(SensorKind::Load, "CPU Total", Some(42.0))];
                    Ok(())
                }
            }
        }

        fn host_info(&mut self, _top_n: usize) -> HostInfo {
            HostInfo::default()
        }
    }

    #[tokio::test]
    async fn panicking_node_does_not_block_later_nodes() {
        let m = metrics();
        let provider: Box<dyn SensorProvider> = Box::new(CrashingGpuProvider);
        let agg = Aggregator::open(Ok(provider), 5, m.clone());

        let snap = agg.poll().await.unwrap();
        assert_eq!(snap.cpu.usage, 42.0);
        assert_eq!(m.hwmond_refresh_failures_total.get(), 1.0);
    }

    #[tokio::test]
    async fn latest_tracks_the_last_poll() {
        let agg = Aggregator::open(Err(ProviderError::Unsupported), 5, metrics());
        assert!(agg.latest().is_none());

        let polled = agg.poll().await.unwrap();
        assert!(Arc::ptr_eq(&agg.latest().unwrap(), &polled));
    }

    #[test]
    fn timestamps_never_repeat() {
        let t = Utc::now();
        assert_eq!(next_timestamp(None, t), t);
        assert!(next_timestamp(Some(t), t) > t);
        let later = t + chrono::Duration::seconds(1);
        assert_eq!(next_timestamp(Some(t), later), later);
    }
}
