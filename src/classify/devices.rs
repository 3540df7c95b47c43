use crate::classify::{apply_rules, Rule};
use crate::hardware::{HardwareNode, Sensor, SensorKind};
use crate::snapshot::{DriveMetrics, GpuMetrics, NetworkMetrics, RamMetrics};

const NO_WORDS: &[&str] = &[];
const DATA_KINDS: &[SensorKind] = &[SensorKind::Data, SensorKind::SmallData];

/// Data sensors report gigabytes, SmallData megabytes.
fn megabytes(sensor: &Sensor, v: f64) -> f64 {
    match sensor.kind {
        SensorKind::Data => v * 1024.0,
        _ => v,
    }
}

pub const GPU_RULES: &[Rule<GpuMetrics>] = &[
    Rule {
        field: "usage",
        kinds: &[SensorKind::Load],
        any_of: NO_WORDS,
        all_of: &["Core"],
        none_of: NO_WORDS,
        apply: |gpu, _, v| gpu.usage = v,
    },
    Rule {
        field: "temp",
        kinds: &[SensorKind::Temperature],
        any_of: NO_WORDS,
        all_of: &["Core"],
        none_of: NO_WORDS,
        apply: |gpu, _, v| gpu.temp = v,
    },
    Rule {
        field: "memoryUsed",
        kinds: DATA_KINDS,
        any_of: NO_WORDS,
        all_of: &["Memory", "Used"],
        none_of: NO_WORDS,
        apply: |gpu, s, v| gpu.memory_used = megabytes(s, v),
    },
    Rule {
        field: "memoryTotal",
        kinds: DATA_KINDS,
        any_of: NO_WORDS,
        all_of: &["Memory", "Total"],
        none_of: NO_WORDS,
        apply: |gpu, s, v| gpu.memory_total = megabytes(s, v),
    },
    Rule {
        field: "fanSpeed",
        kinds: &[SensorKind::Fan],
        any_of: NO_WORDS,
        all_of: NO_WORDS,
        none_of: NO_WORDS,
        apply: |gpu, _, v| gpu.fan_speed = gpu.fan_speed.max(v),
    },
    Rule {
        field: "power",
        kinds: &[SensorKind::Power],
        any_of: NO_WORDS,
        all_of: NO_WORDS,
        none_of: NO_WORDS,
        apply: |gpu, _, v| gpu.power = gpu.power.max(v),
    },
];

pub fn extract_gpu(node: &HardwareNode) -> GpuMetrics {
    let mut gpu = GpuMetrics {
        name: node.name.clone(),
        ..GpuMetrics::default()
    };
    apply_rules(GPU_RULES, &node.sensors, &mut gpu);
    gpu
}

#[derive(Debug, Default)]
pub struct RamReadings {
    used_gb: f64,
    available_gb: f64,
    percent: f64,
}

pub const RAM_RULES: &[Rule<RamReadings>] = &[
    Rule {
        field: "usedGB",
        kinds: &[SensorKind::Data],
        any_of: NO_WORDS,
        all_of: &["Used"],
        none_of: &["Virtual"],
        apply: |ram, _, v| ram.used_gb = v,
    },
    Rule {
        field: "availableGB",
        kinds: &[SensorKind::Data],
        any_of: NO_WORDS,
        all_of: &["Available"],
        none_of: &["Virtual"],
        apply: |ram, _, v| ram.available_gb = v,
    },
    Rule {
        field: "usedPercent",
        kinds: &[SensorKind::Load],
        any_of: NO_WORDS,
        all_of: &["Memory"],
        none_of: &["Virtual"],
        apply: |ram, _, v| ram.percent = v,
    },
];

/// Total is derived from used + available once every sensor has been seen.
pub fn extract_ram(node: &HardwareNode) -> RamMetrics {
    let mut readings = RamReadings::default();
    apply_rules(RAM_RULES, &node.sensors, &mut readings);
    RamMetrics {
        used_gb: readings.used_gb,
        total_gb: readings.used_gb + readings.available_gb,
        used_percent: readings.percent,
    }
}

pub const STORAGE_RULES: &[Rule<DriveMetrics>] = &[
    Rule {
        field: "percent",
        kinds: &[SensorKind::Load],
        any_of: NO_WORDS,
        all_of: &["Used Space"],
        none_of: NO_WORDS,
        apply: |drive, _, v| drive.percent = v,
    },
    Rule {
        field: "usedGB",
        kinds: &[SensorKind::Data],
        any_of: NO_WORDS,
        all_of: &["Used"],
        none_of: NO_WORDS,
        apply: |drive, _, v| drive.used_gb = v,
    },
    Rule {
        field: "totalGB",
        kinds: &[SensorKind::Data],
        any_of: NO_WORDS,
        all_of: &["Total"],
        none_of: NO_WORDS,
        apply: |drive, _, v| drive.total_gb = v,
    },
    Rule {
        field: "temp",
        kinds: &[SensorKind::Temperature],
        any_of: NO_WORDS,
        all_of: NO_WORDS,
        none_of: NO_WORDS,
        apply: |drive, _, v| drive.temp = Some(drive.temp.map_or(v, |t| t.max(v))),
    },
];

/// Drives reporting no total space are dropped.
pub fn extract_drive(node: &HardwareNode) -> Option<DriveMetrics> {
    let mut drive = DriveMetrics {
        name: node.name.clone(),
        mount: node.location.clone().unwrap_or_default(),
        ..DriveMetrics::default()
    };
    apply_rules(STORAGE_RULES, &node.sensors, &mut drive);
    (drive.total_gb > 0.0).then_some(drive)
}

fn to_mbps(bytes_per_sec: f64) -> f64 {
    bytes_per_sec * 8.0 / 1_000_000.0
}

pub const NETWORK_RULES: &[Rule<NetworkMetrics>] = &[
    Rule {
        field: "uploadMbps",
        kinds: &[SensorKind::Throughput],
        any_of: NO_WORDS,
        all_of: &["Upload"],
        none_of: NO_WORDS,
        apply: |net, _, v| net.upload_mbps += to_mbps(v),
    },
    Rule {
        field: "downloadMbps",
        kinds: &[SensorKind::Throughput],
        any_of: NO_WORDS,
        all_of: &["Download"],
        none_of: NO_WORDS,
        apply: |net, _, v| net.download_mbps += to_mbps(v),
    },
];

/// Adds one adapter's throughput to the running totals.
pub fn accumulate_network(node: &HardwareNode, totals: &mut NetworkMetrics) {
    apply_rules(NETWORK_RULES, &node.sensors, totals);
}
