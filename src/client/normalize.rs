//! Tolerant decoding of snapshot payloads. Missing, null or mistyped fields
//! fall back to zero or empty values instead of failing the whole message.

use crate::hardware::local::parse_reading;
use crate::snapshot::{
    CpuMetrics, DriveMetrics, GpuMetrics, NetworkMetrics, ProcessInfo, RamMetrics, Snapshot,
};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde_json::Value;

/// Only a payload that is not JSON, or not a JSON object, is an error.
/// A missing timestamp becomes `received_at`.
pub fn normalize(raw: &str, received_at: DateTime<Utc>) -> Result<Snapshot, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(serde_json::Error::custom("snapshot payload is not a JSON object"));
    }

    Ok(Snapshot {
        os_name: text(&value["osName"]),
        uptime: text(&value["uptime"]),
        cpu: cpu(&value["cpu"]),
        gpu: list(&value["gpu"], gpu),
        ram: ram(&value["ram"]),
        storage: list(&value["storage"], drive),
        network: NetworkMetrics {
            upload_mbps: number(&value["network"]["uploadMbps"]),
            download_mbps: number(&value["network"]["downloadMbps"]),
        },
        processes: list(&value["processes"], process),
        timestamp: value["timestamp"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(received_at),
    })
}

fn number(v: &Value) -> f64 {
    let n = match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => parse_reading(s).unwrap_or(0.0),
        _ => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn list<T>(v: &Value, item: fn(&Value) -> T) -> Vec<T> {
    v.as_array()
        .map(|items| items.iter().map(item).collect())
        .unwrap_or_default()
}

fn cpu(v: &Value) -> CpuMetrics {
    CpuMetrics {
        name: text(&v["name"]),
        usage: number(&v["usage"]),
        temp: number(&v["temp"]),
        power: number(&v["power"]),
        frequency: number(&v["frequency"]),
        fan_speed: number(&v["fanSpeed"]),
        core_usage: list(&v["coreUsage"], number),
    }
}

fn gpu(v: &Value) -> GpuMetrics {
    GpuMetrics {
        name: text(&v["name"]),
        usage: number(&v["usage"]),
        temp: number(&v["temp"]),
        memory_used: number(&v["memoryUsed"]),
        memory_total: number(&v["memoryTotal"]),
        fan_speed: number(&v["fanSpeed"]),
        power: number(&v["power"]),
    }
}

fn ram(v: &Value) -> RamMetrics {
    RamMetrics {
        used_gb: number(&v["usedGB"]),
        total_gb: number(&v["totalGB"]),
        used_percent: number(&v["usedPercent"]),
    }
}

fn drive(v: &Value) -> DriveMetrics {
    DriveMetrics {
        name: text(&v["name"]),
        mount: text(&v["mount"]),
        used_gb: number(&v["usedGB"]),
        total_gb: number(&v["totalGB"]),
        percent: number(&v["percent"]),
        temp: match &v["temp"] {
            Value::Null => None,
            other => Some(number(other)),
        },
    }
}

fn process(v: &Value) -> ProcessInfo {
    ProcessInfo {
        name: text(&v["name"]),
        id: number(&v["id"]) as u32,
        memory_mb: number(&v["memoryMB"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn serialized_snapshot_survives_normalization() {
        let mut snap = Snapshot::empty(Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap());
        snap.os_name = "Ubuntu 24.04".to_string();
        snap.uptime = "2h 3m".to_string();
        snap.cpu = CpuMetrics {
            name: "Ryzen".to_string(),
            usage: 12.5,
            temp: 61.7f32 as f64,
            power: 45.3f32 as f64,
            frequency: 4400.0,
            fan_speed: 900.0,
            core_usage: vec![1.0, 0.1 + 0.2, 7.3f32 as f64, 1.0 / 3.0],
        };
        snap.gpu.push(GpuMetrics {
            name: "RTX".to_string(),
            usage: 30.0,
            temp: 961.916_870_117_187_5,
            memory_used: 2048.0,
            memory_total: 8192.0,
            ..GpuMetrics::default()
        });
        snap.storage.push(DriveMetrics {
            name: "nvme0n1".to_string(),
            mount: "/".to_string(),
            used_gb: 100.0,
            total_gb: 476.9f32 as f64,
            percent: 100.0 / 476.9,
            temp: Some(40.0),
        });
        snap.storage.push(DriveMetrics {
            name: "sda".to_string(),
            mount: "/data".to_string(),
            total_gb: 1000.0,
            ..DriveMetrics::default()
        });
        snap.network = NetworkMetrics {
            upload_mbps: 123_457.0 * 8.0 / 1_000_000.0,
            download_mbps: 9_876_543.0 * 8.0 / 1_000_000.0,
        };
        snap.processes.push(ProcessInfo {
            name: "firefox".to_string(),
            id: 4242,
            memory_mb: 812.3,
        });

        let raw = serde_json::to_string(&snap).unwrap();
        assert_eq!(normalize(&raw, received()).unwrap(), snap);
    }

    #[test]
    fn f32_sensor_readings_are_exact_after_normalization() {
        let mut state: u32 = 0x9E37_79B9;
        let mut snap = Snapshot::empty(received());
        for _ in 0..20_000 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let reading = (state as f32 / u32::MAX as f32 * 1000.0) as f64;
            snap.cpu.temp = reading;
            snap.network.download_mbps = reading * 8.0 / 1_000_000.0;

            let raw = serde_json::to_string(&snap).unwrap();
            let back = normalize(&raw, received()).unwrap();
            assert_eq!(back.cpu.temp.to_bits(), reading.to_bits(), "{raw}");
            assert_eq!(back.network, snap.network);
        }
    }

    #[test]
    fn missing_and_mistyped_fields_default() {
        let raw = r#"{
            "cpu": {"usage": "42.5", "temp": null, "coreUsage": [1, "2", null]},
            "gpu": null,
            "ram": {"usedGB": 8},
            "storage": [{"name": "sda", "totalGB": 10, "temp": null}],
            "processes": [{"name": "init", "id": 1}],
            "unknownField": {"nested": true}
        }"#;
        let snap = normalize(raw, received()).unwrap();

        assert_eq!(snap.os_name, "");
        assert_eq!(snap.cpu.usage, 42.5);
        assert_eq!(snap.cpu.temp, 0.0);
        assert_eq!(snap.cpu.core_usage, vec![1.0, 2.0, 0.0]);
        assert!(snap.gpu.is_empty());
        assert_eq!(snap.ram.used_gb, 8.0);
        assert_eq!(snap.ram.total_gb, 0.0);
        assert_eq!(snap.storage[0].temp, None);
        assert_eq!(snap.processes[0].memory_mb, 0.0);
        assert_eq!(snap.network, NetworkMetrics::default());
        assert_eq!(snap.timestamp, received());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(normalize("not json", received()).is_err());
        assert!(normalize("[1, 2]", received()).is_err());
        assert!(normalize("{}", received()).is_ok());
    }
}
