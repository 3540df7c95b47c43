use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One fully assembled set of canonical metrics, as served on `/stats` and
/// pushed on `/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub os_name: String,
    pub uptime: String,
    pub cpu: CpuMetrics,
    pub gpu: Vec<GpuMetrics>,
    pub ram: RamMetrics,
    pub storage: Vec<DriveMetrics>,
    pub network: NetworkMetrics,
    pub processes: Vec<ProcessInfo>,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            os_name: String::new(),
            uptime: String::new(),
            cpu: CpuMetrics::default(),
            gpu: Vec::new(),
            ram: RamMetrics::default(),
            storage: Vec::new(),
            network: NetworkMetrics::default(),
            processes: Vec::new(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuMetrics {
    pub name: String,
    pub usage: f64,
    pub temp: f64,
    pub power: f64,
    pub frequency: f64,
    pub fan_speed: f64,
    pub core_usage: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuMetrics {
    pub name: String,
    pub usage: f64,
    pub temp: f64,
    pub memory_used: f64,
    pub memory_total: f64,
    pub fan_speed: f64,
    pub power: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RamMetrics {
    #[serde(rename = "usedGB")]
    pub used_gb: f64,
    #[serde(rename = "totalGB")]
    pub total_gb: f64,
    #[serde(rename = "usedPercent")]
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveMetrics {
    pub name: String,
    pub mount: String,
    #[serde(rename = "usedGB")]
    pub used_gb: f64,
    #[serde(rename = "totalGB")]
    pub total_gb: f64,
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub upload_mbps: f64,
    pub download_mbps: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub id: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub time_label: String,
    pub cpu: f64,
    pub ram: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_dashboard_field_names() {
        let mut snap = Snapshot::empty(DateTime::<Utc>::UNIX_EPOCH);
        snap.ram.used_gb = 8.0;
        snap.storage.push(DriveMetrics {
            name: "nvme0n1".to_string(),
            mount: "/".to_string(),
            used_gb: 10.0,
            total_gb: 100.0,
            percent: 10.0,
            temp: None,
        });
        snap.processes.push(ProcessInfo {
            name: "postgres".to_string(),
            id: 42,
            memory_mb: 512.5,
        });

        let value = serde_json::to_value(&snap).unwrap();
        assert_eq!(value["osName"], "");
        assert_eq!(value["ram"]["usedGB"], 8.0);
        assert!(value["cpu"]["coreUsage"].is_array());
        assert!(value["gpu"].as_array().unwrap().is_empty());
        assert!(value["storage"][0].get("temp").is_none());
        assert_eq!(value["processes"][0]["memoryMB"], 512.5);
        assert_eq!(value["network"]["uploadMbps"], 0.0);
        assert_eq!(value["timestamp"], "1970-01-01T00:00:00Z");
    }
}
