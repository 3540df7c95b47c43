pub mod local;
pub mod refresh;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareCategory {
    Cpu,
    Gpu,
    Memory,
    Storage,
    Network,
    Motherboard,
    SuperIo,
}

impl HardwareCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Memory => "memory",
            Self::Storage => "storage",
            Self::Network => "network",
            Self::Motherboard => "motherboard",
            Self::SuperIo => "superio",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Load,
    Temperature,
    Power,
    Clock,
    Fan,
    /// Gigabytes.
    Data,
    /// Megabytes.
    SmallData,
    /// Bytes per second.
    Throughput,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    pub kind: SensorKind,
    pub name: String,
    pub value: Option<f64>,
}

impl Sensor {
    pub fn new(kind: SensorKind, name: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            kind,
            name: name.into(),
            value,
        }
    }
}

/// One component in the hardware tree. Children are owned, so the tree can
/// never contain a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareNode {
    pub category: HardwareCategory,
    pub identifier: String,
    pub name: String,
    /// Mount point, sysfs directory or interface name, depending on category.
    pub location: Option<String>,
    pub sensors: Vec<Sensor>,
    pub children: Vec<HardwareNode>,
}

impl HardwareNode {
    pub fn new(
        category: HardwareCategory,
        identifier: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            category,
            identifier: identifier.into(),
            name: name.into(),
            location: None,
            sensors: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    #[cfg(test)]
    pub fn with_sensor(mut self, kind: SensorKind, name: &str, value: Option<f64>) -> Self {
        self.sensors.push(Sensor::new(kind, name, value));
        self
    }

    #[cfg(test)]
    pub fn with_child(mut self, child: HardwareNode) -> Self {
        self.children.push(child);
        self
    }

    /// Pre-order walk over this node and all of its descendants.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }
}

pub struct Walk<'a> {
    stack: Vec<&'a HardwareNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a HardwareNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSample {
    pub name: String,
    pub pid: u32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostInfo {
    pub os_name: String,
    pub uptime_secs: u64,
    pub processes: Vec<ProcessSample>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("платформа не поддерживается")]
    Unsupported,
    #[error("недостаточно прав для чтения {0}")]
    PermissionDenied(String),
    #[error("устройство {0} больше не доступно")]
    NodeGone(String),
    #[error("ошибка чтения {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("не найдено ни одного датчика")]
    NoSensors,
}

/// Backend that discovers the hardware tree and re-reads sensor values.
///
/// All calls are blocking and are expected to run off the async executor.
pub trait SensorProvider: Send {
    fn discover(&mut self) -> Result<Vec<HardwareNode>, ProviderError>;

    /// Re-reads the sensors owned by `node` only. Children are refreshed by
    /// the caller.
    fn refresh(&mut self, node: &mut HardwareNode) -> Result<(), ProviderError>;

    fn host_info(&mut self, top_n: usize) -> HostInfo;

    fn close(&mut self) {}
}
