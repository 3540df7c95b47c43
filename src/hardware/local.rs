use crate::hardware::{
    HardwareCategory, HardwareNode, HostInfo, ProcessSample, ProviderError, Sensor, SensorKind,
    SensorProvider,
};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use sysinfo::{
    ComponentExt, CpuExt, DiskExt, NetworkExt, NetworksExt, PidExt, ProcessExt, System, SystemExt,
};
use tracing::debug;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const NETWORK_MIN_SAMPLE: Duration = Duration::from_millis(500);
const NVIDIA_PREFIX: &str = "/gpu-nvidia/";
const AMD_PREFIX: &str = "/gpu-amd/";
const SKIPPED_FILE_SYSTEMS: [&str; 6] = ["squashfs", "overlay", "tmpfs", "devtmpfs", "proc", "sysfs"];
const SKIPPED_HWMON_CHIPS: [&str; 6] = ["amdgpu", "nouveau", "nvme", "radeon", "coretemp", "k10temp"];
const MAX_FAN_INPUTS: usize = 16;

/// Sensor backend for the machine the daemon runs on: `sysinfo` for CPU,
/// memory, disks and network; `nvidia-smi` and DRM sysfs for GPUs; hwmon and
/// powercap sysfs for fans and package power.
pub struct LocalProvider {
    system: System,
    rapl: Option<RaplCounter>,
    network_sampled_at: Option<Instant>,
    network_elapsed: Duration,
}

impl LocalProvider {
    pub fn open() -> Result<Self, ProviderError> {
        if !System::IS_SUPPORTED {
            return Err(ProviderError::Unsupported);
        }
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks_list();
        system.refresh_networks_list();
        system.refresh_components_list();

        let rapl = match RaplCounter::open(Path::new(RAPL_PACKAGE)) {
            Ok(counter) => Some(counter),
            Err(err) => {
                debug!(error = %err, "счётчик RAPL недоступен, мощность CPU не будет собираться");
                None
            }
        };

        Ok(Self {
            system,
            rapl,
            network_sampled_at: None,
            network_elapsed: Duration::ZERO,
        })
    }

    fn cpu_node(&self) -> HardwareNode {
        let brand = self
            .system
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "CPU".to_string());
        HardwareNode::new(HardwareCategory::Cpu, "/cpu/0", brand)
    }

    fn refresh_cpu(&mut self, node: &mut HardwareNode) -> Result<(), ProviderError> {
        self.system.refresh_cpu();
        self.system.refresh_components();

        let mut sensors = vec![Sensor::new(
            SensorKind::Load,
            "CPU Total",
            Some(self.system.global_cpu_info().cpu_usage() as f64),
        )];
        for (i, cpu) in self.system.cpus().iter().enumerate() {
            let n = i + 1;
            sensors.push(Sensor::new(
                SensorKind::Load,
                format!("CPU Core #{n}"),
                Some(cpu.cpu_usage() as f64),
            ));
            sensors.push(Sensor::new(
                SensorKind::Clock,
                format!("Core #{n}"),
                Some(cpu.frequency() as f64),
            ));
        }
        for component in self.system.components() {
            if is_cpu_temp_label(component.label()) && component.temperature() > 0.0 {
                sensors.push(Sensor::new(
                    SensorKind::Temperature,
                    component.label(),
                    Some(component.temperature() as f64),
                ));
            }
        }
        if let Some(rapl) = self.rapl.as_mut() {
            match rapl.sample() {
                Ok(watts) => sensors.push(Sensor::new(SensorKind::Power, "CPU Package", watts)),
                Err(err) => debug!(error = %err, "не удалось прочитать RAPL"),
            }
        }

        node.sensors = sensors;
        Ok(())
    }

    fn memory_node(&self) -> HardwareNode {
        HardwareNode::new(HardwareCategory::Memory, "/ram", "Generic Memory")
    }

    fn refresh_memory(&mut self, node: &mut HardwareNode) -> Result<(), ProviderError> {
        self.system.refresh_memory();
        let total = self.system.total_memory() as f64;
        let used = self.system.used_memory() as f64;
        let available = self.system.available_memory() as f64;
        let percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };

        node.sensors = vec![
            Sensor::new(SensorKind::Data, "Memory Used", Some(used / BYTES_PER_GB)),
            Sensor::new(SensorKind::Data, "Memory Available", Some(available / BYTES_PER_GB)),
            Sensor::new(SensorKind::Load, "Memory", Some(percent)),
        ];
        Ok(())
    }

    fn storage_nodes(&self) -> Vec<HardwareNode> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for disk in self.system.disks() {
            let fs_type = String::from_utf8_lossy(disk.file_system()).to_lowercase();
            if SKIPPED_FILE_SYSTEMS.iter().any(|s| fs_type == *s) {
                continue;
            }
            let name = disk.name().to_string_lossy().to_string();
            if !seen.insert(name.clone()) {
                continue;
            }
            let mount = disk.mount_point().to_string_lossy().to_string();
            out.push(
                HardwareNode::new(
                    HardwareCategory::Storage,
                    format!("/storage/{}", out.len()),
                    name,
                )
                .at(mount),
            );
        }
        out
    }

    fn refresh_storage(&mut self, node: &mut HardwareNode) -> Result<(), ProviderError> {
        let mount = node.location.clone().unwrap_or_default();
        let disk = self
            .system
            .disks_mut()
            .iter_mut()
            .find(|d| d.mount_point() == Path::new(&mount))
            .ok_or_else(|| ProviderError::NodeGone(node.identifier.clone()))?;
        disk.refresh();

        let total = disk.total_space() as f64;
        let used = total - disk.available_space() as f64;
        let percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
        node.sensors = vec![
            Sensor::new(SensorKind::Load, "Used Space", Some(percent)),
            Sensor::new(SensorKind::Data, "Used Space", Some(used / BYTES_PER_GB)),
            Sensor::new(SensorKind::Data, "Total Space", Some(total / BYTES_PER_GB)),
        ];
        Ok(())
    }

    fn network_nodes(&self) -> Vec<HardwareNode> {
        let mut names: Vec<String> = self
            .system
            .networks()
            .iter()
            .map(|(iface, _)| iface.to_string())
            .filter(|iface| iface != "lo")
            .collect();
        names.sort();
        names
            .into_iter()
            .map(|iface| {
                HardwareNode::new(HardwareCategory::Network, format!("/nic/{iface}"), &iface)
                    .at(iface)
            })
            .collect()
    }

    /// Network counters are deltas since the previous refresh, so all
    /// adapters share one sample per poll.
    fn sample_networks(&mut self) {
        let now = Instant::now();
        match self.network_sampled_at {
            Some(at) if now.duration_since(at) < NETWORK_MIN_SAMPLE => {}
            Some(at) => {
                self.system.refresh_networks();
                self.network_elapsed = now.duration_since(at);
                self.network_sampled_at = Some(now);
            }
            None => {
                self.system.refresh_networks();
                self.network_elapsed = Duration::ZERO;
                self.network_sampled_at = Some(now);
            }
        }
    }

    fn refresh_network(&mut self, node: &mut HardwareNode) -> Result<(), ProviderError> {
        self.sample_networks();
        let iface = node.location.as_deref().unwrap_or_default();
        let (_, data) = self
            .system
            .networks()
            .iter()
            .find(|(name, _)| name.as_str() == iface)
            .ok_or_else(|| ProviderError::NodeGone(node.identifier.clone()))?;

        let secs = self.network_elapsed.as_secs_f64();
        let (up, down) = if secs > 0.0 {
            (
                data.transmitted() as f64 / secs,
                data.received() as f64 / secs,
            )
        } else {
            (0.0, 0.0)
        };
        node.sensors = vec![
            Sensor::new(SensorKind::Throughput, "Upload Speed", Some(up)),
            Sensor::new(SensorKind::Throughput, "Download Speed", Some(down)),
        ];
        Ok(())
    }
}

impl SensorProvider for LocalProvider {
    fn discover(&mut self) -> Result<Vec<HardwareNode>, ProviderError> {
        let mut roots = vec![self.cpu_node()];
        roots.extend(discover_nvidia_gpus());
        roots.extend(discover_amd_gpus());
        roots.push(self.memory_node());
        roots.extend(self.storage_nodes());
        roots.extend(self.network_nodes());
        if let Some(board) = discover_motherboard() {
            roots.push(board);
        }

        if self.system.cpus().is_empty() && self.system.total_memory() == 0 {
            return Err(ProviderError::NoSensors);
        }
        debug!(nodes = roots.len(), "обнаружено оборудование");
        Ok(roots)
    }

    fn refresh(&mut self, node: &mut HardwareNode) -> Result<(), ProviderError> {
        match node.category {
            HardwareCategory::Cpu => self.refresh_cpu(node),
            HardwareCategory::Gpu if node.identifier.starts_with(NVIDIA_PREFIX) => {
                refresh_nvidia_gpu(node)
            }
            HardwareCategory::Gpu => refresh_amd_gpu(node),
            HardwareCategory::Memory => self.refresh_memory(node),
            HardwareCategory::Storage => self.refresh_storage(node),
            HardwareCategory::Network => self.refresh_network(node),
            HardwareCategory::Motherboard => Ok(()),
            HardwareCategory::SuperIo => refresh_fan_chip(node),
        }
    }

    fn host_info(&mut self, top_n: usize) -> HostInfo {
        self.system.refresh_processes();
        let mut processes: Vec<ProcessSample> = self
            .system
            .processes()
            .iter()
            .map(|(pid, p)| ProcessSample {
                name: p.name().to_string(),
                pid: pid.as_u32(),
                memory_bytes: p.memory(),
            })
            .collect();
        processes.sort_by(|a, b| b.memory_bytes.cmp(&a.memory_bytes));
        processes.truncate(top_n);

        let os_name = self
            .system
            .long_os_version()
            .or_else(|| self.system.name())
            .unwrap_or_default();

        HostInfo {
            os_name,
            uptime_secs: self.system.uptime(),
            processes,
        }
    }

    fn close(&mut self) {
        self.rapl = None;
        debug!("локальный провайдер датчиков закрыт");
    }
}

fn is_cpu_temp_label(label: &str) -> bool {
    let lower = label.to_lowercase();
    let has_gpu_marker = ["gpu", "nvidia", "amdgpu", "radeon"]
        .iter()
        .any(|m| lower.contains(m));
    if has_gpu_marker {
        return false;
    }
    ["coretemp", "k10temp", "zenpower", "cpu", "package", "tctl", "tdie"]
        .iter()
        .any(|m| lower.contains(m))
}

const RAPL_PACKAGE: &str = "/sys/class/powercap/intel-rapl:0";

/// Package energy counter. Power is the energy delta between two samples.
struct RaplCounter {
    energy_path: PathBuf,
    max_range_uj: u64,
    last: Option<(u64, Instant)>,
}

impl RaplCounter {
    fn open(dir: &Path) -> Result<Self, ProviderError> {
        let energy_path = dir.join("energy_uj");
        read_number(&energy_path)?;
        let max_range_uj = read_number(&dir.join("max_energy_range_uj"))
            .map(|v| v as u64)
            .unwrap_or(u64::MAX);
        Ok(Self {
            energy_path,
            max_range_uj,
            last: None,
        })
    }

    fn sample(&mut self) -> Result<Option<f64>, ProviderError> {
        let now = Instant::now();
        let energy = read_number(&self.energy_path)? as u64;
        let watts = self.last.and_then(|(prev, at)| {
            let secs = now.duration_since(at).as_secs_f64();
            if secs <= 0.0 {
                return None;
            }
            let delta = if energy >= prev {
                energy - prev
            } else {
                self.max_range_uj.saturating_sub(prev).saturating_add(energy)
            };
            Some(delta as f64 / 1_000_000.0 / secs)
        });
        self.last = Some((energy, now));
        Ok(watts)
    }
}

fn discover_nvidia_gpus() -> Vec<HardwareNode> {
    let Some(rows) = query_nvidia_smi(None) else {
        return Vec::new();
    };
    rows.into_iter()
        .map(|row| {
            let mut node = HardwareNode::new(
                HardwareCategory::Gpu,
                format!("{NVIDIA_PREFIX}{}", row.index),
                row.name.clone(),
            )
            .at(row.index.clone());
            node.sensors = row.sensors();
            node
        })
        .collect()
}

fn refresh_nvidia_gpu(node: &mut HardwareNode) -> Result<(), ProviderError> {
    let index = node.location.clone().unwrap_or_default();
    let row = query_nvidia_smi(Some(&index))
        .and_then(|rows| rows.into_iter().next())
        .ok_or_else(|| ProviderError::NodeGone(node.identifier.clone()))?;
    node.sensors = row.sensors();
    Ok(())
}

struct NvidiaRow {
    index: String,
    name: String,
    utilization: Option<f64>,
    temperature: Option<f64>,
    memory_used_mb: Option<f64>,
    memory_total_mb: Option<f64>,
    fan_percent: Option<f64>,
    power_watts: Option<f64>,
}

impl NvidiaRow {
    fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split(',').map(|v| v.trim()).collect();
        if parts.len() < 8 {
            return None;
        }
        Some(Self {
            index: parts[0].to_string(),
            name: parts[1].to_string(),
            utilization: parse_reading(parts[2]),
            temperature: parse_reading(parts[3]),
            memory_used_mb: parse_reading(parts[4]),
            memory_total_mb: parse_reading(parts[5]),
            fan_percent: parse_reading(parts[6]),
            power_watts: parse_reading(parts[7]),
        })
    }

    fn sensors(&self) -> Vec<Sensor> {
        vec![
            Sensor::new(SensorKind::Load, "GPU Core", self.utilization),
            Sensor::new(SensorKind::Temperature, "GPU Core", self.temperature),
            Sensor::new(SensorKind::SmallData, "GPU Memory Used", self.memory_used_mb),
            Sensor::new(SensorKind::SmallData, "GPU Memory Total", self.memory_total_mb),
            Sensor::new(SensorKind::Fan, "GPU Fan", self.fan_percent),
            Sensor::new(SensorKind::Power, "GPU Package", self.power_watts),
        ]
    }
}

fn query_nvidia_smi(index: Option<&str>) -> Option<Vec<NvidiaRow>> {
    let mut args = vec![
        "--query-gpu=index,name,utilization.gpu,temperature.gpu,memory.used,memory.total,fan.speed,power.draw".to_string(),
        "--format=csv,noheader,nounits".to_string(),
    ];
    if let Some(index) = index {
        args.push(format!("--id={index}"));
    }
    let output = run_nvidia_smi(&args)?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.lines().filter_map(NvidiaRow::parse).collect())
}

fn run_nvidia_smi(args: &[String]) -> Option<std::process::Output> {
    if let Ok(output) = Command::new("nvidia-smi").args(args).output() {
        return Some(output);
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(output) = Command::new(r"C:\Windows\System32\nvidia-smi.exe")
            .args(args)
            .output()
        {
            return Some(output);
        }
    }

    None
}

#[cfg(target_os = "linux")]
fn discover_amd_gpus() -> Vec<HardwareNode> {
    let Ok(entries) = fs::read_dir("/sys/class/drm") else {
        return Vec::new();
    };
    let mut cards: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("card") || name.contains('-') {
                return None;
            }
            let device = entry.path().join("device");
            let vendor = read_trimmed(&device.join("vendor")).ok()?;
            (vendor == "0x1002").then_some((name, device))
        })
        .collect();
    cards.sort();

    cards
        .into_iter()
        .map(|(card, device)| {
            let name = read_trimmed(&device.join("product_name"))
                .ok()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "AMD Radeon GPU".to_string());
            HardwareNode::new(HardwareCategory::Gpu, format!("{AMD_PREFIX}{card}"), name)
                .at(device.to_string_lossy())
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn discover_amd_gpus() -> Vec<HardwareNode> {
    Vec::new()
}

fn refresh_amd_gpu(node: &mut HardwareNode) -> Result<(), ProviderError> {
    let device = PathBuf::from(node.location.clone().unwrap_or_default());
    if !device.exists() {
        return Err(ProviderError::NodeGone(node.identifier.clone()));
    }
    let hwmon = first_hwmon_dir(&device);
    let from_hwmon = |file: &str, scale: f64| {
        hwmon
            .as_ref()
            .and_then(|dir| read_number(&dir.join(file)).ok())
            .map(|v| v / scale)
    };
    let vram = |file: &str| {
        read_number(&device.join(file))
            .ok()
            .map(|v| v / (1024.0 * 1024.0))
    };

    node.sensors = vec![
        Sensor::new(
            SensorKind::Load,
            "GPU Core",
            read_number(&device.join("gpu_busy_percent")).ok(),
        ),
        Sensor::new(SensorKind::Temperature, "GPU Core", from_hwmon("temp1_input", 1000.0)),
        Sensor::new(SensorKind::SmallData, "GPU Memory Used", vram("mem_info_vram_used")),
        Sensor::new(SensorKind::SmallData, "GPU Memory Total", vram("mem_info_vram_total")),
        Sensor::new(SensorKind::Fan, "GPU Fan", from_hwmon("fan1_input", 1.0)),
        Sensor::new(SensorKind::Power, "GPU Package", from_hwmon("power1_average", 1_000_000.0)),
    ];
    Ok(())
}

fn first_hwmon_dir(device: &Path) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(device.join("hwmon"))
        .ok()?
        .flatten()
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs.into_iter().next()
}

#[cfg(target_os = "linux")]
fn discover_motherboard() -> Option<HardwareNode> {
    let vendor = read_trimmed(Path::new("/sys/class/dmi/id/board_vendor")).unwrap_or_default();
    let board = read_trimmed(Path::new("/sys/class/dmi/id/board_name")).unwrap_or_default();
    let name = match (vendor.is_empty(), board.is_empty()) {
        (false, false) => format!("{vendor} {board}"),
        (true, false) => board,
        (false, true) => vendor,
        (true, true) => "Motherboard".to_string(),
    };

    let mut node = HardwareNode::new(HardwareCategory::Motherboard, "/motherboard", name);
    node.children = discover_fan_chips(Path::new("/sys/class/hwmon"));
    Some(node)
}

#[cfg(not(target_os = "linux"))]
fn discover_motherboard() -> Option<HardwareNode> {
    None
}

fn discover_fan_chips(root: &Path) -> Vec<HardwareNode> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    dirs.sort();

    dirs.into_iter()
        .filter_map(|dir| {
            let chip = read_trimmed(&dir.join("name")).ok()?;
            if SKIPPED_HWMON_CHIPS.contains(&chip.as_str()) {
                return None;
            }
            let fans = read_fans(&dir);
            if fans.is_empty() {
                return None;
            }
            let hwmon = dir.file_name()?.to_string_lossy().to_string();
            let mut node =
                HardwareNode::new(HardwareCategory::SuperIo, format!("/lpc/{chip}/{hwmon}"), chip)
                    .at(dir.to_string_lossy());
            node.sensors = fans;
            Some(node)
        })
        .collect()
}

fn refresh_fan_chip(node: &mut HardwareNode) -> Result<(), ProviderError> {
    let dir = PathBuf::from(node.location.clone().unwrap_or_default());
    if !dir.exists() {
        return Err(ProviderError::NodeGone(node.identifier.clone()));
    }
    node.sensors = read_fans(&dir);
    Ok(())
}

fn read_fans(dir: &Path) -> Vec<Sensor> {
    (1..=MAX_FAN_INPUTS)
        .filter_map(|n| {
            let rpm = read_number(&dir.join(format!("fan{n}_input"))).ok()?;
            let label = read_trimmed(&dir.join(format!("fan{n}_label")))
                .ok()
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| format!("Fan #{n}"));
            Some(Sensor::new(SensorKind::Fan, label, Some(rpm)))
        })
        .collect()
}

fn read_trimmed(path: &Path) -> Result<String, ProviderError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| match source.kind() {
            ErrorKind::PermissionDenied => {
                ProviderError::PermissionDenied(path.display().to_string())
            }
            _ => ProviderError::Io {
                path: path.to_path_buf(),
                source,
            },
        })
}

/// Leading number of a reading such as `"45 %"`, `"120,5 W"` or `" 61 "`.
/// Placeholders like `[N/A]` give `None`.
pub(crate) fn parse_reading(text: &str) -> Option<f64> {
    let text = text.trim();
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+' | 'e' | 'E')))
        .unwrap_or(text.len());
    let number = text[..end].trim_end_matches(['e', 'E']).replace(',', ".");
    number.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn read_number(path: &Path) -> Result<f64, ProviderError> {
    let text = read_trimmed(path)?;
    parse_reading(&text).ok_or_else(|| ProviderError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(ErrorKind::InvalidData, format!("не число: {text}")),
    })
}
