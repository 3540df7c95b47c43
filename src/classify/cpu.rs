use crate::classify::{apply_rules, contains_ci, Rule};
use crate::hardware::{HardwareCategory, HardwareNode, SensorKind};
use crate::snapshot::CpuMetrics;
use std::cmp::Ordering;
use std::collections::HashMap;

const NO_WORDS: &[&str] = &[];

pub const CPU_RULES: &[Rule<CpuMetrics>] = &[
    Rule {
        field: "usage",
        kinds: &[SensorKind::Load],
        any_of: NO_WORDS,
        all_of: &["Total"],
        none_of: NO_WORDS,
        apply: |cpu, _, v| cpu.usage = v,
    },
    Rule {
        field: "temp",
        kinds: &[SensorKind::Temperature],
        any_of: &["Package", "Average", "Tctl", "Tdie"],
        all_of: NO_WORDS,
        none_of: NO_WORDS,
        apply: |cpu, _, v| cpu.temp = cpu.temp.max(v),
    },
    Rule {
        field: "power",
        kinds: &[SensorKind::Power],
        any_of: NO_WORDS,
        all_of: &["Package"],
        none_of: NO_WORDS,
        apply: |cpu, _, v| cpu.power = v,
    },
    Rule {
        field: "frequency",
        kinds: &[SensorKind::Clock],
        any_of: NO_WORDS,
        all_of: NO_WORDS,
        none_of: NO_WORDS,
        apply: |cpu, _, v| cpu.frequency = cpu.frequency.max(v),
    },
];

pub const CORE_LOAD_RULES: &[Rule<HashMap<String, f64>>] = &[Rule {
    field: "coreUsage",
    kinds: &[SensorKind::Load],
    any_of: &["Core", "CPU #", "Thread"],
    all_of: NO_WORDS,
    none_of: &["Total"],
    apply: |cores, sensor, v| {
        cores.insert(sensor.name.clone(), v);
    },
}];

pub fn extract_cpu(node: &HardwareNode) -> CpuMetrics {
    let mut cpu = CpuMetrics {
        name: node.name.clone(),
        ..CpuMetrics::default()
    };
    apply_rules(CPU_RULES, &node.sensors, &mut cpu);

    let mut cores = HashMap::new();
    apply_rules(CORE_LOAD_RULES, &node.sensors, &mut cores);
    let mut cores: Vec<(String, f64)> = cores.into_iter().collect();
    cores.sort_by(|a, b| natural_order(&a.0, &b.0));
    cpu.core_usage = cores.into_iter().map(|(_, v)| v).collect();

    cpu
}

/// Orders by the first embedded integer; names without digits go last.
/// Equal numbers fall back to plain name order.
pub fn natural_order(a: &str, b: &str) -> Ordering {
    match (first_number(a), first_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn first_number(name: &str) -> Option<u64> {
    let start = name.find(|c: char| c.is_ascii_digit())?;
    let digits: String = name[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// CPU fan speed from the motherboard controllers. A fan labelled "CPU"
/// wins; otherwise the first "Fan #1"; otherwise 0.
pub fn cpu_fan(roots: &[HardwareNode]) -> f64 {
    let mut fallback = None;
    let boards = roots
        .iter()
        .filter(|n| matches!(n.category, HardwareCategory::Motherboard | HardwareCategory::SuperIo));
    for node in boards.flat_map(|n| n.walk()) {
        for sensor in node.sensors.iter().filter(|s| s.kind == SensorKind::Fan) {
            let Some(rpm) = sensor.value.filter(|v| v.is_finite()) else {
                continue;
            };
            if contains_ci(&sensor.name, "CPU") {
                return rpm;
            }
            if fallback.is_none() && is_first_fan(&sensor.name) {
                fallback = Some(rpm);
            }
        }
    }
    fallback.unwrap_or(0.0)
}

fn is_first_fan(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.match_indices("fan #1").any(|(i, m)| {
        !lower[i + m.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}
