//! Maps raw, vendor-named sensors onto canonical snapshot fields.
//!
//! Each category has a const table of [`Rule`]s. A rule fires for every
//! sensor whose kind and name match, so one sensor may feed several fields
//! and several sensors may feed one field (for example a max over candidates).

pub mod cpu;
pub mod devices;

use crate::hardware::{Sensor, SensorKind};
use tracing::trace;

pub use cpu::{cpu_fan, extract_cpu};
pub use devices::{accumulate_network, extract_drive, extract_gpu, extract_ram};

pub struct Rule<T> {
    pub field: &'static str,
    pub kinds: &'static [SensorKind],
    /// At least one must appear in the sensor name; empty means no constraint.
    pub any_of: &'static [&'static str],
    pub all_of: &'static [&'static str],
    pub none_of: &'static [&'static str],
    pub apply: fn(&mut T, &Sensor, f64),
}

impl<T> Rule<T> {
    pub fn matches(&self, sensor: &Sensor) -> bool {
        if !self.kinds.contains(&sensor.kind) {
            return false;
        }
        let name = &sensor.name;
        (self.any_of.is_empty() || self.any_of.iter().any(|p| contains_ci(name, p)))
            && self.all_of.iter().all(|p| contains_ci(name, p))
            && !self.none_of.iter().any(|p| contains_ci(name, p))
    }
}

/// Applies every matching rule to every sensor carrying a finite value.
pub fn apply_rules<T>(rules: &[Rule<T>], sensors: &[Sensor], target: &mut T) {
    for sensor in sensors {
        let Some(value) = sensor.value.filter(|v| v.is_finite()) else {
            continue;
        };
        for rule in rules.iter().filter(|r| r.matches(sensor)) {
            trace!(field = rule.field, sensor = %sensor.name, value, "правило сработало");
            (rule.apply)(target, sensor, value);
        }
    }
}

pub(crate) fn contains_ci(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
}
