use crate::snapshot::{HistoryPoint, Snapshot};
use chrono::Local;
use std::collections::VecDeque;

impl HistoryPoint {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            time_label: snapshot
                .timestamp
                .with_timezone(&Local)
                .format("%H:%M:%S")
                .to_string(),
            cpu: snapshot.cpu.usage,
            ram: snapshot.ram.used_percent,
        }
    }
}

/// Fixed-capacity chart buffer; the oldest point is evicted first.
#[derive(Debug, Clone)]
pub struct History {
    capacity: usize,
    points: VecDeque<HistoryPoint>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: HistoryPoint) {
        if self.capacity == 0 {
            return;
        }
        while self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike, Utc};

    fn point(cpu: f64) -> HistoryPoint {
        HistoryPoint {
            time_label: String::new(),
            cpu,
            ram: 0.0,
        }
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut history = History::new(3);
        for i in 1..=5 {
            history.push(point(i as f64));
            assert!(history.len() <= 3);
        }
        let cpu: Vec<f64> = history.to_vec().iter().map(|p| p.cpu).collect();
        assert_eq!(cpu, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut history = History::new(0);
        history.push(point(1.0));
        assert!(history.is_empty());
    }

    #[test]
    fn label_is_local_wall_clock() {
        let mut snap = Snapshot::empty(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
        snap.cpu.usage = 17.0;
        snap.ram.used_percent = 64.0;

        let p = HistoryPoint::from_snapshot(&snap);
        let local = snap.timestamp.with_timezone(&Local);
        assert_eq!(
            p.time_label,
            format!("{:02}:{:02}:{:02}", local.hour(), local.minute(), local.second())
        );
        assert_eq!(p.cpu, 17.0);
        assert_eq!(p.ram, 64.0);
    }
}
