use serde::Serialize;
use std::collections::HashMap;

/// Summary statistics over the values recorded for one histogram or timer.
///
/// Timer values are reported in microseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl TimingSummary {
    pub(crate) fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self { count: 0, min: 0.0, max: 0.0, mean: 0.0 };
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut total = 0.0;
        for &value in values {
            min = min.min(value);
            max = max.max(value);
            total += value;
        }
        Self { count: values.len() as u64, min, max, mean: total / values.len() as f64 }
    }
}

/// A point-in-time summary of everything a [`MemoryMetrics`] has recorded.
///
/// [`MemoryMetrics`]: crate::MemoryMetrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub observations: HashMap<String, TimingSummary>,
    pub timings: HashMap<String, TimingSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_of_empty_values() {
        let summary = TimingSummary::from_values(&[]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.mean, 0.0);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let snapshot = MetricsSnapshot {
            counters: HashMap::from([("requests".to_owned(), 3)]),
            gauges: HashMap::new(),
            observations: HashMap::new(),
            timings: HashMap::new(),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["counters"]["requests"], 3);
    }
}
