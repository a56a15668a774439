use crate::snapshot::{MetricsSnapshot, TimingSummary};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Sink for counters, gauges, histogram observations, and timings.
///
/// Implementations must be cheap to call on the request path; the engine
/// reports a handful of metrics per request.
pub trait MetricsRecorder: Send + Sync {
    /// Increments the named counter by one.
    fn increment(&self, name: &str);

    /// Sets the named gauge to the given value.
    fn gauge(&self, name: &str, value: f64);

    /// Records one observation of the named histogram (e.g. a message size).
    fn observe(&self, name: &str, value: f64);

    /// Records one elapsed duration for the named timer.
    fn timing(&self, name: &str, elapsed: Duration);
}

/// A recorder that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn increment(&self, _name: &str) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn observe(&self, _name: &str, _value: f64) {}
    fn timing(&self, _name: &str, _elapsed: Duration) {}
}

/// Convenience for timing a span of code against a [`MetricsRecorder`].
///
/// # Example
///
/// ```
/// use soarpc_metrics::{MemoryMetrics, Stopwatch};
///
/// let metrics = MemoryMetrics::new();
/// let watch = Stopwatch::start();
/// // ... do work ...
/// watch.record(&metrics, "client.send");
/// ```
#[derive(Debug)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self { started: Instant::now() }
    }

    /// Reports the elapsed time since `start` under the given timer name.
    pub fn record(&self, metrics: &dyn MetricsRecorder, name: &str) {
        metrics.timing(name, self.started.elapsed());
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    observations: HashMap<String, Vec<f64>>,
    timings: HashMap<String, Vec<Duration>>,
}

/// A recorder that accumulates everything in memory.
///
/// Used by the test suites to assert on recorded metrics, and suitable for
/// periodic scraping in development. [`MemoryMetrics::snapshot`] produces a
/// serializable summary of the current state.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    state: Mutex<MemoryState>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of a counter, or zero if never incremented.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.state.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Returns the current value of a gauge, if it has ever been set.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.state.lock().gauges.get(name).copied()
    }

    /// Takes a snapshot of all recorded metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            counters: state.counters.clone(),
            gauges: state.gauges.clone(),
            observations: state
                .observations
                .iter()
                .map(|(name, values)| (name.clone(), TimingSummary::from_values(values)))
                .collect(),
            timings: state
                .timings
                .iter()
                .map(|(name, durations)| {
                    let values: Vec<f64> =
                        durations.iter().map(|d| d.as_secs_f64() * 1_000_000.0).collect();
                    (name.clone(), TimingSummary::from_values(&values))
                })
                .collect(),
        }
    }
}

impl MetricsRecorder for MemoryMetrics {
    fn increment(&self, name: &str) {
        *self.state.lock().counters.entry(name.to_owned()).or_insert(0) += 1;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.state.lock().gauges.insert(name.to_owned(), value);
    }

    fn observe(&self, name: &str, value: f64) {
        self.state.lock().observations.entry(name.to_owned()).or_default().push(value);
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        self.state.lock().timings.entry(name.to_owned()).or_default().push(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_accepts_everything() {
        let metrics = NoopMetrics;
        metrics.increment("a.b");
        metrics.gauge("a.b", 1.0);
        metrics.observe("a.b", 2.0);
        metrics.timing("a.b", Duration::from_millis(5));
    }

    #[test]
    fn test_memory_counters_accumulate() {
        let metrics = MemoryMetrics::new();
        metrics.increment("send.attempts");
        metrics.increment("send.attempts");
        metrics.increment("send.error.queue_full");

        assert_eq!(metrics.counter_value("send.attempts"), 2);
        assert_eq!(metrics.counter_value("send.error.queue_full"), 1);
        assert_eq!(metrics.counter_value("never.recorded"), 0);
    }

    #[test]
    fn test_memory_gauge_keeps_last_value() {
        let metrics = MemoryMetrics::new();
        metrics.gauge("server.worker.busy", 1.0);
        metrics.gauge("server.worker.busy", 0.0);
        assert_eq!(metrics.gauge_value("server.worker.busy"), Some(0.0));
    }

    #[test]
    fn test_snapshot_summarizes_observations() {
        let metrics = MemoryMetrics::new();
        metrics.observe("send.message_size", 100.0);
        metrics.observe("send.message_size", 300.0);

        let snapshot = metrics.snapshot();
        let summary = &snapshot.observations["send.message_size"];
        assert_eq!(summary.count, 2);
        assert_eq!(summary.max, 300.0);
        assert_eq!(summary.mean, 200.0);
    }

    #[test]
    fn test_stopwatch_records_timing() {
        let metrics = MemoryMetrics::new();
        let watch = Stopwatch::start();
        watch.record(&metrics, "client.receive");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.timings["client.receive"].count, 1);
    }
}
