//! Metrics recording for soarpc clients and servers.
//!
//! Every transport, client, and server component takes an
//! [`MetricsRecorder`] at construction and reports counters, gauges, and
//! timings through it. The recorder is a plug-in sink: production services
//! wire in an exporter of their choosing, the test suite uses
//! [`MemoryMetrics`] to assert on what was recorded, and everything else
//! defaults to [`NoopMetrics`].
//!
//! # Metric Names
//!
//! Names are dotted paths, prefixed by the reporting side, e.g.
//! `client.transport.redis_gateway.send.error.queue_full` or
//! `server.worker.startup`. The recorder does not interpret names.

mod recorder;
mod snapshot;

pub use recorder::{MemoryMetrics, MetricsRecorder, NoopMetrics, Stopwatch};
pub use snapshot::{MetricsSnapshot, TimingSummary};
