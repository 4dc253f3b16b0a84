//! Metric emission interface
//!
//! The core never talks to a metrics backend directly. Selection outcomes and
//! lifecycle transitions are reported through a [`MetricsSink`]; the
//! `dpf-observability` crate provides a Prometheus-backed sink.

use parking_lot::Mutex;

/// Metric names emitted by this crate
pub mod names {
    /// Counter, tags: `outcome`, `strategy`
    pub const SELECTION_TOTAL: &str = "dpf_selection_total";
    /// Counter, tags: `state`
    pub const TRANSFER_TRANSITIONS_TOTAL: &str = "dpf_transfer_transitions_total";
    /// Counter, tags: `outcome`
    pub const TRANSFER_RETRIES_TOTAL: &str = "dpf_transfer_retries_total";
    /// Gauge, no tags
    pub const REGISTERED_INSTANCES: &str = "dpf_registered_instances";
}

/// Kind of a metric sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonic increment by `value`
    Counter,
    /// Absolute value
    Gauge,
}

/// A single metric sample
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Vec<(&'static str, String)>,
}

impl Metric {
    pub fn counter(name: &'static str, value: f64) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            value,
            tags: Vec::new(),
        }
    }

    pub fn gauge(name: &'static str, value: f64) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
            value,
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.tags.push((key, value.into()));
        self
    }

    /// Value of a tag, if present
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Receiver of metric samples
pub trait MetricsSink: Send + Sync {
    fn emit(&self, metric: Metric);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn emit(&self, _metric: Metric) {}
}

/// Keeps every sample in memory; used by tests
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    samples: Mutex<Vec<Metric>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all samples recorded so far
    pub fn samples(&self) -> Vec<Metric> {
        self.samples.lock().clone()
    }

    /// Sum of all counter increments for `name` whose tags include `tag`
    pub fn counter_total(&self, name: &str, tag: Option<(&str, &str)>) -> f64 {
        self.samples
            .lock()
            .iter()
            .filter(|m| m.kind == MetricKind::Counter && m.name == name)
            .filter(|m| match tag {
                Some((k, v)) => m.tag_value(k) == Some(v),
                None => true,
            })
            .map(|m| m.value)
            .sum()
    }

    /// Most recent value of a gauge
    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.samples
            .lock()
            .iter()
            .rev()
            .find(|m| m.kind == MetricKind::Gauge && m.name == name)
            .map(|m| m.value)
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

impl MetricsSink for RecordingMetrics {
    fn emit(&self, metric: Metric) {
        self.samples.lock().push(metric);
    }
}
