//! Prometheus metrics for the data-plane selector
//!
//! [`PrometheusMetrics`] implements the core's [`MetricsSink`] and keeps
//! one collector per metric name the core emits:
//!
//! | name | type | labels |
//! |------|------|--------|
//! | `dpf_selection_total` | counter | `outcome`, `strategy` |
//! | `dpf_transfer_transitions_total` | counter | `state` |
//! | `dpf_transfer_retries_total` | counter | `outcome` |
//! | `dpf_registered_instances` | gauge | |

use dpf_core_selector::metrics::{names, Metric, MetricKind, MetricsSink};
use prometheus::{CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ObservabilityError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics output is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, ObservabilityError>;

const SELECTION_LABELS: &[&str] = &["outcome", "strategy"];
const TRANSITION_LABELS: &[&str] = &["state"];
const RETRY_LABELS: &[&str] = &["outcome"];

/// Metrics sink backed by its own Prometheus registry
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    selections: CounterVec,
    transitions: CounterVec,
    retries: CounterVec,
    registered: Gauge,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let selections = CounterVec::new(
            Opts::new(
                names::SELECTION_TOTAL,
                "Selection decisions by outcome and strategy",
            ),
            SELECTION_LABELS,
        )?;
        registry.register(Box::new(selections.clone()))?;

        let transitions = CounterVec::new(
            Opts::new(
                names::TRANSFER_TRANSITIONS_TOTAL,
                "Transfer lifecycle transitions by target state",
            ),
            TRANSITION_LABELS,
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let retries = CounterVec::new(
            Opts::new(
                names::TRANSFER_RETRIES_TOTAL,
                "Re-selection attempts after transfer failures",
            ),
            RETRY_LABELS,
        )?;
        registry.register(Box::new(retries.clone()))?;

        let registered = Gauge::with_opts(Opts::new(
            names::REGISTERED_INSTANCES,
            "Data-plane instances currently registered",
        ))?;
        registry.register(Box::new(registered.clone()))?;

        Ok(Self {
            registry,
            selections,
            transitions,
            retries,
            registered,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Metrics in Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    fn counter(&self, metric: &Metric, vec: &CounterVec, labels: &[&str]) {
        let values: Vec<&str> = labels
            .iter()
            .map(|label| metric.tag_value(label).unwrap_or("unknown"))
            .collect();
        match vec.get_metric_with_label_values(&values) {
            Ok(counter) => counter.inc_by(metric.value),
            Err(e) => debug!(metric = metric.name, error = %e, "Dropping metric sample"),
        }
    }
}

impl MetricsSink for PrometheusMetrics {
    fn emit(&self, metric: Metric) {
        match (metric.name, metric.kind) {
            (names::SELECTION_TOTAL, MetricKind::Counter) => {
                self.counter(&metric, &self.selections, SELECTION_LABELS)
            }
            (names::TRANSFER_TRANSITIONS_TOTAL, MetricKind::Counter) => {
                self.counter(&metric, &self.transitions, TRANSITION_LABELS)
            }
            (names::TRANSFER_RETRIES_TOTAL, MetricKind::Counter) => {
                self.counter(&metric, &self.retries, RETRY_LABELS)
            }
            (names::REGISTERED_INSTANCES, MetricKind::Gauge) => self.registered.set(metric.value),
            (name, kind) => debug!(metric = name, ?kind, "Unmapped metric sample"),
        }
    }
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}
