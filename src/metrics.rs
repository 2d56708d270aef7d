//! Prometheus-shaped metric emission for the routing core.
//!
//! Mirrors the registration style of `llm_router::metrics::RouterMetrics`
//! (lazy-static singletons, `Encoder`-based text export) but generalizes
//! the per-label counters to proper `*Vec` metric families so repeated
//! construction is idempotent by construction, never by a manual
//! `HashMap<String, Counter>` lookup.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];
const FALLBACK_CHAIN_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];

lazy_static! {
    static ref ROUTING_DECISIONS_TOTAL: CounterVec = register_counter_vec!(
        "routing_decisions_total",
        "Routing decisions made, by chosen adapter and task type",
        &["server", "adapter", "task_type"]
    )
    .expect("metric registration must succeed");

    static ref ADAPTER_EXECUTIONS_TOTAL: CounterVec = register_counter_vec!(
        "adapter_executions_total",
        "Adapter execution attempts, by outcome",
        &["server", "adapter", "status"]
    )
    .expect("metric registration must succeed");

    static ref ADAPTER_LATENCY_SECONDS: HistogramVec = register_histogram_vec!(
        "adapter_latency_seconds",
        "Adapter execution latency",
        &["server", "adapter"],
        LATENCY_BUCKETS.to_vec()
    )
    .expect("metric registration must succeed");

    static ref ROUTING_FALLBACKS_TOTAL: CounterVec = register_counter_vec!(
        "routing_fallbacks_total",
        "Fallback hops, by original and fallback adapter",
        &["server", "original_adapter", "fallback_adapter"]
    )
    .expect("metric registration must succeed");

    static ref ROUTING_FALLBACK_CHAIN_LENGTH: HistogramVec = register_histogram_vec!(
        "routing_fallback_chain_length",
        "Length of the fallback chain attempted for a dispatch",
        &["server"],
        FALLBACK_CHAIN_BUCKETS.to_vec()
    )
    .expect("metric registration must succeed");

    static ref ROUTING_COST_USD_TOTAL: CounterVec = register_counter_vec!(
        "routing_cost_usd_total",
        "Cumulative cost attributed to routing decisions",
        &["server", "adapter", "task_type"]
    )
    .expect("metric registration must succeed");

    static ref ROUTING_COST_USD_CURRENT: GaugeVec = register_gauge_vec!(
        "routing_cost_usd_current",
        "Current spend within the active budget period",
        &["server", "budget_type"]
    )
    .expect("metric registration must succeed");

    static ref ROUTING_COST_USD_DISTRIBUTION: HistogramVec = register_histogram_vec!(
        "routing_cost_usd_distribution",
        "Distribution of per-execution cost",
        &["server", "adapter"]
    )
    .expect("metric registration must succeed");

    static ref BUDGET_ALERTS_TOTAL: CounterVec = register_counter_vec!(
        "budget_alerts_total",
        "Budget alerts emitted, by budget type and severity",
        &["server", "budget_type", "severity"]
    )
    .expect("metric registration must succeed");

    static ref AB_TESTS_TOTAL: CounterVec = register_counter_vec!(
        "ab_tests_total",
        "A/B test lifecycle events",
        &["server", "experiment_id", "event_type"]
    )
    .expect("metric registration must succeed");

    static ref AB_TESTS_ACTIVE: GaugeVec = register_gauge_vec!(
        "ab_tests_active",
        "Currently running A/B tests",
        &["server"]
    )
    .expect("metric registration must succeed");
}

/// Emission surface used throughout the core. Holding an instance and
/// calling through it (rather than touching the `lazy_static!`s directly)
/// keeps the emission contract swappable in tests without a real
/// Prometheus registry, since every method is a thin, mockable wrapper.
#[derive(Debug, Clone)]
pub struct RoutingMetrics {
    server: String,
    encoder: TextEncoderHandle,
}

/// `TextEncoder` carries no state worth cloning around per call; wrap it
/// so `RoutingMetrics` stays `Clone` without re-allocating an encoder.
#[derive(Debug, Clone, Default)]
struct TextEncoderHandle;

impl RoutingMetrics {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            encoder: TextEncoderHandle,
        }
    }

    pub fn routing_decision(&self, adapter: &str, task_type: &str) {
        ROUTING_DECISIONS_TOTAL
            .with_label_values(&[&self.server, adapter, task_type])
            .inc();
    }

    pub fn adapter_execution(&self, adapter: &str, status: &str) {
        ADAPTER_EXECUTIONS_TOTAL
            .with_label_values(&[&self.server, adapter, status])
            .inc();
    }

    pub fn adapter_latency(&self, adapter: &str, seconds: f64) {
        ADAPTER_LATENCY_SECONDS
            .with_label_values(&[&self.server, adapter])
            .observe(seconds);
    }

    pub fn fallback(&self, original_adapter: &str, fallback_adapter: &str) {
        ROUTING_FALLBACKS_TOTAL
            .with_label_values(&[&self.server, original_adapter, fallback_adapter])
            .inc();
    }

    pub fn fallback_chain_length(&self, length: usize) {
        ROUTING_FALLBACK_CHAIN_LENGTH
            .with_label_values(&[&self.server])
            .observe(length as f64);
    }

    pub fn cost(&self, adapter: &str, task_type: &str, cost_usd: f64) {
        ROUTING_COST_USD_TOTAL
            .with_label_values(&[&self.server, adapter, task_type])
            .inc_by(cost_usd);
        ROUTING_COST_USD_DISTRIBUTION
            .with_label_values(&[&self.server, adapter])
            .observe(cost_usd);
    }

    pub fn cost_current(&self, budget_type: &str, value: f64) {
        ROUTING_COST_USD_CURRENT
            .with_label_values(&[&self.server, budget_type])
            .set(value);
    }

    pub fn budget_alert(&self, budget_type: &str, severity: &str) {
        BUDGET_ALERTS_TOTAL
            .with_label_values(&[&self.server, budget_type, severity])
            .inc();
    }

    pub fn ab_test_event(&self, experiment_id: &str, event_type: &str) {
        AB_TESTS_TOTAL
            .with_label_values(&[&self.server, experiment_id, event_type])
            .inc();
    }

    pub fn ab_tests_active(&self, count: f64) {
        AB_TESTS_ACTIVE.with_label_values(&[&self.server]).set(count);
    }

    /// Renders the process-wide Prometheus registry as text exposition
    /// format. Scraping/HTTP plumbing is out of scope for this crate —
    /// only this emission contract is.
    pub fn gather(&self) -> std::result::Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let _ = &self.encoder;
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
