//! Alert Manager — periodic evaluation of adapter degradation, cost
//! spikes, and excessive-fallback conditions, dispatched to a pluggable
//! sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cost_optimizer::CostOptimizer;
use crate::metrics::RoutingMetrics;
use crate::metrics_schema::{Alert, AlertKind, AdapterKind, Severity, TaskKind};
use crate::tracker::ExecutionTracker;

fn percentile(values: &[u64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    Some(sorted[rank.min(sorted.len() - 1)] as f64)
}

/// Delivery surface for generated alerts. Implementations must not block
/// the evaluation loop indefinitely; a slow sink delays the next cycle
/// only by its own latency, never by retrying.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert);
}

/// Logs at `warn`/`error` depending on severity. Always available as a
/// fallback sink, mirroring the source system's default logging handler.
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn send(&self, alert: &Alert) {
        match alert.severity {
            Severity::Critical => tracing::error!(kind = ?alert.kind, message = %alert.message, "alert"),
            Severity::Warning => tracing::warn!(kind = ?alert.kind, message = %alert.message, "alert"),
            Severity::Info => tracing::info!(kind = ?alert.kind, message = %alert.message, "alert"),
        }
    }
}

/// Posts the alert as a JSON body to a configured URL. A delivery failure
/// is logged and dropped — resolves Open Question 5 (no indefinite retry
/// of a webhook alert, since alerts are best-effort and a backlog would
/// itself become a cost/latency problem).
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) {
        if let Err(err) = self.client.post(&self.url).json(alert).send().await {
            tracing::warn!(error = %err, "webhook alert delivery failed, dropping");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlertThresholds {
    pub success_rate_threshold: f64,
    pub fallback_rate_threshold: f64,
    pub latency_p95_threshold_ms: u64,
    pub cost_spike_multiplier: f64,
    pub evaluation_interval: Duration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            success_rate_threshold: 0.95,
            fallback_rate_threshold: 0.10,
            latency_p95_threshold_ms: 5_000,
            cost_spike_multiplier: 2.0,
            evaluation_interval: Duration::from_secs(60),
        }
    }
}

/// Injected by the task router so the alert manager can evaluate
/// excessive-fallback conditions without owning dispatch state itself.
pub trait FallbackRateSource: Send + Sync {
    fn fallback_rate(&self) -> f64;
}

pub struct AlertManager {
    thresholds: AlertThresholds,
    tracker: Arc<ExecutionTracker>,
    cost_optimizer: Arc<CostOptimizer>,
    fallback_source: Option<Arc<dyn FallbackRateSource>>,
    sinks: Vec<Arc<dyn AlertSink>>,
    metrics: Option<RoutingMetrics>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    loop_handle: RwLock<Option<JoinHandle<()>>>,
}

impl AlertManager {
    pub fn new(
        thresholds: AlertThresholds,
        tracker: Arc<ExecutionTracker>,
        cost_optimizer: Arc<CostOptimizer>,
        fallback_source: Option<Arc<dyn FallbackRateSource>>,
        sinks: Vec<Arc<dyn AlertSink>>,
        metrics: Option<RoutingMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            thresholds,
            tracker,
            cost_optimizer,
            fallback_source,
            sinks,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            loop_handle: RwLock::new(None),
        })
    }

    async fn dispatch(&self, alert: Alert) {
        // `budget_alerts_total` is specifically a budget-kind metric
        // (spec §6) and is emitted by the cost optimizer's budget
        // monitor loop; other alert kinds have no dedicated counter in
        // the metric contract, so only sink delivery happens here.
        for sink in &self.sinks {
            sink.send(&alert).await;
        }
    }

    fn evaluate_adapter_degradation(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for adapter in AdapterKind::ALL {
            let stats = self.tracker.raw_adapter_stats(adapter);
            let Some(rate) = stats.success_rate(20) else {
                continue;
            };
            if rate < self.thresholds.success_rate_threshold {
                alerts.push(Alert {
                    kind: AlertKind::AdapterDegradation,
                    // Fixed 0.80 cutoff per spec §4.5.1, not a fraction of
                    // the configurable warning threshold.
                    severity: if rate < 0.80 {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    },
                    message: format!(
                        "{adapter} success rate {:.1}% below threshold {:.1}%",
                        rate * 100.0,
                        self.thresholds.success_rate_threshold * 100.0
                    ),
                    adapter: Some(adapter),
                    current_value: Some(rate),
                    threshold_value: Some(self.thresholds.success_rate_threshold),
                    timestamp: Utc::now(),
                    metadata: Default::default(),
                });
            }
        }
        alerts
    }

    /// Compares the current total spend to the previously sampled total.
    /// The first sample in the process's lifetime only seeds the
    /// baseline and never alerts, so a cold start can't look like a
    /// spike. Severity is two-tiered: `>= cost_spike_multiplier` (default
    /// 2.0) is critical, `>= 1.5` is warning.
    fn evaluate_cost_spike(&self) -> Option<Alert> {
        let current_total = self.cost_optimizer.total_spent();
        let (ratio, previous_total) =
            self.cost_optimizer.sample_cost_spike_ratio(current_total)?;
        let severity = if ratio >= self.thresholds.cost_spike_multiplier {
            Severity::Critical
        } else if ratio >= 1.5 {
            Severity::Warning
        } else {
            return None;
        };
        let change_percent = (ratio - 1.0) * 100.0;
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("change_percent".to_string(), format!("{change_percent:.0}%"));
        Some(Alert {
            kind: AlertKind::CostSpike,
            severity,
            message: format!(
                "cost increased {:.1}x over the previous sampling window",
                ratio
            ),
            adapter: None,
            current_value: Some(crate::cost_optimizer::cost_to_f64(current_total)),
            threshold_value: Some(crate::cost_optimizer::cost_to_f64(previous_total)),
            timestamp: Utc::now(),
            metadata,
        })
    }

    /// Wired from `original_source/mahavishnu/core/routing_alerts.py`'s
    /// `high_latency` kind onto the otherwise-unused
    /// `adapter_latency_seconds` histogram: checks the rolling p95 per
    /// `(adapter, task_kind)` against `latency_p95_threshold_ms`.
    async fn evaluate_high_latency(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for adapter in AdapterKind::ALL {
            for task_kind in [TaskKind::Workflow, TaskKind::AiTask, TaskKind::RagQuery] {
                let latencies = self.tracker.recent_latencies(adapter, task_kind, 200).await;
                let Some(p95) = percentile(&latencies, 95.0) else {
                    continue;
                };
                if p95 > self.thresholds.latency_p95_threshold_ms as f64 {
                    alerts.push(Alert {
                        kind: AlertKind::HighLatency,
                        severity: Severity::Warning,
                        message: format!(
                            "{adapter}/{task_kind} p95 latency {p95:.0}ms exceeds {}ms",
                            self.thresholds.latency_p95_threshold_ms
                        ),
                        adapter: Some(adapter),
                        current_value: Some(p95),
                        threshold_value: Some(self.thresholds.latency_p95_threshold_ms as f64),
                        timestamp: Utc::now(),
                        metadata: Default::default(),
                    });
                }
            }
        }
        alerts
    }

    fn evaluate_excessive_fallbacks(&self) -> Option<Alert> {
        let source = self.fallback_source.as_ref()?;
        let rate = source.fallback_rate();
        if rate < self.thresholds.fallback_rate_threshold {
            return None;
        }
        // Critical above 0.30 per spec §4.5.3.
        let severity = if rate > 0.30 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(Alert {
            kind: AlertKind::ExcessiveFallbacks,
            severity,
            message: format!(
                "fallback rate {:.1}% exceeds threshold {:.1}%",
                rate * 100.0,
                self.thresholds.fallback_rate_threshold * 100.0
            ),
            adapter: None,
            current_value: Some(rate),
            threshold_value: Some(self.thresholds.fallback_rate_threshold),
            timestamp: Utc::now(),
            metadata: Default::default(),
        })
    }

    /// Runs one evaluation pass and dispatches every generated alert.
    /// Exposed publicly so tests and the budget monitor can trigger an
    /// off-cycle evaluation.
    pub async fn evaluate_once(&self) {
        for alert in self.evaluate_adapter_degradation() {
            self.dispatch(alert).await;
        }
        if let Some(alert) = self.evaluate_cost_spike() {
            self.dispatch(alert).await;
        }
        for alert in self.evaluate_high_latency().await {
            self.dispatch(alert).await;
        }
        if let Some(alert) = self.evaluate_excessive_fallbacks() {
            self.dispatch(alert).await;
        }
    }

    /// Idempotent: calling `start` while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let interval = this.thresholds.evaluation_interval;
        let shutdown = Arc::clone(&this.shutdown);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }
                this.evaluate_once().await;
            }
        });
        *self.loop_handle.write() = Some(handle);
    }

    /// Idempotent: calling `stop` while already stopped is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        if let Some(handle) = self.loop_handle.write().take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost_optimizer::CostOptimizerConfig;
    use crate::metrics_schema::{ExecutionStatus, TaskKind};
    use crate::tracker::TrackerConfig;
    use tokio::sync::Mutex as AsyncMutex;

    struct CapturingSink {
        captured: AsyncMutex<Vec<Alert>>,
    }

    impl CapturingSink {
        fn new() -> Self {
            Self {
                captured: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AlertSink for CapturingSink {
        async fn send(&self, alert: &Alert) {
            self.captured.lock().await.push(alert.clone());
        }
    }

    struct FixedFallbackRate(f64);
    impl FallbackRateSource for FixedFallbackRate {
        fn fallback_rate(&self) -> f64 {
            self.0
        }
    }

    fn manager_with(
        fallback_rate: Option<f64>,
        sink: Arc<CapturingSink>,
    ) -> (Arc<AlertManager>, Arc<ExecutionTracker>) {
        let mut config = TrackerConfig::default();
        config.min_samples = 0;
        let tracker = ExecutionTracker::new(config, None);
        let cost_optimizer =
            CostOptimizer::new(CostOptimizerConfig::default(), Arc::clone(&tracker), None);
        let fallback_source = fallback_rate
            .map(|r| Arc::new(FixedFallbackRate(r)) as Arc<dyn FallbackRateSource>);
        let manager = AlertManager::new(
            AlertThresholds::default(),
            Arc::clone(&tracker),
            cost_optimizer,
            fallback_source,
            vec![sink],
            None,
        );
        (manager, tracker)
    }

    #[tokio::test]
    async fn degraded_adapter_triggers_alert() {
        let sink = Arc::new(CapturingSink::new());
        let (manager, tracker) = manager_with(None, Arc::clone(&sink));

        for i in 0..30 {
            let id = tracker.record_start(AdapterKind::Prefect, TaskKind::Workflow, vec![]);
            let status = if i < 20 {
                ExecutionStatus::Failure
            } else {
                ExecutionStatus::Success
            };
            tracker.record_end(&id, status, Some(10), None, None, None).await;
        }

        manager.evaluate_once().await;
        let captured = sink.captured.lock().await;
        let alert = captured
            .iter()
            .find(|a| a.kind == AlertKind::AdapterDegradation)
            .expect("degradation alert emitted");
        // 10/30 = 33% success, well under the fixed 0.80 critical cutoff.
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn mildly_degraded_adapter_triggers_warning_not_critical() {
        let sink = Arc::new(CapturingSink::new());
        let (manager, tracker) = manager_with(None, Arc::clone(&sink));

        for i in 0..30 {
            let id = tracker.record_start(AdapterKind::Prefect, TaskKind::Workflow, vec![]);
            // 28/30 = 93.3%: below the 95% threshold but above the 80%
            // critical cutoff.
            let status = if i < 2 {
                ExecutionStatus::Failure
            } else {
                ExecutionStatus::Success
            };
            tracker.record_end(&id, status, Some(10), None, None, None).await;
        }

        manager.evaluate_once().await;
        let captured = sink.captured.lock().await;
        let alert = captured
            .iter()
            .find(|a| a.kind == AlertKind::AdapterDegradation)
            .expect("degradation alert emitted");
        assert_eq!(alert.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn healthy_adapter_produces_no_degradation_alert() {
        let sink = Arc::new(CapturingSink::new());
        let (manager, tracker) = manager_with(None, Arc::clone(&sink));

        for _ in 0..30 {
            let id = tracker.record_start(AdapterKind::Prefect, TaskKind::Workflow, vec![]);
            tracker
                .record_end(&id, ExecutionStatus::Success, Some(10), None, None, None)
                .await;
        }

        manager.evaluate_once().await;
        let captured = sink.captured.lock().await;
        assert!(!captured.iter().any(|a| a.kind == AlertKind::AdapterDegradation));
    }

    #[tokio::test]
    async fn sustained_high_latency_triggers_alert() {
        let sink = Arc::new(CapturingSink::new());
        let (manager, tracker) = manager_with(None, Arc::clone(&sink));

        for _ in 0..10 {
            let id = tracker.record_start(AdapterKind::Llamaindex, TaskKind::RagQuery, vec![]);
            tracker
                .record_end(&id, ExecutionStatus::Success, Some(9_000), None, None, None)
                .await;
        }

        manager.evaluate_once().await;
        let captured = sink.captured.lock().await;
        assert!(captured.iter().any(|a| a.kind == AlertKind::HighLatency));
    }

    #[tokio::test]
    async fn excessive_fallback_rate_triggers_warning_below_critical_cutoff() {
        let sink = Arc::new(CapturingSink::new());
        let (manager, _tracker) = manager_with(Some(0.20), Arc::clone(&sink));
        manager.evaluate_once().await;
        let captured = sink.captured.lock().await;
        let alert = captured
            .iter()
            .find(|a| a.kind == AlertKind::ExcessiveFallbacks)
            .expect("excessive fallback alert emitted");
        assert_eq!(alert.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn excessive_fallback_rate_above_0_30_triggers_critical() {
        let sink = Arc::new(CapturingSink::new());
        let (manager, _tracker) = manager_with(Some(0.5), Arc::clone(&sink));
        manager.evaluate_once().await;
        let captured = sink.captured.lock().await;
        let alert = captured
            .iter()
            .find(|a| a.kind == AlertKind::ExcessiveFallbacks)
            .expect("excessive fallback alert emitted");
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn start_stop_is_idempotent() {
        let sink = Arc::new(CapturingSink::new());
        let (manager, _tracker) = manager_with(None, sink);
        manager.start();
        manager.start();
        manager.stop().await;
        manager.stop().await;
    }
}
