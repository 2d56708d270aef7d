//! Statistical Router — turns rolling `AdapterStats` and recent latencies
//! into per-task-kind `PreferenceOrder`s, and manages A/B experiments.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc, Weekday};
use moka::future::Cache;
use parking_lot::RwLock;

use crate::error::{Result, RoutingError};
use crate::metrics::RoutingMetrics;
use crate::metrics_schema::{
    AbTest, AbVariant, AdapterKind, AdapterScore, Confidence, ExperimentStatus, ExperimentWinner,
    PreferenceOrder, TaskKind,
};
use crate::tracker::ExecutionTracker;

/// Generates a fresh `experiment_id` for `start_experiment`. Unlike
/// `ExecutionId` (ULID, sortable, high call volume), experiment IDs are
/// created rarely and never need lexicographic ordering, so a plain v4
/// UUID is enough.
pub fn new_experiment_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// `(w_success, w_speed)` per task kind, per spec §4.2. Exposed as a
/// lookup rather than buried in `combined_score` so callers/tests can
/// inspect the weights directly.
pub fn weights_for(task_kind: TaskKind) -> (f64, f64) {
    match task_kind {
        TaskKind::Workflow => (0.9, 0.1),
        TaskKind::AiTask => (0.9, 0.1),
        TaskKind::RagQuery => (0.5, 0.5),
    }
}

/// Fallback weights for any task kind not covered by `weights_for` — kept
/// for forward compatibility if `TaskKind` grows a new variant.
#[allow(dead_code)]
const DEFAULT_WEIGHTS: (f64, f64) = (0.7, 0.3);

/// Wilson 95% confidence interval for an observed success rate `p` over
/// `n` samples.
pub fn wilson_interval(p: f64, n: u64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 1.0);
    }
    let z = 1.96_f64;
    let n = n as f64;
    let denom = 1.0 + z * z / n;
    let center = (p + z * z / (2.0 * n)) / denom;
    let margin = z * ((p * (1.0 - p) / n) + z * z / (4.0 * n * n)).sqrt() / denom;
    ((center - margin).clamp(0.0, 1.0), (center + margin).clamp(0.0, 1.0))
}

/// `latency_score = clamp(0, 1, 1 - (log10(max(median_ms, 100)) - 2) / 2)`.
pub fn latency_score(median_ms: Option<f64>) -> f64 {
    let Some(median_ms) = median_ms else {
        return 0.5;
    };
    let bounded = median_ms.max(100.0);
    let score = 1.0 - (bounded.log10() - 2.0) / 2.0;
    score.clamp(0.0, 1.0)
}

fn median(values: &mut [u64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) as f64 / 2.0)
    } else {
        Some(values[mid] as f64)
    }
}

#[derive(Debug, Clone)]
pub struct StatisticalRouterConfig {
    pub min_samples_high: u64,
    pub cache_ttl: std::time::Duration,
}

impl Default for StatisticalRouterConfig {
    fn default() -> Self {
        Self {
            min_samples_high: 100,
            cache_ttl: std::time::Duration::from_secs(3600),
        }
    }
}

pub struct StatisticalRouter {
    config: StatisticalRouterConfig,
    tracker: Arc<ExecutionTracker>,
    metrics: Option<RoutingMetrics>,
    cache: Cache<TaskKind, PreferenceOrder>,
    experiments: RwLock<HashMap<String, AbTest>>,
}

impl StatisticalRouter {
    pub fn new(
        config: StatisticalRouterConfig,
        tracker: Arc<ExecutionTracker>,
        metrics: Option<RoutingMetrics>,
    ) -> Arc<Self> {
        let cache = Cache::builder().time_to_live(config.cache_ttl).build();
        Arc::new(Self {
            config,
            tracker,
            metrics,
            cache,
            experiments: RwLock::new(HashMap::new()),
        })
    }

    async fn score_adapter(&self, adapter: AdapterKind, task_kind: TaskKind) -> Option<AdapterScore> {
        let stats = self.tracker.raw_adapter_stats(adapter);
        let total = stats.total();
        let confidence = Confidence::for_sample_count(total, self.config.min_samples_high);
        if confidence == Confidence::Insufficient {
            return None;
        }

        let success_rate = stats.success_rate(0)?;
        let mut latencies = self.tracker.recent_latencies(adapter, task_kind, 100).await;
        let median_latency = median(&mut latencies);
        let lat_score = latency_score(median_latency);

        let (w_success, w_speed) = weights_for(task_kind);
        let combined = w_success * success_rate + w_speed * lat_score;

        Some(AdapterScore {
            adapter,
            task_kind,
            success_rate,
            latency_score: lat_score,
            combined_score: combined,
            sample_count: total,
            confidence,
        })
    }

    /// Resolved Open Question 1: adapters with no score are *excluded*
    /// from the ranked permutation entirely, rather than sorted to the
    /// bottom with a placeholder score.
    async fn compute_preference_order(&self, task_kind: TaskKind) -> PreferenceOrder {
        let mut scores = Vec::new();
        for adapter in AdapterKind::ALL {
            if let Some(score) = self.score_adapter(adapter, task_kind).await {
                scores.push(score);
            }
        }

        if scores.is_empty() {
            return PreferenceOrder {
                task_kind,
                adapters: AdapterKind::ALL.to_vec(),
                scores: vec![],
                generated_at: Utc::now(),
                confidence: Confidence::Insufficient,
                ab_variant: AbVariant::None,
            };
        }

        scores.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.success_rate.partial_cmp(&a.success_rate).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.adapter.cmp(&b.adapter))
        });

        // Resolved Open Question 2: when only some adapters have scores,
        // list them first (by score) and fill the remainder in static
        // default order, rather than falling back to an entirely static
        // order.
        let mut adapters: Vec<AdapterKind> = scores.iter().map(|s| s.adapter).collect();
        for adapter in AdapterKind::ALL {
            if !adapters.contains(&adapter) {
                adapters.push(adapter);
            }
        }

        let overall_confidence = scores
            .iter()
            .map(|s| s.confidence)
            .min()
            .unwrap_or(Confidence::Insufficient);

        PreferenceOrder {
            task_kind,
            adapters,
            scores,
            generated_at: Utc::now(),
            confidence: overall_confidence,
            ab_variant: AbVariant::None,
        }
    }

    /// Cached (1h TTL) preference order for a task kind, with A/B
    /// overrides applied. Falls back to the static default order with
    /// `Insufficient` confidence when nothing qualifies.
    pub async fn preference_order(&self, task_kind: TaskKind) -> PreferenceOrder {
        if let Some(order) = self.cache.get(&task_kind).await {
            return order;
        }

        let order = self.compute_preference_order(task_kind).await;
        self.cache.insert(task_kind, order.clone()).await;
        order
    }

    /// Invalidates the cached order for every task kind — called after
    /// recalculation or any A/B state transition.
    pub async fn invalidate_cache(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    pub fn start_experiment(
        &self,
        experiment_id: impl Into<String>,
        task_kind: TaskKind,
        variant_a: PreferenceOrder,
        variant_b: PreferenceOrder,
        traffic_split: f64,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&traffic_split) {
            return Err(RoutingError::Validation(format!(
                "traffic_split must be in [0,1], got {traffic_split}"
            )));
        }
        let experiment_id = experiment_id.into();
        let mut experiments = self.experiments.write();
        if experiments.contains_key(&experiment_id) {
            return Err(RoutingError::Validation(format!(
                "experiment {experiment_id} already exists"
            )));
        }
        experiments.insert(
            experiment_id.clone(),
            AbTest {
                experiment_id: experiment_id.clone(),
                task_kind,
                variant_a,
                variant_b,
                traffic_split,
                status: ExperimentStatus::Running,
                winner: ExperimentWinner::None,
                started_at: Utc::now(),
            },
        );
        drop(experiments);
        if let Some(metrics) = &self.metrics {
            metrics.ab_test_event(&experiment_id, "started");
        }
        Ok(())
    }

    /// Deterministic-per-`execution_id` variant assignment (resolves
    /// Open Question 4): hashes the seed to `[0, 1)` and compares to the
    /// traffic split, so replays with the same seed are reproducible.
    pub fn assign_variant(&self, experiment_id: &str, seed: &str) -> Option<AbVariant> {
        let experiments = self.experiments.read();
        let test = experiments.get(experiment_id)?;
        if test.status != ExperimentStatus::Running {
            return Some(AbVariant::None);
        }
        let draw = deterministic_unit_interval(seed);
        Some(if draw < test.traffic_split {
            AbVariant::B
        } else {
            AbVariant::A
        })
    }

    pub fn evaluate_experiment(&self, experiment_id: &str) -> Option<ExperimentEvaluation> {
        let experiments = self.experiments.read();
        let test = experiments.get(experiment_id)?;
        let sample_size_a = test.variant_a.scores.iter().map(|s| s.sample_count).sum();
        let sample_size_b = test.variant_b.scores.iter().map(|s| s.sample_count).sum();
        Some(ExperimentEvaluation {
            status: test.status,
            sample_size_a,
            sample_size_b,
        })
    }

    /// Terminal: subsequent `evaluate_experiment` calls observe the
    /// completed status without further mutation.
    pub async fn complete_experiment(&self, experiment_id: &str, winner: ExperimentWinner) -> Result<()> {
        let task_kind = {
            let mut experiments = self.experiments.write();
            let test = experiments
                .get_mut(experiment_id)
                .ok_or_else(|| RoutingError::Validation(format!("unknown experiment {experiment_id}")))?;
            test.status = ExperimentStatus::Completed;
            test.winner = winner;
            test.task_kind
        };

        self.invalidate_cache().await;

        let winning_order = {
            let experiments = self.experiments.read();
            let test = &experiments[experiment_id];
            match winner {
                ExperimentWinner::B => test.variant_b.clone(),
                // Inconclusive defaults to variant A, per spec §4.2.
                ExperimentWinner::A | ExperimentWinner::Inconclusive | ExperimentWinner::None => {
                    test.variant_a.clone()
                }
            }
        };
        let mut pinned = winning_order;
        pinned.ab_variant = match winner {
            ExperimentWinner::B => AbVariant::B,
            _ => AbVariant::A,
        };
        self.cache.insert(task_kind, pinned).await;

        if let Some(metrics) = &self.metrics {
            metrics.ab_test_event(experiment_id, "completed");
        }
        Ok(())
    }

    /// Recomputes preference orders for every task kind and clears the
    /// cache — the body of the weekly recalculation loop, exposed so it
    /// can also be invoked on demand.
    pub async fn recalculate_all(&self) {
        for task_kind in [TaskKind::Workflow, TaskKind::AiTask, TaskKind::RagQuery] {
            let order = self.compute_preference_order(task_kind).await;
            self.cache.insert(task_kind, order).await;
        }
    }

    pub fn start_recalculation_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = duration_until_next_sunday_3am_utc(Utc::now());
                tokio::time::sleep(wait).await;

                match std::panic::AssertUnwindSafe(this.recalculate_all())
                    .catch_unwind()
                    .await
                {
                    Ok(()) => {}
                    Err(_) => {
                        tracing::error!("weekly recalculation panicked; backing off 5 minutes");
                        tokio::time::sleep(std::time::Duration::from_secs(300)).await;
                    }
                }
            }
        })
    }
}

use futures::FutureExt;

fn deterministic_unit_interval(seed: &str) -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    let hashed = hasher.finish();
    (hashed as f64) / (u64::MAX as f64)
}

/// Computes the next fire time fresh on every call, so DST/clock
/// adjustments are absorbed rather than accumulated.
fn duration_until_next_sunday_3am_utc(now: DateTime<Utc>) -> std::time::Duration {
    let days_until_sunday = (7 - now.weekday().num_days_from_sunday()) % 7;
    let mut candidate = (now + ChronoDuration::days(days_until_sunday as i64))
        .date_naive()
        .and_hms_opt(3, 0, 0)
        .expect("valid time")
        .and_utc();
    if candidate <= now {
        candidate += ChronoDuration::days(7);
    }
    (candidate - now).to_std().unwrap_or(std::time::Duration::from_secs(1))
}

#[allow(dead_code)]
fn _assert_weekday(_: Weekday) {}

#[derive(Debug, Clone, Copy)]
pub struct ExperimentEvaluation {
    pub status: ExperimentStatus,
    pub sample_size_a: u64,
    pub sample_size_b: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_schema::{ExecutionStatus, TaskKind};
    use crate::tracker::{ExecutionTracker, TrackerConfig};

    #[tokio::test]
    async fn wilson_interval_high_confidence_at_p1() {
        let (lower, upper) = wilson_interval(1.0, 100);
        assert!(lower >= 0.96);
        assert_eq!(upper, 1.0);
    }

    #[tokio::test]
    async fn wilson_interval_widens_with_fewer_samples() {
        let (lo100, hi100) = wilson_interval(0.85, 100);
        let (lo20, hi20) = wilson_interval(0.85, 20);
        assert!(lo100 > 0.75 && lo100 < 0.85);
        assert!(hi100 > 0.85 && hi100 < 0.95);
        assert!(lo20 < lo100);
        assert!(hi20 > hi100);
    }

    #[tokio::test]
    async fn wilson_interval_zero_samples_is_unit_interval() {
        assert_eq!(wilson_interval(0.5, 0), (0.0, 1.0));
    }

    #[test]
    fn latency_score_anchors() {
        assert!((latency_score(Some(100.0)) - 1.0).abs() < 1e-9);
        assert!((latency_score(Some(10_000.0)) - 0.0).abs() < 1e-9);
        assert!((latency_score(Some(1_000.0)) - 0.5).abs() < 1e-9);
        assert_eq!(latency_score(None), 0.5);
    }

    #[test]
    fn task_kind_weights_sum_to_one() {
        for task_kind in [TaskKind::Workflow, TaskKind::AiTask, TaskKind::RagQuery] {
            let (s, l) = weights_for(task_kind);
            assert!((s + l - 1.0).abs() < 1e-9);
        }
        assert!((DEFAULT_WEIGHTS.0 + DEFAULT_WEIGHTS.1 - 1.0).abs() < 1e-9);
    }

    async fn seeded_tracker() -> Arc<ExecutionTracker> {
        let mut config = TrackerConfig::default();
        config.min_samples = 0;
        ExecutionTracker::new(config, None)
    }

    #[tokio::test]
    async fn empty_data_yields_static_default_order_with_insufficient_confidence() {
        let tracker = seeded_tracker().await;
        let router = StatisticalRouter::new(StatisticalRouterConfig::default(), tracker, None);
        let order = router.preference_order(TaskKind::Workflow).await;
        assert_eq!(order.confidence, Confidence::Insufficient);
        assert_eq!(order.adapters, AdapterKind::ALL.to_vec());
    }

    #[tokio::test]
    async fn preference_order_is_permutation_of_adapter_set() {
        let tracker = seeded_tracker().await;
        for _ in 0..25 {
            let id = tracker.record_start(AdapterKind::Prefect, TaskKind::Workflow, vec![]);
            tracker
                .record_end(&id, ExecutionStatus::Success, Some(100), None, None, None)
                .await;
        }
        let router = StatisticalRouter::new(StatisticalRouterConfig::default(), tracker, None);
        let order = router.preference_order(TaskKind::Workflow).await;
        let mut sorted = order.adapters.clone();
        sorted.sort();
        let mut expected = AdapterKind::ALL.to_vec();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[tokio::test]
    async fn ab_test_lifecycle_pins_winner_until_recalculation() {
        let tracker = seeded_tracker().await;
        let router = StatisticalRouter::new(StatisticalRouterConfig::default(), tracker, None);

        let variant_a = router.preference_order(TaskKind::Workflow).await;
        let mut variant_b = variant_a.clone();
        variant_b.adapters = vec![AdapterKind::Agno, AdapterKind::Prefect, AdapterKind::Llamaindex];

        router
            .start_experiment("exp-1", TaskKind::Workflow, variant_a, variant_b, 0.5)
            .unwrap();

        router
            .complete_experiment("exp-1", ExperimentWinner::B)
            .await
            .unwrap();

        let order = router.preference_order(TaskKind::Workflow).await;
        assert_eq!(order.adapters[0], AdapterKind::Agno);

        // Terminal: evaluating again doesn't mutate anything.
        let eval = router.evaluate_experiment("exp-1").unwrap();
        assert_eq!(eval.status, ExperimentStatus::Completed);
    }

    #[test]
    fn new_experiment_id_is_unique() {
        assert_ne!(new_experiment_id(), new_experiment_id());
    }

    #[test]
    fn variant_assignment_is_deterministic_per_seed() {
        let a = deterministic_unit_interval("exec-123");
        let b = deterministic_unit_interval("exec-123");
        assert_eq!(a, b);
    }
}
