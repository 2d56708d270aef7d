//! Cost Optimizer — cumulative cost tracking, budget enforcement/alerting,
//! and cost-aware adapter selection under Pareto-frontier constraints.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::alert_manager::AlertSink;
use crate::error::{Result, RoutingError};
use crate::metrics::RoutingMetrics;
use crate::metrics_schema::{
    AdapterKind, Alert, AlertKind, Budget, BudgetKind, ExecutionId, Severity, TaskKind,
};
use crate::tracker::ExecutionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AccrualKey {
    date: NaiveDate,
    adapter: AdapterKind,
    task_kind: TaskKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostStrategy {
    Interactive,
    Batch,
    Critical,
}

impl CostStrategy {
    pub fn default_for(task_kind: TaskKind) -> Self {
        match task_kind {
            TaskKind::RagQuery => CostStrategy::Interactive,
            TaskKind::Workflow | TaskKind::AiTask => CostStrategy::Batch,
        }
    }

    /// `(w_success, w_cost, w_latency)` — every strategy's weights sum to
    /// 1.0 (Testable Property 7).
    pub fn weights(&self) -> (f64, f64, f64) {
        match self {
            CostStrategy::Interactive => (0.50, 0.25, 0.25),
            CostStrategy::Batch => (0.90, 0.10, 0.00),
            CostStrategy::Critical => (0.80, 0.00, 0.20),
        }
    }
}

const MAX_COST_FOR_SCORE: f64 = 0.01;
const DEFAULT_MAX_LATENCY_MS: f64 = 5000.0;

fn cost_score(cost_usd: f64) -> f64 {
    (1.0 - cost_usd / MAX_COST_FOR_SCORE).clamp(0.0, 1.0)
}

fn latency_cost_score(latency_ms: f64, max_latency_ms: f64) -> f64 {
    (1.0 - latency_ms / max_latency_ms).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct CostAwareChoice {
    pub adapter: AdapterKind,
    pub cost_usd: Decimal,
    pub latency_ms: f64,
    pub success_rate: f64,
    pub score: f64,
    pub budget_violated: bool,
}

/// `a` is dominated by `b` iff `b` is strictly better in at least one of
/// `{cost, latency, success_rate}` and no worse in the rest.
fn dominates(a: &CostAwareChoice, b: &CostAwareChoice) -> bool {
    let cost_better_or_eq = b.cost_usd <= a.cost_usd;
    let latency_better_or_eq = b.latency_ms <= a.latency_ms;
    let success_better_or_eq = b.success_rate >= a.success_rate;
    let strictly_better = b.cost_usd < a.cost_usd
        || b.latency_ms < a.latency_ms
        || b.success_rate > a.success_rate;
    cost_better_or_eq && latency_better_or_eq && success_better_or_eq && strictly_better
}

pub fn pareto_frontier(choices: &[CostAwareChoice]) -> Vec<CostAwareChoice> {
    choices
        .iter()
        .filter(|candidate| !choices.iter().any(|other| dominates(candidate, other)))
        .cloned()
        .collect()
}

#[derive(Debug, Clone)]
pub struct BudgetStatus {
    pub limit: Decimal,
    pub spent: Decimal,
    pub remaining: Decimal,
    pub pct_used: f64,
    pub active: bool,
    pub over: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BudgetCheck {
    pub ok: bool,
    pub violated: Vec<AdapterKind>,
}

pub struct CostOptimizerConfig {
    pub cost_per_second_usd: HashMap<AdapterKind, Decimal>,
    pub max_latency_ms: f64,
}

impl Default for CostOptimizerConfig {
    fn default() -> Self {
        let mut cost_per_second_usd = HashMap::new();
        cost_per_second_usd.insert(AdapterKind::Prefect, Decimal::new(1, 4));
        cost_per_second_usd.insert(AdapterKind::Agno, Decimal::new(2, 4));
        cost_per_second_usd.insert(AdapterKind::Llamaindex, Decimal::new(5, 5));
        Self {
            cost_per_second_usd,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
        }
    }
}

pub struct CostOptimizer {
    config: CostOptimizerConfig,
    accruals: DashMap<AccrualKey, Decimal>,
    budgets: RwLock<Vec<Budget>>,
    tracker: Arc<ExecutionTracker>,
    metrics: Option<RoutingMetrics>,
    /// Baseline used by the alert manager's cost-spike comparison; lives
    /// here since the optimizer owns the accrual data the alert reads.
    previous_total: RwLock<Option<Decimal>>,
    /// Sinks the budget monitor loop fans `budget_exceeded` alerts out
    /// through, alongside the `budget_alerts_total` metric.
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
}

impl CostOptimizer {
    pub fn new(
        config: CostOptimizerConfig,
        tracker: Arc<ExecutionTracker>,
        metrics: Option<RoutingMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            accruals: DashMap::new(),
            budgets: RwLock::new(Vec::new()),
            tracker,
            metrics,
            previous_total: RwLock::new(None),
            sinks: RwLock::new(Vec::new()),
        })
    }

    /// Registers an alert sink for `budget_exceeded` fan-out. Additive;
    /// call once per sink during composition.
    pub fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.write().push(sink);
    }

    fn cost_per_second(&self, adapter: AdapterKind) -> Decimal {
        self.config
            .cost_per_second_usd
            .get(&adapter)
            .copied()
            .unwrap_or(Decimal::new(1, 5))
    }

    /// `cost = cost_per_second(adapter) * latency_ms / 1000`, computed in
    /// exact decimal arithmetic so totals never drift via float
    /// accumulation.
    pub fn track_execution_cost(
        &self,
        adapter: AdapterKind,
        task_kind: TaskKind,
        execution_id: &ExecutionId,
        latency_ms: u64,
    ) -> Decimal {
        let per_second = self.cost_per_second(adapter);
        let seconds = Decimal::new(latency_ms as i64, 3); // latency_ms / 1000
        let cost = per_second * seconds;

        let key = AccrualKey {
            date: Utc::now().date_naive(),
            adapter,
            task_kind,
        };
        let mut entry = self.accruals.entry(key).or_insert(Decimal::ZERO);
        *entry += cost;

        tracing::debug!(%execution_id, %adapter, %cost, "tracked execution cost");

        if let Some(metrics) = &self.metrics {
            metrics.cost(&adapter.to_string(), &task_kind.to_string(), cost_to_f64(cost));
        }

        cost
    }

    fn spent_for(&self, budget: &Budget) -> Decimal {
        let start_date = budget.period_start.date_naive();
        let end_date = budget.period_end.date_naive();
        self.accruals
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.date >= start_date
                    && key.date <= end_date
                    && budget.adapter.map(|a| a == key.adapter).unwrap_or(true)
                    && budget.task_kind.map(|t| t == key.task_kind).unwrap_or(true)
            })
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn budget_status(&self, budget: &Budget) -> BudgetStatus {
        let now = Utc::now();
        let spent = self.spent_for(budget);
        let remaining = budget.limit_usd - spent;
        let pct_used = if budget.limit_usd > Decimal::ZERO {
            cost_to_f64(spent / budget.limit_usd) * 100.0
        } else {
            0.0
        };
        BudgetStatus {
            limit: budget.limit_usd,
            spent,
            remaining,
            pct_used,
            active: budget.is_active(now),
            over: spent > budget.limit_usd,
        }
    }

    pub fn check_budget_constraints(&self, adapter: AdapterKind, task_kind: TaskKind) -> BudgetCheck {
        let now = Utc::now();
        let mut violated = Vec::new();
        for budget in self.budgets.read().iter() {
            if !budget.is_active(now) {
                continue;
            }
            if let Some(scoped_adapter) = budget.adapter {
                if scoped_adapter != adapter {
                    continue;
                }
            }
            if let Some(scoped_task) = budget.task_kind {
                if scoped_task != task_kind {
                    continue;
                }
            }
            let status = self.budget_status(budget);
            if status.over {
                violated.push(adapter);
            }
        }
        BudgetCheck {
            ok: violated.is_empty(),
            violated,
        }
    }

    pub fn add_budget(&self, budget: Budget) -> Result<()> {
        if budget.limit_usd < Decimal::ZERO {
            return Err(RoutingError::Validation("limit_usd must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&budget.alert_threshold) {
            return Err(RoutingError::Validation(
                "alert_threshold must be in [0,1]".into(),
            ));
        }
        self.budgets.write().push(budget);
        Ok(())
    }

    pub fn budgets(&self) -> Vec<Budget> {
        self.budgets.read().clone()
    }

    /// Builds a `CostAwareChoice` per adapter, applies budget constraints
    /// (violators get `score = 0`), computes the Pareto frontier, and
    /// returns the highest-scored frontier member with a human-readable
    /// `reasoning` string.
    pub async fn optimal_adapter(
        &self,
        task_kind: TaskKind,
        strategy: CostStrategy,
    ) -> Option<(CostAwareChoice, String)> {
        let (w_success, w_cost, w_latency) = strategy.weights();
        let mut choices = Vec::new();

        for adapter in AdapterKind::ALL {
            let stats = self.tracker.raw_adapter_stats(adapter);
            let success_rate = stats.success_rate(0).unwrap_or(0.5);

            let latencies = self.tracker.recent_latencies(adapter, task_kind, 100).await;
            let avg_latency_ms = if latencies.is_empty() {
                500.0
            } else {
                let sum: u64 = latencies.iter().sum();
                sum as f64 / latencies.len() as f64
            };

            let estimated_cost = self.cost_per_second(adapter) * Decimal::new(avg_latency_ms as i64, 3);

            let check = self.check_budget_constraints(adapter, task_kind);
            let budget_violated = !check.ok;

            let score = if budget_violated {
                0.0
            } else {
                w_success * success_rate
                    + w_cost * cost_score(cost_to_f64(estimated_cost))
                    + w_latency * latency_cost_score(avg_latency_ms, self.config.max_latency_ms)
            };

            choices.push(CostAwareChoice {
                adapter,
                cost_usd: estimated_cost,
                latency_ms: avg_latency_ms,
                success_rate,
                score,
                budget_violated,
            });
        }

        let eligible: Vec<CostAwareChoice> = choices.into_iter().filter(|c| !c.budget_violated).collect();
        if eligible.is_empty() {
            return None;
        }

        let frontier = pareto_frontier(&eligible);
        let best = frontier
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))?
            .clone();

        let reasoning = format!(
            "Strategy: {:?} | Pareto frontier: {} adapters | Success rate: {:.1}% | Cost: ${:.6} | Latency: {:.0} ms",
            strategy,
            frontier.len(),
            best.success_rate * 100.0,
            cost_to_f64(best.cost_usd),
            best.latency_ms
        );

        Some((best, reasoning))
    }

    /// Sampled-total vs. previous-total comparison used by the alert
    /// manager's cost-spike evaluation. Returns `(ratio, previous_total)`.
    /// The first call only establishes the baseline and returns `None`.
    pub fn sample_cost_spike_ratio(&self, current_total: Decimal) -> Option<(f64, Decimal)> {
        let mut previous = self.previous_total.write();
        let ratio = previous.map(|prev| {
            let r = if prev > Decimal::ZERO {
                cost_to_f64(current_total / prev)
            } else {
                f64::INFINITY
            };
            (r, prev)
        });
        *previous = Some(current_total);
        ratio
    }

    pub fn total_spent(&self) -> Decimal {
        self.accruals.iter().map(|e| *e.value()).sum()
    }

    pub fn start_budget_monitor_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                for budget in this.budgets() {
                    if !budget.is_active(Utc::now()) {
                        continue;
                    }
                    let status = this.budget_status(&budget);
                    let Some(alert) = Self::budget_alert(budget.kind, &status, budget.alert_threshold) else {
                        continue;
                    };
                    if let Some(metrics) = &this.metrics {
                        metrics.budget_alert(&format!("{:?}", budget.kind), &format!("{:?}", alert.severity));
                    }
                    let sinks = this.sinks.read().clone();
                    for sink in &sinks {
                        sink.send(&alert).await;
                    }
                }
            }
        })
    }

    /// Builds the `budget_exceeded` alert for a given budget status,
    /// shared by the budget monitor loop and the alert manager.
    pub fn budget_alert(kind: BudgetKind, status: &BudgetStatus, alert_threshold: f64) -> Option<Alert> {
        let severity = if status.pct_used >= 100.0 {
            Severity::Critical
        } else if status.pct_used >= alert_threshold * 100.0 {
            Severity::Warning
        } else {
            return None;
        };
        let mut metadata = HashMap::new();
        metadata.insert("budget_type".to_string(), format!("{:?}", kind));
        Some(Alert {
            kind: AlertKind::BudgetExceeded,
            severity,
            message: format!("budget {:?} at {:.1}% utilization", kind, status.pct_used),
            adapter: None,
            current_value: Some(cost_to_f64(status.spent)),
            threshold_value: Some(cost_to_f64(status.limit)),
            timestamp: Utc::now(),
            metadata,
        })
    }
}

pub fn cost_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{ExecutionTracker, TrackerConfig};
    use chrono::Duration as ChronoDuration;

    fn optimizer() -> Arc<CostOptimizer> {
        let tracker = ExecutionTracker::new(TrackerConfig::default(), None);
        CostOptimizer::new(CostOptimizerConfig::default(), tracker, None)
    }

    #[test]
    fn strategy_weights_sum_to_one() {
        for strategy in [CostStrategy::Interactive, CostStrategy::Batch, CostStrategy::Critical] {
            let (s, c, l) = strategy.weights();
            assert!((s + c + l - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn cost_tracking_is_monotonic() {
        let optimizer = optimizer();
        let first = optimizer.track_execution_cost(
            AdapterKind::Prefect,
            TaskKind::Workflow,
            &ExecutionId::new(),
            1000,
        );
        let total_after_first = optimizer.total_spent();
        let _second = optimizer.track_execution_cost(
            AdapterKind::Prefect,
            TaskKind::Workflow,
            &ExecutionId::new(),
            500,
        );
        let total_after_second = optimizer.total_spent();
        assert!(total_after_second >= total_after_first);
        assert!(first > Decimal::ZERO);
    }

    #[test]
    fn pareto_frontier_excludes_dominated_options() {
        let cheap_fast_reliable = CostAwareChoice {
            adapter: AdapterKind::Llamaindex,
            cost_usd: Decimal::new(1, 3),
            latency_ms: 100.0,
            success_rate: 0.99,
            score: 0.0,
            budget_violated: false,
        };
        let expensive_slow_unreliable = CostAwareChoice {
            adapter: AdapterKind::Agno,
            cost_usd: Decimal::new(9, 3),
            latency_ms: 900.0,
            success_rate: 0.5,
            score: 0.0,
            budget_violated: false,
        };
        let frontier = pareto_frontier(&[cheap_fast_reliable.clone(), expensive_slow_unreliable]);
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier[0].adapter, cheap_fast_reliable.adapter);
    }

    #[test]
    fn budget_active_over_closed_interval_of_exactly_now() {
        let now = Utc::now();
        let budget = Budget {
            kind: BudgetKind::Daily,
            limit_usd: Decimal::new(10, 0),
            adapter: None,
            task_kind: None,
            period_start: now,
            period_end: now,
            alert_threshold: 0.9,
        };
        assert!(budget.is_active(now));
    }

    #[test]
    fn budget_violation_zeroes_eligibility() {
        let optimizer = optimizer();
        optimizer.track_execution_cost(
            AdapterKind::Prefect,
            TaskKind::Workflow,
            &ExecutionId::new(),
            1_000_000_000,
        );
        let now = Utc::now();
        optimizer
            .add_budget(Budget {
                kind: BudgetKind::Daily,
                limit_usd: Decimal::new(1, 2),
                adapter: Some(AdapterKind::Prefect),
                task_kind: None,
                period_start: now - ChronoDuration::hours(1),
                period_end: now + ChronoDuration::hours(1),
                alert_threshold: 0.9,
            })
            .unwrap();
        let check = optimizer.check_budget_constraints(AdapterKind::Prefect, TaskKind::Workflow);
        assert!(!check.ok);
    }

    #[test]
    fn budget_alert_severity_follows_pct_used_tiers() {
        let status = BudgetStatus {
            limit: Decimal::new(100, 0),
            spent: Decimal::new(95, 0),
            remaining: Decimal::new(5, 0),
            pct_used: 95.0,
            active: true,
            over: false,
        };
        let alert = CostOptimizer::budget_alert(BudgetKind::Daily, &status, 0.9).unwrap();
        assert_eq!(alert.severity, Severity::Warning);

        let over_status = BudgetStatus {
            pct_used: 100.0,
            over: true,
            ..status
        };
        let critical = CostOptimizer::budget_alert(BudgetKind::Daily, &over_status, 0.9).unwrap();
        assert_eq!(critical.severity, Severity::Critical);

        let under_threshold = BudgetStatus {
            pct_used: 50.0,
            ..over_status
        };
        assert!(CostOptimizer::budget_alert(BudgetKind::Daily, &under_threshold, 0.9).is_none());
    }
}
