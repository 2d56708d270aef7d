//! Task Router — resolves a candidate adapter order, dispatches with
//! retry/backoff and fallback, and emits the routing metrics contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rust_decimal::Decimal;
use tokio::sync::Notify;

use crate::cost_optimizer::{CostOptimizer, CostStrategy};
use crate::error::{Result, RoutingError};
use crate::metrics::RoutingMetrics;
use crate::metrics_schema::{AdapterKind, ExecutionId, ExecutionStatus, TaskKind};
use crate::statistical_router::StatisticalRouter;
use crate::tracker::ExecutionTracker;

/// Cooperative cancellation handle for an in-flight `dispatch`. Cloning
/// shares the same underlying flag, so the caller keeps one handle and
/// passes clones into `dispatch_cancellable` and wherever `cancel()` should
/// be callable from (e.g. a caller's own cancellation scope).
#[derive(Clone, Default)]
pub struct DispatchCancellation {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl DispatchCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested. Returns immediately
    /// if it already has been, so races with `cancel()` can't hang.
    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// A unit of work dispatched to an adapter. Carries only what the router
/// needs; adapter-specific payload lives in `payload`.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_kind: TaskKind,
    pub repos: Vec<String>,
    pub payload: serde_json::Value,
    /// Explicit adapter order supplied by the caller, taking precedence
    /// over any computed candidate order.
    pub preferred_adapters: Option<Vec<AdapterKind>>,
}

#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub output: serde_json::Value,
    pub cost_usd: Option<Decimal>,
}

/// Implemented once per execution backend. Methods beyond `execute` are
/// optional lifecycle hooks with inert defaults.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> AdapterKind;
    async fn execute(&self, task: &Task) -> Result<AdapterOutcome>;
    async fn health(&self) -> bool {
        true
    }
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Caller,
    CostOptimized,
    Statistical,
    StaticDefault,
}

#[derive(Debug, Clone, Copy)]
pub struct RouterLimits {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    pub default_timeout: Duration,
    pub ai_task_timeout: Duration,
}

impl Default for RouterLimits {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(30),
            default_timeout: Duration::from_secs(300),
            ai_task_timeout: Duration::from_secs(600),
        }
    }
}

impl RouterLimits {
    pub fn timeout_for(&self, task_kind: TaskKind) -> Duration {
        match task_kind {
            TaskKind::AiTask => self.ai_task_timeout,
            _ => self.default_timeout,
        }
    }

    /// Full-jitter exponential backoff for a given (1-indexed) attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let capped = (self.base_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        let jittered = rand::random::<f64>() * capped;
        Duration::from_secs_f64(jittered)
    }
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub adapter: AdapterKind,
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    /// Short taxonomy tag (`"adapter_transient"`, `"timeout"`, ...), used to
    /// pick a recovery hint for the terminal `DispatchResult`.
    pub error_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub task_kind: TaskKind,
    pub final_status: ExecutionStatus,
    pub winning_adapter: Option<AdapterKind>,
    /// One entry per individual execute() call, including retries of the
    /// same adapter.
    pub attempts: Vec<AttemptRecord>,
    /// Ordered, deduplicated adapters that were tried — what spec §8's
    /// scenarios call the "fallback chain". Its length, not
    /// `attempts.len()`, is what `routing_fallback_chain_length` observes.
    pub fallback_chain: Vec<AdapterKind>,
    pub output: Option<serde_json::Value>,
    pub cost_usd: Decimal,
    /// Terminal error message, populated only when `final_status != Success`.
    pub error: Option<String>,
    /// Static recovery hint keyed by error taxonomy, paired with `error`.
    pub recovery_hint: Option<String>,
}

impl DispatchResult {
    pub fn total_attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Number of hops between distinct adapters — one less than the
    /// fallback chain length.
    pub fn fallback_count(&self) -> usize {
        self.fallback_chain.len().saturating_sub(1)
    }
}

pub struct TaskRouter {
    adapters: Vec<Arc<dyn Adapter>>,
    tracker: Arc<ExecutionTracker>,
    statistical_router: Arc<StatisticalRouter>,
    cost_optimizer: Arc<CostOptimizer>,
    metrics: RoutingMetrics,
    limits: RouterLimits,
    candidate_source: CandidateSource,
}

impl TaskRouter {
    pub fn new(
        adapters: Vec<Arc<dyn Adapter>>,
        tracker: Arc<ExecutionTracker>,
        statistical_router: Arc<StatisticalRouter>,
        cost_optimizer: Arc<CostOptimizer>,
        metrics: RoutingMetrics,
        limits: RouterLimits,
        candidate_source: CandidateSource,
    ) -> Self {
        Self {
            adapters,
            tracker,
            statistical_router,
            cost_optimizer,
            metrics,
            limits,
            candidate_source,
        }
    }

    fn adapter_impl(&self, kind: AdapterKind) -> Option<&Arc<dyn Adapter>> {
        self.adapters.iter().find(|a| a.kind() == kind)
    }

    /// Resolves the order of adapters to try, per the configured
    /// `candidate_source`, falling back to `AdapterKind::ALL`'s static
    /// ordinal order when no preference signal is available.
    async fn candidate_order(&self, task: &Task) -> Vec<AdapterKind> {
        if let Some(preferred) = &task.preferred_adapters {
            if !preferred.is_empty() {
                return preferred.clone();
            }
        }

        match self.candidate_source {
            CandidateSource::CostOptimized => {
                let strategy = CostStrategy::default_for(task.task_kind);
                if let Some((best, _reasoning)) =
                    self.cost_optimizer.optimal_adapter(task.task_kind, strategy).await
                {
                    let mut order = vec![best.adapter];
                    order.extend(AdapterKind::ALL.into_iter().filter(|a| *a != best.adapter));
                    return order;
                }
            }
            CandidateSource::Statistical => {
                let preference = self.statistical_router.preference_order(task.task_kind).await;
                if !preference.adapters.is_empty() {
                    return preference.adapters;
                }
            }
            CandidateSource::Caller | CandidateSource::StaticDefault => {}
        }

        AdapterKind::ALL.to_vec()
    }

    /// Dispatches a task: walks the candidate order, retrying each adapter
    /// up to `max_attempts` times with full-jitter backoff before falling
    /// back to the next candidate. Returns once an attempt succeeds or the
    /// chain is exhausted. Never cancellable — equivalent to
    /// `dispatch_cancellable` with a handle nobody holds.
    pub async fn dispatch(&self, task: Task) -> DispatchResult {
        self.dispatch_cancellable(task, DispatchCancellation::new()).await
    }

    /// Like `dispatch`, but races every adapter call against `cancellation`.
    /// Once cancellation is observed, the in-flight attempt is reported as
    /// `cancelled` (not `failure`) and no further retries or fallback
    /// candidates are tried, per the cooperative cancellation contract.
    pub async fn dispatch_cancellable(
        &self,
        task: Task,
        cancellation: DispatchCancellation,
    ) -> DispatchResult {
        if self.adapters.is_empty() {
            return DispatchResult {
                task_kind: task.task_kind,
                final_status: ExecutionStatus::Failure,
                winning_adapter: None,
                attempts: Vec::new(),
                fallback_chain: Vec::new(),
                output: None,
                cost_usd: Decimal::ZERO,
                error: Some(RoutingError::NoAdapterAvailable.to_string()),
                recovery_hint: Some(
                    RoutingError::NoAdapterAvailable.recovery_hint().to_string(),
                ),
            };
        }

        let order = self.candidate_order(&task).await;
        self.metrics.routing_decision(
            order.first().map(|a| a.to_string()).unwrap_or_default().as_str(),
            &task.task_kind.to_string(),
        );

        let mut attempts = Vec::new();
        let mut fallback_chain = Vec::new();
        let mut total_cost = Decimal::ZERO;

        for adapter_kind in &order {
            if cancellation.is_cancelled() {
                return Self::cancelled_result(task.task_kind, attempts, fallback_chain, total_cost);
            }

            let Some(adapter_impl) = self.adapter_impl(*adapter_kind) else {
                continue;
            };

            if let Some(previous) = fallback_chain.last().copied() {
                self.metrics.fallback(&previous.to_string(), &adapter_kind.to_string());
            }
            fallback_chain.push(*adapter_kind);

            let outcome = self
                .run_with_retry(adapter_impl.as_ref(), *adapter_kind, &task, &cancellation)
                .await;

            match outcome {
                RunOutcome::Success(attempt, adapter_outcome) => {
                    if let Some(cost) = adapter_outcome.cost_usd {
                        total_cost += cost;
                    } else {
                        total_cost += self.cost_optimizer.track_execution_cost(
                            *adapter_kind,
                            task.task_kind,
                            &attempt.execution_id,
                            attempt.latency_ms,
                        );
                    }
                    attempts.push(attempt);
                    self.metrics.fallback_chain_length(fallback_chain.len());
                    return DispatchResult {
                        task_kind: task.task_kind,
                        final_status: ExecutionStatus::Success,
                        winning_adapter: Some(*adapter_kind),
                        attempts,
                        fallback_chain,
                        output: Some(adapter_outcome.output),
                        cost_usd: total_cost,
                        error: None,
                        recovery_hint: None,
                    };
                }
                RunOutcome::Exhausted(attempt) => {
                    attempts.push(attempt);
                }
                RunOutcome::Cancelled(attempt) => {
                    if let Some(attempt) = attempt {
                        attempts.push(attempt);
                    }
                    return Self::cancelled_result(
                        task.task_kind,
                        attempts,
                        fallback_chain,
                        total_cost,
                    );
                }
            }
        }

        self.metrics.fallback_chain_length(fallback_chain.len());
        let last = attempts.last();
        let error = last
            .and_then(|a| a.error.clone())
            .or_else(|| Some(RoutingError::NoAdapterAvailable.to_string()));
        let recovery_hint = Some(
            last.and_then(|a| a.error_tag.as_deref())
                .map(hint_for_tag)
                .unwrap_or_else(|| RoutingError::NoAdapterAvailable.recovery_hint())
                .to_string(),
        );
        DispatchResult {
            task_kind: task.task_kind,
            final_status: ExecutionStatus::Failure,
            winning_adapter: None,
            attempts,
            fallback_chain,
            output: None,
            cost_usd: total_cost,
            error,
            recovery_hint,
        }
    }

    fn cancelled_result(
        task_kind: TaskKind,
        attempts: Vec<AttemptRecord>,
        fallback_chain: Vec<AdapterKind>,
        cost_usd: Decimal,
    ) -> DispatchResult {
        DispatchResult {
            task_kind,
            final_status: ExecutionStatus::Cancelled,
            winning_adapter: None,
            attempts,
            fallback_chain,
            output: None,
            cost_usd,
            error: Some("dispatch cancelled".to_string()),
            recovery_hint: None,
        }
    }

    /// Retries a single adapter up to `max_attempts` times, racing every
    /// call against `cancellation`. Returns `Success` on a successful
    /// execute(), `Exhausted` once the retry budget for this adapter runs
    /// out, or `Cancelled` if cancellation was observed — either between
    /// attempts or mid-flight, racing the in-progress call.
    async fn run_with_retry(
        &self,
        adapter_impl: &dyn Adapter,
        adapter_kind: AdapterKind,
        task: &Task,
        cancellation: &DispatchCancellation,
    ) -> RunOutcome {
        let timeout = self.limits.timeout_for(task.task_kind);
        let mut last_failure = None;

        for attempt_num in 1..=self.limits.max_attempts {
            if cancellation.is_cancelled() {
                return RunOutcome::Cancelled(last_failure);
            }

            let execution_id =
                self.tracker
                    .record_start(adapter_kind, task.task_kind, task.repos.clone());
            let started = std::time::Instant::now();

            let call = std::panic::AssertUnwindSafe(adapter_impl.execute(task)).catch_unwind();

            let (status, error_type, error_message, outcome, was_cancelled) = tokio::select! {
                result = tokio::time::timeout(timeout, call) => match result {
                    Ok(Ok(Ok(outcome))) => (ExecutionStatus::Success, None, None, Some(outcome), false),
                    Ok(Ok(Err(err))) => (
                        ExecutionStatus::Failure,
                        Some(err.taxonomy_str().to_string()),
                        Some(err.to_string()),
                        None,
                        false,
                    ),
                    Ok(Err(_panic)) => (
                        ExecutionStatus::Failure,
                        Some("panic".to_string()),
                        Some("adapter execute() panicked".to_string()),
                        None,
                        false,
                    ),
                    Err(_elapsed) => (
                        ExecutionStatus::Timeout,
                        Some("timeout".to_string()),
                        Some(format!("exceeded {timeout:?}")),
                        None,
                        false,
                    ),
                },
                _ = cancellation.cancelled() => (
                    ExecutionStatus::Cancelled,
                    Some("cancelled".to_string()),
                    Some("dispatch cancelled by caller".to_string()),
                    None,
                    true,
                ),
            };

            let latency_ms = started.elapsed().as_millis() as u64;

            self.tracker
                .record_end(
                    &execution_id,
                    status,
                    Some(latency_ms),
                    error_type.clone(),
                    error_message.clone(),
                    None,
                )
                .await;
            self.metrics
                .adapter_execution(&adapter_kind.to_string(), status_label(status));
            self.metrics
                .adapter_latency(&adapter_kind.to_string(), latency_ms as f64 / 1000.0);

            let attempt = AttemptRecord {
                adapter: adapter_kind,
                execution_id: execution_id.clone(),
                status,
                latency_ms,
                error: error_message,
                error_tag: error_type.clone(),
            };

            if was_cancelled {
                return RunOutcome::Cancelled(Some(attempt));
            }

            if let Some(outcome) = outcome {
                return RunOutcome::Success(attempt, outcome);
            }

            let fatal = error_type.as_deref() == Some("adapter_fatal");
            last_failure = Some(attempt.clone());
            if fatal || attempt_num == self.limits.max_attempts {
                break;
            }
            tokio::time::sleep(self.limits.backoff_for(attempt_num)).await;
        }

        RunOutcome::Exhausted(last_failure.expect("at least one attempt always runs"))
    }
}

enum RunOutcome {
    Success(AttemptRecord, AdapterOutcome),
    Exhausted(AttemptRecord),
    Cancelled(Option<AttemptRecord>),
}

/// Maps an `AttemptRecord::error_tag` to a static recovery hint. Covers the
/// taxonomy tags from `RoutingError::taxonomy()` plus the two dispatch-local
/// tags (`"timeout"`, `"panic"`) that never become a `RoutingError`.
fn hint_for_tag(tag: &str) -> &'static str {
    match tag {
        "validation" => "check the request parameters and retry",
        "adapter_transient" => "the adapter is temporarily unavailable; retry later",
        "adapter_fatal" => "the request is not valid for this adapter",
        "budget_violation" => {
            "spending limit reached for this adapter/task; raise the budget or wait for the next period"
        }
        "timeout" => "the adapter exceeded its timeout; consider raising the SLA limit or retrying",
        _ => "an internal error occurred; this has been logged",
    }
}

fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Success => "success",
        ExecutionStatus::Failure => "failure",
        ExecutionStatus::Timeout => "timeout",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

impl RoutingError {
    fn taxonomy_str(&self) -> &'static str {
        match self.taxonomy() {
            crate::error::ErrorTaxonomy::Validation => "validation",
            crate::error::ErrorTaxonomy::AdapterTransient => "adapter_transient",
            crate::error::ErrorTaxonomy::AdapterFatal => "adapter_fatal",
            crate::error::ErrorTaxonomy::BudgetViolation => "budget_violation",
            crate::error::ErrorTaxonomy::Internal => "internal",
        }
    }
}
