//! Value types shared across the routing core: adapters, task kinds,
//! execution records, and the rolling statistics derived from them.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Closed set of execution backends. Extensible by convention — additions
/// must also touch the scoring weights (`statistical_router`) and the
/// default cost table (`cost_optimizer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Prefect,
    Agno,
    Llamaindex,
}

impl AdapterKind {
    /// All adapters in the system's static default ordinal order. Used as
    /// the tie-break of last resort in preference ordering and as the
    /// static default chain when no statistics exist.
    pub const ALL: [AdapterKind; 3] = [
        AdapterKind::Prefect,
        AdapterKind::Agno,
        AdapterKind::Llamaindex,
    ];
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Prefect => write!(f, "prefect"),
            AdapterKind::Agno => write!(f, "agno"),
            AdapterKind::Llamaindex => write!(f, "llamaindex"),
        }
    }
}

/// Closed set of task classes. Each maps to a default scoring profile
/// (see `statistical_router::weights_for`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Workflow,
    AiTask,
    RagQuery,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Workflow => write!(f, "workflow"),
            TaskKind::AiTask => write!(f, "ai_task"),
            TaskKind::RagQuery => write!(f, "rag_query"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }
}

/// A globally unique, lexicographically sortable execution identifier.
/// Also doubles as the correlation ID handed to external systems.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        ExecutionId(Ulid::new().to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single attempt at executing a task on an adapter.
///
/// Invariant: `start_ts <= end_ts`; `status == Success` implies
/// `error_type` and `error_message` are both `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub adapter: AdapterKind,
    pub task_kind: TaskKind,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub latency_ms: u64,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub cost_usd: Option<Decimal>,
    /// Repositories touched by this task, carried for audit/correlation
    /// only — never scored on.
    pub repos: Vec<String>,
    /// Free-form metadata; intentionally dynamic per the data model's
    /// allowance for scalar maps.
    pub metadata: HashMap<String, String>,
}

impl ExecutionRecord {
    pub fn is_valid(&self) -> bool {
        if self.start_ts > self.end_ts {
            return false;
        }
        if self.status.is_success() && (self.error_type.is_some() || self.error_message.is_some())
        {
            return false;
        }
        true
    }
}

/// Transient entry for an in-flight execution, held by the tracker until
/// `RecordEnd` removes it (or the aggregation loop's TTL ages it out).
#[derive(Debug, Clone)]
pub struct ActiveExecution {
    pub start_ts: DateTime<Utc>,
    pub adapter: AdapterKind,
    pub task_kind: TaskKind,
    pub repos: Vec<String>,
}

/// Rolling, process-wide statistics for a single adapter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdapterStats {
    pub success_count: u64,
    pub failure_count: u64,
}

impl AdapterStats {
    pub fn total(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// `None` unless `total >= min_samples`.
    pub fn success_rate(&self, min_samples: u64) -> Option<f64> {
        let total = self.total();
        if total < min_samples {
            return None;
        }
        if total == 0 {
            return None;
        }
        Some(self.success_count as f64 / total as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
    Insufficient,
}

impl Confidence {
    /// Confidence tier for a given sample count, per the thresholds of
    /// `scoring.min_samples` (high), 50 (medium), 20 (low).
    pub fn for_sample_count(n: u64, min_samples_high: u64) -> Self {
        if n >= min_samples_high {
            Confidence::High
        } else if n >= 50 {
            Confidence::Medium
        } else if n >= 20 {
            Confidence::Low
        } else {
            Confidence::Insufficient
        }
    }
}

/// Score computed for a single `(adapter, task_kind)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterScore {
    pub adapter: AdapterKind,
    pub task_kind: TaskKind,
    pub success_rate: f64,
    pub latency_score: f64,
    pub combined_score: f64,
    pub sample_count: u64,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbVariant {
    A,
    B,
    None,
}

/// Ranked adapter list for a task kind, produced by statistical scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceOrder {
    pub task_kind: TaskKind,
    pub adapters: Vec<AdapterKind>,
    pub scores: Vec<AdapterScore>,
    pub generated_at: DateTime<Utc>,
    pub confidence: Confidence,
    pub ab_variant: AbVariant,
}

impl PreferenceOrder {
    pub fn chain(&self) -> &[AdapterKind] {
        &self.adapters
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Daily,
    Weekly,
    Monthly,
    PerTaskType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub kind: BudgetKind,
    pub limit_usd: Decimal,
    pub adapter: Option<AdapterKind>,
    pub task_kind: Option<TaskKind>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub alert_threshold: f64,
}

impl Budget {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.period_start <= now && now <= self.period_end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    Completed,
    RolledBack,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentWinner {
    A,
    B,
    Inconclusive,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTest {
    pub experiment_id: String,
    pub task_kind: TaskKind,
    pub variant_a: PreferenceOrder,
    pub variant_b: PreferenceOrder,
    pub traffic_split: f64,
    pub status: ExperimentStatus,
    pub winner: ExperimentWinner,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    AdapterDegradation,
    CostSpike,
    ExcessiveFallbacks,
    HighLatency,
    BudgetExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub adapter: Option<AdapterKind>,
    pub current_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_record_validity() {
        let now = Utc::now();
        let mut rec = ExecutionRecord {
            execution_id: ExecutionId::new(),
            adapter: AdapterKind::Prefect,
            task_kind: TaskKind::Workflow,
            start_ts: now,
            end_ts: now,
            status: ExecutionStatus::Success,
            latency_ms: 0,
            error_type: None,
            error_message: None,
            cost_usd: None,
            repos: vec![],
            metadata: HashMap::new(),
        };
        assert!(rec.is_valid());
        rec.error_type = Some("x".into());
        assert!(!rec.is_valid());
    }

    #[test]
    fn adapter_stats_success_rate_requires_min_samples() {
        let stats = AdapterStats {
            success_count: 5,
            failure_count: 3,
        };
        assert_eq!(stats.total(), 8);
        assert!(stats.success_rate(10).is_none());
        assert!(stats.success_rate(5).is_some());
    }

    #[test]
    fn confidence_tiers() {
        assert_eq!(Confidence::for_sample_count(100, 100), Confidence::High);
        assert_eq!(Confidence::for_sample_count(50, 100), Confidence::Medium);
        assert_eq!(Confidence::for_sample_count(20, 100), Confidence::Low);
        assert_eq!(Confidence::for_sample_count(5, 100), Confidence::Insufficient);
    }

    #[test]
    fn execution_id_is_sortable_and_unique() {
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn budget_active_is_closed_interval() {
        let now = Utc::now();
        let budget = Budget {
            kind: BudgetKind::Daily,
            limit_usd: Decimal::new(100, 0),
            adapter: None,
            task_kind: None,
            period_start: now,
            period_end: now,
            alert_threshold: 0.9,
        };
        assert!(budget.is_active(now));
    }
}
