//! Adaptive routing core: statistical adapter scoring, cost-aware
//! selection, retrying/fallback dispatch, and operational alerting for a
//! multi-adapter workflow orchestration platform.

pub mod alert_manager;
pub mod config;
pub mod cost_optimizer;
pub mod error;
pub mod feature_flags;
pub mod metrics;
pub mod metrics_schema;
pub mod statistical_router;
pub mod task_router;
pub mod tracker;

pub use error::{ErrorTaxonomy, Result, RoutingError};
pub use metrics_schema::{
    AbTest, AbVariant, ActiveExecution, AdapterKind, AdapterScore, AdapterStats, Alert, AlertKind,
    Budget, BudgetKind, Confidence, ExecutionId, ExecutionRecord, ExecutionStatus,
    ExperimentStatus, ExperimentWinner, PreferenceOrder, Severity, TaskKind,
};
pub use task_router::{
    Adapter, AdapterOutcome, DispatchCancellation, DispatchResult, Task, TaskRouter,
};
