//! Error taxonomy for the routing core.
//!
//! Every public entry point returns `Result<_, RoutingError>` — no panics,
//! no exceptions escaping `TaskRouter`. Background loops log and continue
//! rather than propagate (see the loops in `tracker`, `statistical_router`,
//! `cost_optimizer`, `alert_manager`).

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RoutingError {
    /// Bad input to the core: invalid period, negative limit, out-of-range
    /// probability. Never logged as an error — surfaced to the caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// I/O failure, 5xx, timeout from an adapter. Retried within the same
    /// adapter; drives fallback once retries are exhausted.
    #[error("adapter transient error on {adapter}: {message}")]
    AdapterTransient { adapter: String, message: String },

    /// 4xx (other than 408/429) or structural response error. Skips
    /// remaining retries and drives fallback immediately.
    #[error("adapter fatal error on {adapter}: {message}")]
    AdapterFatal { adapter: String, message: String },

    /// Selection-time budget constraint breach. Not an error to the
    /// caller — the adapter is disqualified for this decision only.
    #[error("budget violated for adapter {adapter}: spent {spent} > limit {limit}")]
    BudgetViolation {
        adapter: String,
        spent: String,
        limit: String,
    },

    /// No adapter was available to dispatch to.
    #[error("no adapter available")]
    NoAdapterAvailable,

    /// Bug or invariant violation. Logged with full context; the current
    /// request fails closed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RoutingError {
    /// Coarse taxonomy bucket, used for picking a recovery hint and for
    /// deciding whether a failure should drive a retry vs. an immediate
    /// fallback.
    pub fn taxonomy(&self) -> ErrorTaxonomy {
        match self {
            RoutingError::Validation(_) => ErrorTaxonomy::Validation,
            RoutingError::AdapterTransient { .. } => ErrorTaxonomy::AdapterTransient,
            RoutingError::AdapterFatal { .. } => ErrorTaxonomy::AdapterFatal,
            RoutingError::BudgetViolation { .. } => ErrorTaxonomy::BudgetViolation,
            RoutingError::NoAdapterAvailable | RoutingError::Internal(_) => {
                ErrorTaxonomy::Internal
            }
        }
    }

    /// Static recovery hint shown to callers alongside a terminal error.
    pub fn recovery_hint(&self) -> &'static str {
        match self.taxonomy() {
            ErrorTaxonomy::Validation => "check the request parameters and retry",
            ErrorTaxonomy::AdapterTransient => {
                "the adapter is temporarily unavailable; retry later"
            }
            ErrorTaxonomy::AdapterFatal => "the request is not valid for this adapter",
            ErrorTaxonomy::BudgetViolation => {
                "spending limit reached for this adapter/task; raise the budget or wait for the next period"
            }
            ErrorTaxonomy::Internal => "an internal error occurred; this has been logged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTaxonomy {
    Validation,
    AdapterTransient,
    AdapterFatal,
    BudgetViolation,
    Internal,
}

pub type Result<T> = std::result::Result<T, RoutingError>;
