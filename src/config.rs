//! External configuration surface consumed by the routing core.
//!
//! File-format parsing (TOML/YAML) is out of scope for this crate; this
//! module only defines the recognized keys (spec §6), their defaults, and
//! an environment-variable overlay, mirroring
//! `llm_router::config::RouterConfig::from_env`.

use std::collections::HashMap;
use std::env;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::metrics_schema::AdapterKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    Full,
    HighFrequency,
    LowFrequency,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostStrategy {
    Interactive,
    Batch,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub strategy: SamplingStrategy,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub size: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub min_samples: u64,
    pub confidence_interval: f64,
    pub recalc_interval_h: u64,
    pub cache_ttl_h: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    pub per_adapter_usd_per_s: HashMap<AdapterKind, Decimal>,
    pub default_strategy: CostStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaConfig {
    pub max_latency_ms: u64,
    pub min_success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub success_rate_threshold: f64,
    pub fallback_rate_threshold: f64,
    pub latency_p95_threshold_ms: u64,
    pub cost_spike_multiplier: f64,
    pub evaluation_interval_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub sampling: SamplingConfig,
    pub batch: BatchConfig,
    pub aggregate: AggregateConfig,
    pub scoring: ScoringConfig,
    pub cost: CostConfig,
    pub sla: SlaConfig,
    pub alerts: AlertsConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let mut per_adapter_usd_per_s = HashMap::new();
        per_adapter_usd_per_s.insert(AdapterKind::Prefect, Decimal::new(1, 4)); // 1e-4
        per_adapter_usd_per_s.insert(AdapterKind::Agno, Decimal::new(2, 4)); // 2e-4
        per_adapter_usd_per_s.insert(AdapterKind::Llamaindex, Decimal::new(5, 5)); // 5e-5

        Self {
            sampling: SamplingConfig {
                strategy: SamplingStrategy::Full,
                rate: 1.0,
            },
            batch: BatchConfig {
                size: 100,
                timeout_ms: 5_000,
            },
            aggregate: AggregateConfig {
                interval_ms: 60_000,
            },
            scoring: ScoringConfig {
                min_samples: 100,
                confidence_interval: 0.95,
                recalc_interval_h: 168,
                cache_ttl_h: 1,
            },
            cost: CostConfig {
                per_adapter_usd_per_s,
                default_strategy: CostStrategy::Batch,
            },
            sla: SlaConfig {
                max_latency_ms: 5_000,
                min_success_rate: 0.8,
            },
            alerts: AlertsConfig {
                success_rate_threshold: 0.95,
                fallback_rate_threshold: 0.10,
                latency_p95_threshold_ms: 5_000,
                cost_spike_multiplier: 2.0,
                evaluation_interval_s: 60,
            },
        }
    }
}

impl RoutingConfig {
    /// Overrides defaults from `ROUTING_*` environment variables, mirroring
    /// the override-over-defaults pattern in `RouterConfig::from_env`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(rate) = env::var("ROUTING_SAMPLING_RATE") {
            if let Ok(parsed) = rate.parse::<f64>() {
                config.sampling.rate = parsed;
            }
        }

        if let Ok(size) = env::var("ROUTING_BATCH_SIZE") {
            if let Ok(parsed) = size.parse::<usize>() {
                config.batch.size = parsed;
            }
        }

        if let Ok(min_samples) = env::var("ROUTING_SCORING_MIN_SAMPLES") {
            if let Ok(parsed) = min_samples.parse::<u64>() {
                config.scoring.min_samples = parsed;
            }
        }

        config
    }

    pub fn decimal_ge_zero(value: Decimal, field: &str) -> crate::error::Result<()> {
        if value < Decimal::ZERO {
            return Err(crate::error::RoutingError::Validation(format!(
                "{field} must be >= 0, got {value}"
            )));
        }
        Ok(())
    }
}
