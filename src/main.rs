//! Composition root: wires the tracker, statistical router, cost
//! optimizer, alert manager, and task router together and starts their
//! background loops. Concrete adapter implementations (the HTTP clients
//! for Prefect/Agno/LlamaIndex) are external collaborators and are not
//! part of this crate — see `task_router::Adapter`.

use std::sync::Arc;

use routing_core::alert_manager::{AlertManager, AlertThresholds, LoggingAlertSink};
use routing_core::config::RoutingConfig;
use routing_core::cost_optimizer::{CostOptimizer, CostOptimizerConfig};
use routing_core::feature_flags::FeatureFlags;
use routing_core::metrics::RoutingMetrics;
use routing_core::statistical_router::{StatisticalRouter, StatisticalRouterConfig};
use routing_core::task_router::{CandidateSource, RouterLimits, TaskRouter};
use routing_core::tracker::{ExecutionTracker, TrackerConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RoutingConfig::from_env();
    let flags = FeatureFlags::default();
    let metrics = flags
        .is_enabled("prometheus_metrics_enabled")
        .then(|| RoutingMetrics::new("routing-core"));

    let tracker_config = TrackerConfig {
        sampling_strategy: map_sampling_strategy(config.sampling.strategy),
        sampling_rate: config.sampling.rate,
        batch_size: config.batch.size,
        batch_timeout: std::time::Duration::from_millis(config.batch.timeout_ms),
        aggregate_interval: std::time::Duration::from_millis(config.aggregate.interval_ms),
        min_samples: config.scoring.min_samples,
        ..TrackerConfig::default()
    };
    let tracker = ExecutionTracker::new(tracker_config, None);
    tracker.start_aggregation_loop();

    let statistical_router = if flags.is_enabled("learning_system_enabled") {
        let router_config = StatisticalRouterConfig {
            min_samples_high: config.scoring.min_samples,
            cache_ttl: std::time::Duration::from_secs(config.scoring.cache_ttl_h * 3600),
        };
        let router = StatisticalRouter::new(router_config, Arc::clone(&tracker), metrics.clone());
        router.start_recalculation_loop();
        router
    } else {
        StatisticalRouter::new(StatisticalRouterConfig::default(), Arc::clone(&tracker), None)
    };

    let cost_optimizer = CostOptimizer::new(
        CostOptimizerConfig {
            cost_per_second_usd: config.cost.per_adapter_usd_per_s.clone(),
            ..CostOptimizerConfig::default()
        },
        Arc::clone(&tracker),
        metrics.clone(),
    );
    let logging_sink: Arc<dyn routing_core::alert_manager::AlertSink> = Arc::new(LoggingAlertSink);
    cost_optimizer.add_sink(Arc::clone(&logging_sink));
    cost_optimizer.start_budget_monitor_loop();

    let alert_manager = AlertManager::new(
        AlertThresholds {
            success_rate_threshold: config.alerts.success_rate_threshold,
            fallback_rate_threshold: config.alerts.fallback_rate_threshold,
            latency_p95_threshold_ms: config.alerts.latency_p95_threshold_ms,
            cost_spike_multiplier: config.alerts.cost_spike_multiplier,
            evaluation_interval: std::time::Duration::from_secs(config.alerts.evaluation_interval_s),
        },
        Arc::clone(&tracker),
        Arc::clone(&cost_optimizer),
        None,
        vec![logging_sink],
        metrics.clone(),
    );
    alert_manager.start();

    let _router = TaskRouter::new(
        Vec::new(),
        Arc::clone(&tracker),
        Arc::clone(&statistical_router),
        Arc::clone(&cost_optimizer),
        metrics.clone().unwrap_or_else(|| RoutingMetrics::new("routing-core")),
        RouterLimits::default(),
        CandidateSource::Statistical,
    );

    tracing::info!("routing core composition root started; awaiting shutdown signal");
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining");
    alert_manager.stop().await;
    tracker.stop().await;
}

fn map_sampling_strategy(
    strategy: routing_core::config::SamplingStrategy,
) -> routing_core::tracker::SamplingStrategy {
    use routing_core::config::SamplingStrategy as Cfg;
    use routing_core::tracker::SamplingStrategy as Tracker;
    match strategy {
        Cfg::Full => Tracker::Full,
        Cfg::LowFrequency => Tracker::LowFrequency,
        Cfg::HighFrequency => Tracker::HighFrequency,
        Cfg::Adaptive => Tracker::Adaptive,
    }
}
