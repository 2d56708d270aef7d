//! Read-only feature-flag predicate used at hot paths.
//!
//! Replaces the source system's decorator-based gating: every public
//! entry point that needs a flag check calls `is_enabled` directly rather
//! than being wrapped, and a failing check returns a structured "feature
//! disabled" result rather than raising.

use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct FeatureFlags {
    enabled: HashSet<String>,
}

impl FeatureFlags {
    pub fn new(enabled: impl IntoIterator<Item = String>) -> Self {
        Self {
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }
}

impl Default for FeatureFlags {
    /// Matches the source's defaults: metrics and learning are on unless
    /// explicitly disabled.
    fn default() -> Self {
        Self::new([
            "prometheus_metrics_enabled".to_string(),
            "learning_system_enabled".to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_metrics_and_learning() {
        let flags = FeatureFlags::default();
        assert!(flags.is_enabled("prometheus_metrics_enabled"));
        assert!(flags.is_enabled("learning_system_enabled"));
        assert!(!flags.is_enabled("something_else"));
    }

    #[test]
    fn custom_set_only_enables_listed_flags() {
        let flags = FeatureFlags::new(["learning_system_enabled".to_string()]);
        assert!(!flags.is_enabled("prometheus_metrics_enabled"));
        assert!(flags.is_enabled("learning_system_enabled"));
    }
}
