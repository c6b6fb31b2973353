use dashmap::DashMap;
use tracing::info;

/// Process-local runtime switches that operations toggle in lock-step with
/// their forward and rollback steps, e.g. turning materialized columns off
/// while a table is detached.
#[derive(Debug, Default)]
pub struct FeatureFlags {
    flags: DashMap<String, bool>,
}

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, flag: &str, value: bool) {
        let previous = self.flags.insert(flag.to_string(), value);
        if previous != Some(value) {
            info!(flag, value, "feature flag changed");
        }
    }

    pub fn get(&self, flag: &str) -> Option<bool> {
        self.flags.get(flag).map(|v| *v)
    }
}
