use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    client::ClusterClients,
    feature_flags::FeatureFlags,
    operation::Operation,
    version::{AppVersionRange, ServiceVersionRequirement},
};
use crate::data_model::MigrationRecord;

/// Whether the engine undoes a migration on its own after a forward step
/// fails, or waits for an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    #[default]
    Manual,
    Automatic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckResult {
    pub ok: bool,
    pub detail: Option<String>,
}

impl HealthcheckResult {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Names definitions interpolate into their statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    pub database: String,
    pub cluster: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            database: "default".to_string(),
            cluster: "migrator".to_string(),
        }
    }
}

/// What the hooks of a definition get to work with.
#[derive(Clone)]
pub struct MigrationContext {
    pub clients: ClusterClients,
    pub flags: Arc<FeatureFlags>,
}

impl MigrationContext {
    pub fn new(clients: ClusterClients, flags: Arc<FeatureFlags>) -> Self {
        Self { clients, flags }
    }
}

/// A named, versioned unit of infrastructure change.
///
/// `operations` is index-addressed and must never be reordered or shortened
/// once shipped: persisted records point into it.
#[async_trait]
pub trait MigrationDefinition: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn app_version_range(&self) -> &AppVersionRange;

    fn service_version_requirements(&self) -> &[ServiceVersionRequirement] {
        &[]
    }

    fn operations(&self) -> &[Operation];

    /// Templates are only registered in development mode.
    fn is_example(&self) -> bool {
        false
    }

    /// Overrides the engine-wide rollback policy for this migration.
    fn rollback_policy(&self) -> Option<RollbackPolicy> {
        None
    }

    /// Whether live state still needs this migration. A migration that was
    /// satisfied organically is marked complete without running.
    async fn is_required(&self, _ctx: &MigrationContext) -> Result<bool> {
        Ok(true)
    }

    /// Precondition gate run right before operations start.
    async fn healthcheck(&self, _ctx: &MigrationContext) -> Result<HealthcheckResult> {
        Ok(HealthcheckResult::healthy())
    }

    /// Percentage complete. Defaults to the share of operations executed.
    async fn progress(&self, _ctx: &MigrationContext, record: &MigrationRecord) -> Result<f64> {
        Ok(operation_progress(record, self.operations().len()))
    }
}

pub fn operation_progress(record: &MigrationRecord, total_operations: usize) -> f64 {
    if total_operations == 0 {
        return 100.0;
    }
    100.0 * record.current_operation_index.min(total_operations) as f64 / total_operations as f64
}

/// Serializable view of a definition, used to inspect pending work.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationDescription {
    pub name: String,
    pub description: String,
    pub app_version_range: AppVersionRange,
    pub service_version_requirements: Vec<ServiceVersionRequirement>,
    pub reversible: bool,
    pub operations: Vec<Operation>,
}

impl MigrationDescription {
    pub fn from_definition(definition: &dyn MigrationDefinition) -> Self {
        Self {
            name: definition.name().to_string(),
            description: definition.description().to_string(),
            app_version_range: definition.app_version_range().clone(),
            service_version_requirements: definition.service_version_requirements().to_vec(),
            reversible: definition.operations().iter().all(|op| op.is_reversible()),
            operations: definition.operations().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_progress() {
        let mut record = MigrationRecord::new("m");
        assert_eq!(operation_progress(&record, 4), 0.0);
        record.current_operation_index = 1;
        assert_eq!(operation_progress(&record, 4), 25.0);
        record.current_operation_index = 9;
        assert_eq!(operation_progress(&record, 4), 100.0);
        assert_eq!(operation_progress(&record, 0), 100.0);
    }

    #[test]
    fn test_rollback_policy_config_names() -> Result<()> {
        let policy: RollbackPolicy = serde_json::from_str("\"automatic\"")?;
        assert_eq!(policy, RollbackPolicy::Automatic);
        assert_eq!(RollbackPolicy::default(), RollbackPolicy::Manual);
        Ok(())
    }
}
