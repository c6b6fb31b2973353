use std::{str::FromStr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use opentelemetry::KeyValue;
use semver::Version;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::{
    client::ClusterClients,
    definition::{
        operation_progress,
        MigrationContext,
        MigrationDefinition,
        MigrationDescription,
        RollbackPolicy,
    },
    error::Error,
    feature_flags::FeatureFlags,
    operation::{fingerprint, Database, Operation},
    registry::MigrationRegistry,
    version::{parse_service_version, VersionWindow},
    version_gate::{self, PendingMigrations},
};
use crate::{
    data_model::{MigrationRecord, MigrationRecordBuilder, MigrationStatus},
    metrics::{migration_engine::Metrics, Timer},
    state_store::{MigrationLockGuard, MigrationStateStore},
    utils::get_epoch_time_in_ms,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Another execution holds the lock. Nothing was changed.
    Busy,
    AlreadyCompleted,
    /// Live state already satisfies the migration; it was marked complete
    /// without running any operation.
    NotRequired,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    Busy,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetOutcome {
    Busy,
    Reset { previous: Option<MigrationRecord> },
}

enum Preconditions {
    NotRequired,
    Ready,
}

/// Drives migrations through their operations against persisted state.
///
/// Every mutation of a record happens while holding that migration's
/// single-flight lock. Reads never take the lock.
pub struct MigrationRunner {
    store: Arc<MigrationStateStore>,
    registry: Arc<MigrationRegistry>,
    ctx: MigrationContext,
    app_version: Version,
    rollback_policy: RollbackPolicy,
    metrics: Metrics,
}

impl MigrationRunner {
    pub fn new(
        store: Arc<MigrationStateStore>,
        registry: Arc<MigrationRegistry>,
        clients: ClusterClients,
        flags: Arc<FeatureFlags>,
        app_version: Version,
        rollback_policy: RollbackPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            ctx: MigrationContext::new(clients, flags),
            app_version,
            rollback_policy,
            metrics: Metrics::new(),
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.ctx.flags
    }

    pub fn app_version(&self) -> &Version {
        &self.app_version
    }

    pub fn pending(&self) -> Result<PendingMigrations> {
        version_gate::compute_pending(&self.app_version, &self.registry, &self.store)
    }

    pub fn status(&self, name: &str) -> Result<Option<MigrationRecord>> {
        self.store.get(name)
    }

    pub fn list(&self) -> Result<Vec<MigrationRecord>> {
        self.store.list()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationRecord> {
        self.store.subscribe()
    }

    pub fn describe(&self, name: &str) -> Result<MigrationDescription> {
        let definition = self.registry.lookup(name)?;
        Ok(MigrationDescription::from_definition(definition.as_ref()))
    }

    /// Runs `name` to completion, resuming at the persisted operation index
    /// if a previous execution stopped part way.
    #[tracing::instrument(skip(self, name), fields(migration = name))]
    pub async fn run(&self, name: &str) -> Result<RunOutcome> {
        let definition = self.registry.lookup(name)?;
        let Some(guard) = self.store.try_lock(name)? else {
            self.record_contention(name);
            return Ok(RunOutcome::Busy);
        };

        let result = self.run_locked(&guard, definition.as_ref()).await;
        let unlocked = self.store.unlock(guard);
        let outcome = result?;
        unlocked?;
        Ok(outcome)
    }

    /// Undoes the operations of an errored migration, newest first.
    #[tracing::instrument(skip(self, name), fields(migration = name))]
    pub async fn rollback(&self, name: &str) -> Result<RollbackOutcome> {
        let definition = self.registry.lookup(name)?;
        let Some(guard) = self.store.try_lock(name)? else {
            self.record_contention(name);
            return Ok(RollbackOutcome::Busy);
        };

        let result = self.rollback_errored(&guard, definition.as_ref()).await;
        let unlocked = self.store.unlock(guard);
        result?;
        unlocked?;
        Ok(RollbackOutcome::RolledBack)
    }

    /// Deletes the record of `name`. External state is left as it is; the
    /// next version gate pass recreates the record if the migration is due.
    #[tracing::instrument(skip(self, name), fields(migration = name))]
    pub fn reset(&self, name: &str) -> Result<ResetOutcome> {
        let Some(guard) = self.store.try_lock(name)? else {
            self.record_contention(name);
            return Ok(ResetOutcome::Busy);
        };
        let previous = self.store.get(name)?;
        if previous.is_some() {
            self.store.delete(&guard)?;
        }
        self.store.unlock(guard)?;
        if previous.as_ref().is_some_and(|r| r.status.is_in_flight()) {
            warn!("reset migration may have left external changes partially applied");
        }
        warn!(
            previous_status = previous.as_ref().map(|r| r.status.to_string()),
            "migration record reset by operator"
        );
        Ok(ResetOutcome::Reset { previous })
    }

    async fn run_locked(
        &self,
        guard: &MigrationLockGuard,
        definition: &dyn MigrationDefinition,
    ) -> Result<RunOutcome> {
        let name = definition.name();
        let operations = definition.operations();
        let previous = self
            .store
            .get(name)?
            .unwrap_or_else(|| MigrationRecord::new(name));
        let mut record = previous.clone();

        match record.status {
            MigrationStatus::CompletedSuccessfully => {
                info!("migration already completed");
                return Ok(RunOutcome::AlreadyCompleted);
            }
            MigrationStatus::RolledBack => {
                record.transition(MigrationStatus::NotStarted)?;
                record = MigrationRecordBuilder::default()
                    .name(name.to_string())
                    .created_at(record.created_at)
                    .build()?;
            }
            _ => {}
        }

        let range = definition.app_version_range();
        if range.window(&self.app_version) != VersionWindow::Within {
            return Err(Error::NotApplicable {
                migration: name.to_string(),
                range: range.to_string(),
                app_version: self.app_version.to_string(),
            }
            .into());
        }

        let current_fingerprint = fingerprint(operations)?;
        record.transition(MigrationStatus::Starting)?;
        self.store.upsert(guard, &record)?;

        match self
            .check_preconditions(definition, &record, &current_fingerprint)
            .await
        {
            Ok(Preconditions::Ready) => {}
            Ok(Preconditions::NotRequired) => {
                record.transition(MigrationStatus::CompletedSuccessfully)?;
                record.progress = 100.0;
                record.finished_at = Some(get_epoch_time_in_ms());
                self.store.upsert(guard, &record)?;
                self.metrics
                    .migrations_completed
                    .add(1, &[KeyValue::new("migration", name.to_string())]);
                info!("migration is no longer required, marked as completed");
                return Ok(RunOutcome::NotRequired);
            }
            Err(err) => {
                if err
                    .downcast_ref::<Error>()
                    .is_some_and(|err| err.is_precondition())
                {
                    self.metrics
                        .precondition_failures
                        .add(1, &[KeyValue::new("migration", name.to_string())]);
                }
                warn!(error = format!("{err:#}"), "migration preconditions not met");
                if let Err(restore_err) = self.store.upsert(guard, &previous) {
                    error!(
                        error = format!("{restore_err:#}"),
                        "failed to restore record after precondition failure"
                    );
                    return Err(restore_err.context(format!(
                        "restoring record of {name} after precondition failure: {err:#}"
                    )));
                }
                return Err(err);
            }
        }

        let now = get_epoch_time_in_ms();
        record.started_at.get_or_insert(now);
        record.finished_at = None;
        record.last_error = None;
        record.app_version = Some(self.app_version.to_string());
        record.operations_fingerprint = Some(current_fingerprint);
        record.executor_id = Some(self.store.instance_id().to_string());
        record.transition(MigrationStatus::Running)?;
        self.store.upsert(guard, &record)?;
        info!(
            start_index = record.current_operation_index,
            operations = operations.len(),
            "running migration"
        );

        let start = record.current_operation_index;
        for (index, operation) in operations.iter().enumerate().skip(start) {
            record.current_operation_index = index;
            if let Err(err) = self.execute_forward(name, index, operation).await {
                return self.fail(guard, definition, record, index, err).await;
            }
            record.current_operation_index = index + 1;
            let progress = self.progress(definition, &record).await;
            record.update_progress(progress);
            record.updated_at = get_epoch_time_in_ms();
            self.store.upsert(guard, &record)?;
        }

        record.transition(MigrationStatus::CompletedSuccessfully)?;
        record.current_operation_index = operations.len();
        record.progress = 100.0;
        record.finished_at = Some(get_epoch_time_in_ms());
        self.store.upsert(guard, &record)?;
        self.metrics
            .migrations_completed
            .add(1, &[KeyValue::new("migration", name.to_string())]);
        info!("migration completed");
        Ok(RunOutcome::Completed)
    }

    /// Returns an error when the migration must not start. The caller
    /// restores the record as it was before the attempt.
    async fn check_preconditions(
        &self,
        definition: &dyn MigrationDefinition,
        record: &MigrationRecord,
        current_fingerprint: &str,
    ) -> Result<Preconditions> {
        let name = definition.name();

        let required = definition
            .is_required(&self.ctx)
            .await
            .with_context(|| format!("checking whether migration {name} is required"))?;
        if !required {
            return Ok(Preconditions::NotRequired);
        }

        for requirement in definition.service_version_requirements() {
            let database = Database::from_str(&requirement.service).map_err(|_| {
                anyhow!(
                    "migration {} requires unknown service {}",
                    name,
                    requirement.service
                )
            })?;
            let reported = self
                .ctx
                .clients
                .get(database)?
                .introspect_version()
                .await
                .with_context(|| format!("introspecting {} version", requirement.service))?;
            let actual = parse_service_version(&reported)?;
            if !requirement.is_satisfied_by(&actual) {
                return Err(Error::IncompatibleServiceVersion {
                    migration: name.to_string(),
                    service: requirement.service.clone(),
                    required: requirement.supported_version.to_string(),
                    actual: reported,
                }
                .into());
            }
        }

        let health = definition.healthcheck(&self.ctx).await.map_err(|err| {
            Error::HealthcheckFailed {
                migration: name.to_string(),
                detail: format!("{err:#}"),
            }
        })?;
        if !health.ok {
            return Err(Error::HealthcheckFailed {
                migration: name.to_string(),
                detail: health
                    .detail
                    .unwrap_or_else(|| "no detail reported".to_string()),
            }
            .into());
        }

        if let Some(recorded) = &record.operations_fingerprint {
            if record.current_operation_index > 0 && recorded != current_fingerprint {
                return Err(Error::OperationsChanged {
                    migration: name.to_string(),
                    recorded: recorded.clone(),
                    current: current_fingerprint.to_string(),
                }
                .into());
            }
        }

        Ok(Preconditions::Ready)
    }

    async fn execute_forward(&self, name: &str, index: usize, operation: &Operation) -> Result<()> {
        let labels = [
            KeyValue::new("migration", name.to_string()),
            KeyValue::new("direction", "forward"),
        ];
        let _timer = Timer::start_with_labels(&self.metrics.operation_duration, &labels);
        info!(
            operation_index = index,
            database = %operation.database,
            statement = %operation.forward,
            "executing operation"
        );
        self.ctx
            .clients
            .execute(operation.database, &operation.forward)
            .await
            .with_context(|| format!("operation {index} on {}", operation.database))?;
        if let Some(side_effect) = &operation.side_effect {
            side_effect.apply(&self.ctx.flags);
        }
        self.metrics.operations_executed.add(1, &labels[..1]);
        Ok(())
    }

    async fn execute_rollback(&self, name: &str, index: usize, operation: &Operation) -> Result<()> {
        let Some(statement) = &operation.rollback else {
            return Err(Error::NotReversible {
                migration: name.to_string(),
                index,
            }
            .into());
        };
        let labels = [
            KeyValue::new("migration", name.to_string()),
            KeyValue::new("direction", "rollback"),
        ];
        let _timer = Timer::start_with_labels(&self.metrics.operation_duration, &labels);
        info!(
            operation_index = index,
            database = %operation.database,
            statement = %statement,
            "rolling back operation"
        );
        self.ctx
            .clients
            .execute(operation.database, statement)
            .await
            .with_context(|| format!("rollback of operation {index} on {}", operation.database))?;
        if let Some(side_effect) = &operation.side_effect_rollback {
            side_effect.apply(&self.ctx.flags);
        }
        self.metrics.rollbacks_executed.add(1, &labels[..1]);
        Ok(())
    }

    async fn fail(
        &self,
        guard: &MigrationLockGuard,
        definition: &dyn MigrationDefinition,
        mut record: MigrationRecord,
        index: usize,
        err: anyhow::Error,
    ) -> Result<RunOutcome> {
        let name = definition.name();
        let message = format!("{err:#}");
        error!(operation_index = index, error = message, "migration operation failed");
        self.metrics
            .operations_failed
            .add(1, &[KeyValue::new("migration", name.to_string())]);

        record.transition(MigrationStatus::Errored)?;
        record.current_operation_index = index;
        record.last_error = Some(message.clone());
        self.store.upsert(guard, &record)?;

        let policy = definition.rollback_policy().unwrap_or(self.rollback_policy);
        if policy == RollbackPolicy::Automatic {
            info!("rolling back automatically");
            if let Err(rollback_err) = self.rollback_record(guard, definition, record).await {
                error!(
                    error = format!("{rollback_err:#}"),
                    "automatic rollback did not complete"
                );
            }
        }

        Err(Error::OperationFailed {
            migration: name.to_string(),
            index,
            message,
        }
        .into())
    }

    async fn rollback_errored(
        &self,
        guard: &MigrationLockGuard,
        definition: &dyn MigrationDefinition,
    ) -> Result<()> {
        let name = definition.name();
        let record = self
            .store
            .get(name)?
            .unwrap_or_else(|| MigrationRecord::new(name));
        if record.status != MigrationStatus::Errored {
            return Err(Error::InvalidTransition {
                migration: name.to_string(),
                action: "roll back",
                status: record.status,
            }
            .into());
        }
        self.rollback_record(guard, definition, record).await
    }

    /// Walks from the current operation down to the first one. The position
    /// is persisted after every undone step so an interrupted rollback can be
    /// resumed by invoking rollback again.
    async fn rollback_record(
        &self,
        guard: &MigrationLockGuard,
        definition: &dyn MigrationDefinition,
        mut record: MigrationRecord,
    ) -> Result<()> {
        let name = definition.name();
        let operations = definition.operations();
        let undo = match operations.len() {
            0 => &operations[..0],
            len => &operations[..=record.current_operation_index.min(len - 1)],
        };
        if let Some(index) = undo.iter().position(|op| !op.is_reversible()) {
            return Err(Error::NotReversible {
                migration: name.to_string(),
                index,
            }
            .into());
        }

        for (index, operation) in undo.iter().enumerate().rev() {
            if let Err(err) = self.execute_rollback(name, index, operation).await {
                let message = format!("{err:#}");
                error!(
                    operation_index = index,
                    error = message,
                    "rollback failed, manual intervention required"
                );
                self.metrics
                    .rollbacks_failed
                    .add(1, &[KeyValue::new("migration", name.to_string())]);
                record.current_operation_index = index;
                record.last_error = Some(format!("rollback failed: {message}"));
                record.updated_at = get_epoch_time_in_ms();
                self.store.upsert(guard, &record)?;
                return Err(Error::RollbackFailed {
                    migration: name.to_string(),
                    index,
                    message,
                }
                .into());
            }
            if index > 0 {
                record.current_operation_index = index - 1;
                record.updated_at = get_epoch_time_in_ms();
                self.store.upsert(guard, &record)?;
            }
        }

        record.transition(MigrationStatus::RolledBack)?;
        record.current_operation_index = 0;
        record.progress = 0.0;
        record.finished_at = Some(get_epoch_time_in_ms());
        self.store.upsert(guard, &record)?;
        info!("migration rolled back");
        Ok(())
    }

    /// A failing or nonsensical progress hook never stops a migration; the
    /// share of executed operations is used instead.
    async fn progress(&self, definition: &dyn MigrationDefinition, record: &MigrationRecord) -> f64 {
        let fallback = || operation_progress(record, definition.operations().len());
        match definition.progress(&self.ctx, record).await {
            Ok(progress) if progress.is_finite() => progress,
            Ok(progress) => {
                warn!(progress, "progress hook returned a non-finite value");
                fallback()
            }
            Err(err) => {
                warn!(error = format!("{err:#}"), "progress hook failed");
                fallback()
            }
        }
    }

    fn record_contention(&self, name: &str) {
        self.metrics
            .lock_contention
            .add(1, &[KeyValue::new("migration", name.to_string())]);
        info!("migration is locked by another execution");
    }
}
