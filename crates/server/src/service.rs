use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
    config::MigratorConfig,
    data_model::MigrationRecord,
    metrics::init_provider,
    migrations::{
        client::{clickhouse::ClickHouseClient, ClusterClients},
        definition::MigrationDescription,
        feature_flags::FeatureFlags,
        operation::Database,
        registry::MigrationRegistry,
        runner::MigrationRunner,
        version_gate::{self, PendingMigrations},
    },
    state_store::{MigrationStateStore, ReadOnlyStateStore},
};

/// Everything a migrator process needs, assembled from config.
pub struct Service {
    pub config: Arc<MigratorConfig>,
    pub state: Arc<MigrationStateStore>,
    pub runner: Arc<MigrationRunner>,
    /// Result of the version gate pass done at startup.
    pub pending: PendingMigrations,
}

impl Service {
    /// Opens the store, loads the registry and runs the version gate. Any
    /// configuration error, including a missed migration window, fails
    /// startup.
    pub async fn new(config: MigratorConfig) -> Result<Self> {
        let clickhouse = Arc::new(
            ClickHouseClient::new(config.clickhouse.clone())
                .context("creating clickhouse client")?,
        );
        let clients = ClusterClients::new().with_client(Database::ClickHouse, clickhouse);
        Self::with_clients(config, clients).await
    }

    pub async fn with_clients(config: MigratorConfig, clients: ClusterClients) -> Result<Self> {
        let config = Arc::new(config);
        let instance_id = config.instance_id();
        let app_version = config.app_version()?;
        init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_ref(),
            config.telemetry.metrics_interval,
            &instance_id,
            env!("CARGO_PKG_VERSION"),
        )?;

        let state = MigrationStateStore::new(config.state_store_path.parse()?, &instance_id)
            .await
            .context("opening migration state store")?;
        let registry = Arc::new(MigrationRegistry::new(
            &config.cluster_settings(),
            config.dev_mode,
        )?);

        let runner = Arc::new(MigrationRunner::new(
            state.clone(),
            registry,
            clients,
            Arc::new(FeatureFlags::new()),
            app_version,
            config.rollback_policy,
        ));

        let pending = runner.pending()?;
        if !pending.required.is_empty() {
            warn!(
                migrations = ?pending.required,
                app_version = %runner.app_version(),
                "migrations must complete before upgrading past this version"
            );
        }
        info!(
            required = pending.required.len(),
            optional = pending.optional.len(),
            app_version = %runner.app_version(),
            "computed pending migrations"
        );

        Ok(Self {
            config,
            state,
            runner,
            pending,
        })
    }
}

/// Answers status queries while another process holds the state store open
/// for writing. Nothing is written, so pending migrations without a record
/// yet are reported without one.
pub struct ReadOnlyService {
    registry: MigrationRegistry,
    store: ReadOnlyStateStore,
    pub pending: PendingMigrations,
}

impl ReadOnlyService {
    pub fn new(config: &MigratorConfig) -> Result<Self> {
        let app_version = config.app_version()?;
        let registry = MigrationRegistry::new(&config.cluster_settings(), config.dev_mode)?;
        let store = ReadOnlyStateStore::open(Path::new(&config.state_store_path))
            .context("opening migration state store read-only")?;
        let pending = version_gate::evaluate(&app_version, &registry, |name| store.get(name))?;
        info!(
            required = pending.required.len(),
            optional = pending.optional.len(),
            %app_version,
            "computed pending migrations from a read-only view"
        );
        Ok(Self {
            registry,
            store,
            pending,
        })
    }

    pub fn status(&self, name: &str) -> Result<Option<MigrationRecord>> {
        self.store.get(name)
    }

    pub fn list(&self) -> Result<Vec<MigrationRecord>> {
        self.store.list()
    }

    pub fn describe(&self, name: &str) -> Result<MigrationDescription> {
        let definition = self.registry.lookup(name)?;
        Ok(MigrationDescription::from_definition(definition.as_ref()))
    }
}
