//! Template for new migrations. Only registered in development mode.

use anyhow::Result;
use async_trait::async_trait;

use crate::migrations::{
    definition::{ClusterSettings, MigrationContext, MigrationDefinition},
    operation::{Database, Operation},
    version::AppVersionRange,
};

pub const NAME: &str = "0000_example";

pub struct ExampleMigration {
    range: AppVersionRange,
    operations: Vec<Operation>,
    table: String,
}

impl ExampleMigration {
    pub fn new(settings: &ClusterSettings) -> Result<Self> {
        let table = format!("{}.example_migration", settings.database);
        let operations = vec![Operation::sql(
            Database::ClickHouse,
            format!(
                "CREATE TABLE IF NOT EXISTS {table} ON CLUSTER '{cluster}' (id UInt64) ENGINE = Memory",
                cluster = settings.cluster
            ),
            format!(
                "DROP TABLE IF EXISTS {table} ON CLUSTER '{cluster}'",
                cluster = settings.cluster
            ),
        )];
        Ok(Self {
            range: AppVersionRange::parse("0.0.0", "2.0.0")?,
            operations,
            table,
        })
    }
}

#[async_trait]
impl MigrationDefinition for ExampleMigration {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "An example migration that creates and drops a scratch table."
    }

    fn app_version_range(&self) -> &AppVersionRange {
        &self.range
    }

    fn operations(&self) -> &[Operation] {
        &self.operations
    }

    fn is_example(&self) -> bool {
        true
    }

    async fn is_required(&self, ctx: &MigrationContext) -> Result<bool> {
        let exists = ctx
            .clients
            .query_scalar(Database::ClickHouse, &format!("EXISTS TABLE {}", self.table))
            .await?;
        Ok(crate::migrations::client::value_as_f64(&exists) != Some(1.0))
    }
}
