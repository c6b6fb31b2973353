//! Rebuilds the events table so it is sampled by a column compatible with
//! its sorting key.
//!
//! History is copied into a temporary table while ingestion continues. The
//! materialized view feeding the table is then detached, the tail is copied
//! and the tables are swapped before the view is attached again. Materialized
//! columns are disabled while the view is detached.

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::{
    data_model::MigrationRecord,
    migrations::{
        client::value_as_f64,
        definition::{ClusterSettings, HealthcheckResult, MigrationContext, MigrationDefinition},
        operation::{Database, Operation, SideEffect, Statement},
        version::{AppVersionRange, ServiceVersionRequirement},
    },
};

pub const NAME: &str = "0001_events_sample_by";

pub const MATERIALIZED_COLUMNS_ENABLED: &str = "MATERIALIZED_COLUMNS_ENABLED";

const EVENTS_TABLE: &str = "events";
const SHARDED_EVENTS_TABLE: &str = "sharded_events";
const EVENTS_MV: &str = "events_mv";
const TEMPORARY_TABLE: &str = "temp_events";
const BACKUP_TABLE: &str = "events_old";

/// Free disk space required, as a multiple of the events table size.
const REQUIRED_FREE_SPACE_RATIO: f64 = 1.5;

/// Rows older than this are copied before ingestion is paused.
const HISTORY_CUTOFF: &str = "toStartOfMonth(now()) - INTERVAL 1 MONTH";

pub struct EventsSampleBy {
    settings: ClusterSettings,
    range: AppVersionRange,
    requirements: Vec<ServiceVersionRequirement>,
    operations: Vec<Operation>,
}

impl EventsSampleBy {
    pub fn new(settings: &ClusterSettings) -> Result<Self> {
        Ok(Self {
            settings: settings.clone(),
            range: AppVersionRange::parse("1.30.0", "1.31.0")?,
            requirements: vec![ServiceVersionRequirement::new(
                "clickhouse",
                ">=21.6.0, <21.7.0",
            )?],
            operations: operations(settings),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.settings.database, name)
    }
}

fn operations(settings: &ClusterSettings) -> Vec<Operation> {
    let db = &settings.database;
    let on_cluster = format!("ON CLUSTER '{}'", settings.cluster);
    let events = format!("{db}.{EVENTS_TABLE}");
    let temp = format!("{db}.{TEMPORARY_TABLE}");
    let backup = format!("{db}.{BACKUP_TABLE}");
    let mv = format!("{db}.{EVENTS_MV}");

    // Re-entering a copy resumes at the newest timestamp already copied.
    // Rows sharing that timestamp are matched by uuid so none is lost or
    // copied twice.
    let copy = |range_filter: &str| {
        let copied_up_to = format!("(SELECT max(timestamp) FROM {temp})");
        format!(
            "INSERT INTO {temp} SELECT * FROM {events} WHERE {range_filter} \
             AND timestamp >= {copied_up_to} \
             AND (timestamp, uuid) NOT IN \
             (SELECT timestamp, uuid FROM {temp} WHERE timestamp = {copied_up_to})"
        )
    };

    vec![
        Operation::sql(
            Database::ClickHouse,
            format!("CREATE TABLE IF NOT EXISTS {temp} {on_cluster} AS {events}"),
            format!("DROP TABLE IF EXISTS {temp} {on_cluster}"),
        ),
        Operation::sql(
            Database::ClickHouse,
            copy(&format!("timestamp < {HISTORY_CUTOFF}")),
            format!("TRUNCATE TABLE IF EXISTS {temp} {on_cluster}"),
        ),
        Operation::sql(
            Database::ClickHouse,
            format!("DETACH TABLE {mv} {on_cluster}"),
            format!("ATTACH TABLE {mv} {on_cluster}"),
        )
        .with_side_effects(
            SideEffect::set_flag(MATERIALIZED_COLUMNS_ENABLED, false),
            SideEffect::set_flag(MATERIALIZED_COLUMNS_ENABLED, true),
        ),
        Operation::sql(
            Database::ClickHouse,
            copy(&format!("timestamp >= {HISTORY_CUTOFF}")),
            format!("TRUNCATE TABLE IF EXISTS {temp} {on_cluster}"),
        ),
        Operation::sql(
            Database::ClickHouse,
            format!("RENAME TABLE {events} TO {backup}, {temp} TO {events} {on_cluster}"),
            format!("RENAME TABLE {events} TO {temp}, {backup} TO {events} {on_cluster}"),
        ),
        Operation::sql(
            Database::ClickHouse,
            format!("ATTACH TABLE {mv} {on_cluster}"),
            format!("DETACH TABLE {mv} {on_cluster}"),
        )
        .with_side_effects(
            SideEffect::set_flag(MATERIALIZED_COLUMNS_ENABLED, true),
            SideEffect::set_flag(MATERIALIZED_COLUMNS_ENABLED, false),
        ),
    ]
}

#[async_trait]
impl MigrationDefinition for EventsSampleBy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Events table migration for compatible sample by column."
    }

    fn app_version_range(&self) -> &AppVersionRange {
        &self.range
    }

    fn service_version_requirements(&self) -> &[ServiceVersionRequirement] {
        &self.requirements
    }

    fn operations(&self) -> &[Operation] {
        &self.operations
    }

    async fn is_required(&self, ctx: &MigrationContext) -> Result<bool> {
        let create = ctx
            .clients
            .query_scalar(
                Database::ClickHouse,
                &format!("SHOW CREATE TABLE {}", self.table(EVENTS_TABLE)),
            )
            .await?;
        let create = create
            .as_str()
            .ok_or_else(|| anyhow!("unexpected SHOW CREATE TABLE result: {}", create))?;
        Ok(create.contains("SAMPLE BY uuid"))
    }

    async fn healthcheck(&self, ctx: &MigrationContext) -> Result<HealthcheckResult> {
        let sql = format!(
            "SELECT disks.free_space, parts.size, formatReadableSize(parts.size * {ratio}) \
             FROM (SELECT sum(bytes_on_disk) AS size FROM system.parts \
                   WHERE database = '{db}' AND table = '{SHARDED_EVENTS_TABLE}' AND active) AS parts \
             CROSS JOIN (SELECT free_space FROM system.disks WHERE name = 'default') AS disks",
            ratio = REQUIRED_FREE_SPACE_RATIO,
            db = self.settings.database,
        );
        let rows = ctx
            .clients
            .execute(Database::ClickHouse, &Statement::sql(sql))
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| anyhow!("disk usage query returned no rows"))?;
        let (free_space, table_size) = match (
            row.first().and_then(value_as_f64),
            row.get(1).and_then(value_as_f64),
        ) {
            (Some(free_space), Some(table_size)) => (free_space, table_size),
            _ => return Err(anyhow!("unexpected disk usage row: {:?}", row)),
        };

        if free_space >= table_size * REQUIRED_FREE_SPACE_RATIO {
            return Ok(HealthcheckResult::healthy());
        }
        let required = row
            .get(2)
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} bytes", table_size * REQUIRED_FREE_SPACE_RATIO));
        Ok(HealthcheckResult::unhealthy(format!(
            "Upgrade your ClickHouse storage: at least {required} of free disk space is needed to \
             copy the events table"
        )))
    }

    async fn progress(&self, ctx: &MigrationContext, _record: &MigrationRecord) -> Result<f64> {
        let count = |table: String| async move {
            let value = ctx
                .clients
                .query_scalar(Database::ClickHouse, &format!("SELECT count() FROM {table}"))
                .await?;
            value_as_f64(&value).ok_or_else(|| anyhow!("unexpected row count: {}", value))
        };
        let moved = count(self.table(TEMPORARY_TABLE)).await?;
        let total = count(self.table(EVENTS_TABLE)).await?;
        if total == 0.0 {
            return Ok(100.0);
        }
        Ok(100.0 * moved / total)
    }
}
