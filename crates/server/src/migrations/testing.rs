//! Test doubles for exercising migrations without a live cluster.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use super::{
    client::{ClusterClient, ClusterClients, Rows},
    definition::{HealthcheckResult, MigrationContext, MigrationDefinition, RollbackPolicy},
    operation::{Database, Operation, Statement},
    version::{AppVersionRange, ServiceVersionRequirement},
};
use crate::data_model::MigrationRecord;

#[derive(Default)]
struct ClusterState {
    tables: BTreeMap<String, u64>,
    executed: Vec<String>,
    failures: Vec<(String, usize)>,
    responses: Vec<(String, Rows)>,
}

/// A cluster that keeps tables as row counts and understands a handful of
/// statements:
///
/// - `CREATE TABLE [IF NOT EXISTS] t`
/// - `DROP TABLE [IF EXISTS] t`
/// - `INSERT INTO t VALUES n`
/// - `TRUNCATE TABLE [IF EXISTS] t`
/// - `RENAME TABLE a TO b[, c TO d ...]`
/// - `EXISTS TABLE t`
/// - `SELECT count() FROM t`
///
/// `ON CLUSTER` clauses are ignored. Canned responses and injected failures
/// are matched by substring before the statement is interpreted.
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    version: Mutex<String>,
    latency: Option<Duration>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            version: Mutex::new("21.6.5.37".to_string()),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_table(self, name: &str, rows: u64) -> Self {
        self.state.lock().unwrap().tables.insert(name.to_string(), rows);
        self
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock().unwrap() = version.to_string();
    }

    /// Fails the next `times` statements containing `pattern`.
    pub fn fail_on(&self, pattern: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((pattern.to_string(), times));
    }

    /// Answers statements containing `pattern` with `rows` instead of
    /// interpreting them.
    pub fn respond_to(&self, pattern: &str, rows: Rows) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((pattern.to_string(), rows));
    }

    pub fn tables(&self) -> BTreeMap<String, u64> {
        self.state.lock().unwrap().tables.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn clients(self: &Arc<Self>) -> ClusterClients {
        ClusterClients::new().with_client(Database::ClickHouse, self.clone())
    }

    fn apply(&self, sql: &str) -> Result<Rows> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(sql.to_string());

        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|(pattern, remaining)| *remaining > 0 && sql.contains(pattern.as_str()))
        {
            failure.1 -= 1;
            return Err(anyhow!("injected failure for statement: {}", sql));
        }
        if let Some((_, rows)) = state
            .responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
        {
            return Ok(rows.clone());
        }

        let mut tokens: Vec<&str> = sql
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();
        if let Some(at) = tokens
            .windows(2)
            .position(|w| w[0].eq_ignore_ascii_case("ON") && w[1].eq_ignore_ascii_case("CLUSTER"))
        {
            tokens.drain(at..(at + 3).min(tokens.len()));
        }
        let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
        let keywords: Vec<&str> = upper.iter().map(String::as_str).collect();
        let tables = &mut state.tables;

        match keywords.as_slice() {
            ["CREATE", "TABLE", "IF", "NOT", "EXISTS", ..] => {
                tables.entry(tokens[5].to_string()).or_insert(0);
            }
            ["CREATE", "TABLE", ..] => {
                let name = tokens[2];
                if tables.contains_key(name) {
                    return Err(anyhow!("table {} already exists", name));
                }
                tables.insert(name.to_string(), 0);
            }
            ["DROP", "TABLE", "IF", "EXISTS", ..] => {
                tables.remove(tokens[4]);
            }
            ["DROP", "TABLE", ..] => {
                tables
                    .remove(tokens[2])
                    .ok_or_else(|| anyhow!("table {} does not exist", tokens[2]))?;
            }
            ["INSERT", "INTO", _, "VALUES", _] => {
                let rows: u64 = tokens[4].parse()?;
                *tables
                    .get_mut(tokens[2])
                    .ok_or_else(|| anyhow!("table {} does not exist", tokens[2]))? += rows;
            }
            ["TRUNCATE", "TABLE", "IF", "EXISTS", _] => {
                if let Some(rows) = tables.get_mut(tokens[4]) {
                    *rows = 0;
                }
            }
            ["TRUNCATE", "TABLE", _] => {
                *tables
                    .get_mut(tokens[2])
                    .ok_or_else(|| anyhow!("table {} does not exist", tokens[2]))? = 0;
            }
            ["RENAME", "TABLE", ..] => {
                for pair in tokens[2..].chunks(3) {
                    let [from, to_keyword, to] = pair else {
                        return Err(anyhow!("malformed rename: {}", sql));
                    };
                    if !to_keyword.eq_ignore_ascii_case("TO") {
                        return Err(anyhow!("malformed rename: {}", sql));
                    }
                    if tables.contains_key(*to) {
                        return Err(anyhow!("table {} already exists", to));
                    }
                    let rows = tables
                        .remove(*from)
                        .ok_or_else(|| anyhow!("table {} does not exist", from))?;
                    tables.insert(to.to_string(), rows);
                }
            }
            ["EXISTS", "TABLE", _] => {
                let exists = u8::from(tables.contains_key(tokens[2]));
                return Ok(vec![vec![json!(exists)]]);
            }
            ["SELECT", "COUNT()", "FROM", _] => {
                let rows = tables
                    .get(tokens[3])
                    .ok_or_else(|| anyhow!("table {} does not exist", tokens[3]))?;
                // Mirrors ClickHouse, which quotes UInt64 in JSON output.
                return Ok(vec![vec![json!(rows.to_string())]]);
            }
            _ => return Err(anyhow!("unsupported statement: {}", sql)),
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn execute(&self, statement: &Statement) -> Result<Rows> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match statement {
            Statement::Sql(sql) => self.apply(sql.trim()),
            Statement::Noop => Ok(Vec::new()),
        }
    }

    async fn introspect_version(&self) -> Result<String> {
        Ok(self.version.lock().unwrap().clone())
    }
}

/// When a `TestMigration` reports itself as required.
pub enum Requirement {
    Always,
    Never,
    /// Required until the named table exists on the cluster.
    UntilTableExists(String),
}

/// Configurable migration definition for engine tests.
pub struct TestMigration {
    name: &'static str,
    range: AppVersionRange,
    requirements: Vec<ServiceVersionRequirement>,
    operations: Vec<Operation>,
    requirement: Requirement,
    healthcheck: Mutex<HealthcheckResult>,
    on_healthcheck: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    progress_fails: AtomicBool,
    rollback_policy: Option<RollbackPolicy>,
    example: bool,
}

impl TestMigration {
    pub fn new(name: &'static str, operations: Vec<Operation>) -> Self {
        Self {
            name,
            range: AppVersionRange::parse("1.30.0", "1.31.0").unwrap(),
            requirements: Vec::new(),
            operations,
            requirement: Requirement::Always,
            healthcheck: Mutex::new(HealthcheckResult::healthy()),
            on_healthcheck: Mutex::new(None),
            progress_fails: AtomicBool::new(false),
            rollback_policy: None,
            example: false,
        }
    }

    pub fn with_range(mut self, min: &str, max: &str) -> Self {
        self.range = AppVersionRange::parse(min, max).unwrap();
        self
    }

    pub fn with_service_requirement(mut self, service: &str, range: &str) -> Self {
        self.requirements
            .push(ServiceVersionRequirement::new(service, range).unwrap());
        self
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn with_rollback_policy(mut self, policy: RollbackPolicy) -> Self {
        self.rollback_policy = Some(policy);
        self
    }

    pub fn as_example(mut self) -> Self {
        self.example = true;
        self
    }

    pub fn set_healthcheck(&self, result: HealthcheckResult) {
        *self.healthcheck.lock().unwrap() = result;
    }

    /// Runs `hook` once, the next time the healthcheck is evaluated.
    pub fn on_healthcheck(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_healthcheck.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_progress_fails(&self, fails: bool) {
        self.progress_fails.store(fails, Ordering::SeqCst);
    }
}

#[async_trait]
impl MigrationDefinition for TestMigration {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "test migration"
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

    fn is_example(&self) -> bool {
        self.example
    }

    fn rollback_policy(&self) -> Option<RollbackPolicy> {
        self.rollback_policy
    }

    async fn is_required(&self, ctx: &MigrationContext) -> Result<bool> {
        match &self.requirement {
            Requirement::Always => Ok(true),
            Requirement::Never => Ok(false),
            Requirement::UntilTableExists(table) => {
                let exists = ctx
                    .clients
                    .query_scalar(Database::ClickHouse, &format!("EXISTS TABLE {table}"))
                    .await?;
                Ok(exists != json!(1))
            }
        }
    }

    async fn healthcheck(&self, _ctx: &MigrationContext) -> Result<HealthcheckResult> {
        let hook = self.on_healthcheck.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(self.healthcheck.lock().unwrap().clone())
    }

    async fn progress(&self, _ctx: &MigrationContext, record: &MigrationRecord) -> Result<f64> {
        if self.progress_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("progress query failed"));
        }
        Ok(super::definition::operation_progress(
            record,
            self.operations.len(),
        ))
    }
}

/// `[CREATE a, CREATE b, CREATE c]`, each reversible with a `DROP ... IF
/// EXISTS`.
pub fn create_tables_operations(tables: &[&str]) -> Vec<Operation> {
    tables
        .iter()
        .map(|table| {
            Operation::sql(
                Database::ClickHouse,
                format!("CREATE TABLE {table}"),
                format!("DROP TABLE IF EXISTS {table}"),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_cluster_statements() -> Result<()> {
        let cluster = InMemoryCluster::new().with_table("events", 10);
        cluster.execute(&Statement::sql("CREATE TABLE tmp")).await?;
        cluster.execute(&Statement::sql("INSERT INTO tmp VALUES 4")).await?;
        cluster
            .execute(&Statement::sql("RENAME TABLE events TO events_backup, tmp TO events"))
            .await?;
        assert_eq!(
            cluster.tables(),
            BTreeMap::from([("events".to_string(), 4), ("events_backup".to_string(), 10)])
        );
        let count = cluster
            .execute(&Statement::sql("SELECT count() FROM events_backup"))
            .await?;
        assert_eq!(count, vec![vec![json!("10")]]);
        assert!(cluster.execute(&Statement::sql("CREATE TABLE events")).await.is_err());
        assert!(cluster.execute(&Statement::sql("ALTER TABLE events")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() -> Result<()> {
        let cluster = InMemoryCluster::new();
        cluster.fail_on("CREATE TABLE a", 1);
        assert!(cluster.execute(&Statement::sql("CREATE TABLE a")).await.is_err());
        cluster.execute(&Statement::sql("CREATE TABLE a")).await?;
        assert_eq!(cluster.executed().len(), 2);
        Ok(())
    }
}
