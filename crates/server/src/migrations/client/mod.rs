//! Clients for the external stores migrations run against.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::{
    error::Error,
    operation::{Database, Statement},
};

pub mod clickhouse;

pub type Row = Vec<Value>;
pub type Rows = Vec<Row>;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Executes `statement` on the cluster and returns the rows it produced.
    /// No timeout is applied; statements may legitimately run for hours.
    async fn execute(&self, statement: &Statement) -> Result<Rows>;

    /// Version string reported by the running service.
    async fn introspect_version(&self) -> Result<String>;
}

/// Cluster clients keyed by the database tag operations target.
#[derive(Clone, Default)]
pub struct ClusterClients {
    clients: HashMap<Database, Arc<dyn ClusterClient>>,
}

impl ClusterClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, database: Database, client: Arc<dyn ClusterClient>) -> Self {
        self.clients.insert(database, client);
        self
    }

    pub fn get(&self, database: Database) -> Result<Arc<dyn ClusterClient>> {
        self.clients.get(&database).cloned().ok_or_else(|| {
            Error::MissingClient {
                database: database.to_string(),
            }
            .into()
        })
    }

    pub async fn execute(&self, database: Database, statement: &Statement) -> Result<Rows> {
        if *statement == Statement::Noop {
            return Ok(Vec::new());
        }
        self.get(database)?.execute(statement).await
    }

    /// Convenience for single-value queries such as `SELECT count() ...`.
    pub async fn query_scalar(&self, database: Database, sql: &str) -> Result<Value> {
        let rows = self.execute(database, &Statement::sql(sql)).await?;
        rows.into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .ok_or_else(|| anyhow::anyhow!("query returned no rows: {}", sql.trim()))
    }
}

/// Reads a numeric cell. ClickHouse quotes 64-bit integers in JSON output, so
/// strings holding numbers are accepted too.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
