use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{ClusterClient, Rows};
use crate::migrations::operation::Statement;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    /// HTTP interface endpoint, e.g. `http://localhost:8123`.
    pub url: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Cluster name used in `ON CLUSTER` clauses.
    #[serde(default = "default_cluster")]
    pub cluster: String,
}

fn default_database() -> String {
    "default".to_string()
}

fn default_user() -> String {
    "default".to_string()
}

fn default_cluster() -> String {
    "migrator".to_string()
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: default_database(),
            user: default_user(),
            password: String::new(),
            cluster: default_cluster(),
        }
    }
}

/// Talks to ClickHouse over its HTTP interface. Every statement is sent as
/// the request body; result sets come back as `JSONCompact`.
pub struct ClickHouseClient {
    http_client: reqwest::Client,
    endpoint: Url,
    config: ClickHouseConfig,
}

impl ClickHouseClient {
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        let mut endpoint = Url::parse(&config.url)
            .with_context(|| format!("invalid clickhouse url {}", config.url))?;
        endpoint
            .query_pairs_mut()
            .append_pair("database", &config.database)
            .append_pair("default_format", "JSONCompact");
        // No request timeout: copies between sharded tables can take hours.
        let http_client = reqwest::Client::builder()
            .build()
            .context("building clickhouse http client")?;
        Ok(Self {
            http_client,
            endpoint,
            config,
        })
    }

    async fn query(&self, sql: &str) -> Result<Rows> {
        debug!(sql = sql.trim(), "executing clickhouse statement");
        let response = self
            .http_client
            .post(self.endpoint.clone())
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(sql.to_string())
            .send()
            .await
            .context("sending statement to clickhouse")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("reading clickhouse response")?;
        if !status.is_success() {
            return Err(anyhow!(
                "clickhouse returned {}: {}",
                status,
                body.trim()
            ));
        }
        parse_json_compact(&body)
    }
}

#[async_trait]
impl ClusterClient for ClickHouseClient {
    async fn execute(&self, statement: &Statement) -> Result<Rows> {
        match statement {
            Statement::Sql(sql) => self.query(sql).await,
            Statement::Noop => Ok(Vec::new()),
        }
    }

    async fn introspect_version(&self) -> Result<String> {
        let rows = self.query("SELECT version()").await?;
        rows.first()
            .and_then(|row| row.first())
            .and_then(|value| value.as_str())
            .map(|version| version.to_string())
            .ok_or_else(|| anyhow!("clickhouse did not report a version"))
    }
}

/// Statements without a result set (DDL, INSERT) return an empty body.
fn parse_json_compact(body: &str) -> Result<Rows> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let json: Value = serde_json::from_str(body).context("decoding clickhouse JSONCompact")?;
    let data = json
        .get("data")
        .and_then(|data| data.as_array())
        .ok_or_else(|| anyhow!("clickhouse response has no data section"))?;
    data.iter()
        .map(|row| {
            row.as_array()
                .cloned()
                .ok_or_else(|| anyhow!("unexpected clickhouse row: {}", row))
        })
        .collect()
}
