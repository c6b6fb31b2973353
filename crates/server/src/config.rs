use std::{env, fmt::Debug, time::Duration};

use anyhow::{anyhow, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use semver::Version;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::migrations::{
    client::clickhouse::ClickHouseConfig,
    definition::{ClusterSettings, RollbackPolicy},
};

const LOCAL_ENV: &str = "local";

/// Environment variables with this prefix override file settings, nested
/// keys separated by `__` (e.g. `MIGRATOR_CLICKHOUSE__URL`).
const ENV_PREFIX: &str = "MIGRATOR_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    pub env: String,
    pub state_store_path: String,
    /// Registers example migrations.
    pub dev_mode: bool,
    /// Running application version. Defaults to the version of this binary.
    pub app_version: String,
    pub rollback_policy: RollbackPolicy,
    pub clickhouse: ClickHouseConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        MigratorConfig {
            env: LOCAL_ENV.to_string(),
            state_store_path: default_state_store_path(),
            dev_mode: false,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            rollback_policy: RollbackPolicy::default(),
            clickhouse: ClickHouseConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

fn default_state_store_path() -> String {
    env::current_dir()
        .map(|dir| dir.join("migrator_storage/state"))
        .unwrap_or_else(|_| "migrator_storage/state".into())
        .to_string_lossy()
        .to_string()
}

impl MigratorConfig {
    pub fn from_path(path: &str) -> Result<MigratorConfig> {
        let config_str =
            std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        Self::from_yaml_str(&config_str)
    }

    /// Defaults overridden by environment variables only.
    pub fn from_env() -> Result<MigratorConfig> {
        Self::extract(Figment::from(Serialized::defaults(MigratorConfig::default())))
    }

    fn from_yaml_str(config_str: &str) -> Result<MigratorConfig> {
        Self::extract(
            Figment::from(Serialized::defaults(MigratorConfig::default()))
                .merge(Yaml::string(config_str)),
        )
    }

    fn extract(figment: Figment) -> Result<MigratorConfig> {
        let mut config: MigratorConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("parsing migrator config")?;
        config.validate()?;
        // Locks are tagged with the instance id, so it must not change for
        // the lifetime of the process.
        let instance_id = config.instance_id();
        config.telemetry.instance_id.get_or_insert(instance_id);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_store_path.trim().is_empty() {
            return Err(anyhow!("state_store_path must not be empty"));
        }
        self.app_version()?;
        Url::parse(&self.clickhouse.url)
            .map_err(|e| anyhow!("invalid clickhouse url {}: {}", self.clickhouse.url, e))?;
        if self.clickhouse.cluster.trim().is_empty() {
            return Err(anyhow!("clickhouse cluster must not be empty"));
        }
        if self.telemetry.metrics_interval.is_zero() {
            return Err(anyhow!("telemetry.metrics_interval must be positive"));
        }
        Ok(())
    }

    pub fn app_version(&self) -> Result<Version> {
        Version::parse(&self.app_version)
            .map_err(|e| anyhow!("invalid app_version {}: {}", self.app_version, e))
    }

    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            database: self.clickhouse.database.clone(),
            cluster: self.clickhouse.cluster.clone(),
        }
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint. Defaults to the
    // OTEL_EXPORTER_OTLP_ENDPOINT env var or to localhost:4317.
    pub endpoint: Option<String>,
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
    // Optional path to write local logs to a daily rotating file.
    pub local_log_file: Option<String>,
    // Used as the metric attribute "migrator.instance.id" and to tag locks.
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(10),
            local_log_file: None,
            instance_id: None,
        }
    }
}

// Durations are configured in whole seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_sample_config() {
        let config_yaml = include_str!("../sample_config.yaml");
        let config =
            MigratorConfig::from_yaml_str(config_yaml).expect("unable to parse from yaml");

        assert_eq!("local", config.env);
        assert_eq!(config.app_version().unwrap(), Version::new(1, 31, 0));
        assert_eq!(config.rollback_policy, RollbackPolicy::Manual);
        assert_eq!(config.clickhouse.url, "http://localhost:8123");
        assert_eq!(config.clickhouse.cluster, "posthog");
        assert_eq!(config.telemetry.metrics_interval, Duration::from_secs(30));
        assert!(!config.structured_logging());
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config = MigratorConfig::from_yaml_str("env: production\nrollback_policy: automatic\n")
            .expect("unable to parse from yaml");
        assert!(config.structured_logging());
        assert_eq!(config.rollback_policy, RollbackPolicy::Automatic);
        assert_eq!(config.app_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(config.clickhouse.database, "default");
        assert!(config.instance_id().starts_with("production-"));
        assert_eq!(config.instance_id(), config.instance_id());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(MigratorConfig::from_yaml_str("app_version: not-a-version\n").is_err());
        assert!(MigratorConfig::from_yaml_str("clickhouse:\n  url: \"::\"\n").is_err());
        assert!(MigratorConfig::from_yaml_str("rollback_policy: sometimes\n").is_err());
    }
}
