use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

/// Operations can run for hours, so these extend well past the low latency
/// buckets.
pub fn long_running_boundaries() -> Vec<f64> {
    vec![
        0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0,
        86400.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "cluster-migrator"))
        .with_attribute(KeyValue::new("service.name", "cluster-migrator"))
        .with_attribute(KeyValue::new(
            "migrator.instance.id",
            instance_id.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    #[must_use]
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub mod migration_engine {
    use opentelemetry::metrics::{Counter, Histogram};

    use super::long_running_boundaries;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub operations_executed: Counter<u64>,
        pub operations_failed: Counter<u64>,
        pub operation_duration: Histogram<f64>,
        pub rollbacks_executed: Counter<u64>,
        pub rollbacks_failed: Counter<u64>,
        pub precondition_failures: Counter<u64>,
        pub lock_contention: Counter<u64>,
        pub migrations_completed: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("migration-engine");

            let operations_executed = meter
                .u64_counter("migrator.operations_executed")
                .with_description("number of forward operations executed successfully")
                .build();
            let operations_failed = meter
                .u64_counter("migrator.operations_failed")
                .with_description("number of forward operations that failed")
                .build();
            let operation_duration = meter
                .f64_histogram("migrator.operation_duration")
                .with_unit("s")
                .with_boundaries(long_running_boundaries())
                .with_description("forward and rollback operation latencies in seconds")
                .build();
            let rollbacks_executed = meter
                .u64_counter("migrator.rollbacks_executed")
                .with_description("number of rollback steps executed successfully")
                .build();
            let rollbacks_failed = meter
                .u64_counter("migrator.rollbacks_failed")
                .with_description("number of rollback steps that failed")
                .build();
            let precondition_failures = meter
                .u64_counter("migrator.precondition_failures")
                .with_description("healthcheck and service version check failures")
                .build();
            let lock_contention = meter
                .u64_counter("migrator.lock_contention")
                .with_description("run or rollback attempts that found the migration locked")
                .build();
            let migrations_completed = meter
                .u64_counter("migrator.migrations_completed")
                .with_description("number of migrations that completed successfully")
                .build();

            Metrics {
                operations_executed,
                operations_failed,
                operation_duration,
                rollbacks_executed,
                rollbacks_failed,
                precondition_failures,
                lock_contention,
                migrations_completed,
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct StateStoreMetrics {
    pub state_write: Histogram<f64>,
    pub state_read: Histogram<f64>,
    pub lock_acquisitions: Counter<u64>,
    pub stale_locks_released: Counter<u64>,
}

impl Default for StateStoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStoreMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("state_store");

        let state_write = meter
            .f64_histogram("migrator.state_store_write_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("Migration record store write latency in seconds")
            .build();

        let state_read = meter
            .f64_histogram("migrator.state_store_read_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("Migration record store read latency in seconds")
            .build();

        let lock_acquisitions = meter
            .u64_counter("migrator.lock_acquisitions")
            .with_description("Number of single-flight locks acquired")
            .build();

        let stale_locks_released = meter
            .u64_counter("migrator.stale_locks_released")
            .with_description("Number of locks left behind by previous instances")
            .build();

        Self {
            state_write,
            state_read,
            lock_acquisitions,
            stale_locks_released,
        }
    }
}
