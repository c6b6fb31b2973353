//! Compiled-in migration definitions.
//!
//! New migrations are added to `all`. A shipped definition keeps its name and
//! operation list forever; records in the store refer to both.

use std::sync::Arc;

use anyhow::Result;

use super::definition::{ClusterSettings, MigrationDefinition};

pub mod events_sample_by;
pub mod example;

pub fn all(settings: &ClusterSettings) -> Result<Vec<Arc<dyn MigrationDefinition>>> {
    Ok(vec![
        Arc::new(example::ExampleMigration::new(settings)?),
        Arc::new(events_sample_by::EventsSampleBy::new(settings)?),
    ])
}
