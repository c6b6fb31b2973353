use anyhow::Result;
use itertools::Itertools;
use semver::Version;
use serde::Serialize;
use tracing::{debug, info};

use super::{error::Error, registry::MigrationRegistry, version::VersionWindow};
use crate::{data_model::MigrationRecord, state_store::MigrationStateStore};

/// Migrations due at the running application version, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingMigrations {
    /// Windows ending at the running version. These must complete before
    /// the application is upgraded past it.
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl PendingMigrations {
    pub fn all(&self) -> Vec<&str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(String::as_str)
            .sorted()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

/// Decides which migrations are due at `app_version`.
///
/// Incomplete migrations whose window ended before `app_version` are a fatal
/// configuration error; the first one in name order is reported. Pending
/// migrations get a `NotStarted` record if they have none yet.
pub fn compute_pending(
    app_version: &Version,
    registry: &MigrationRegistry,
    store: &MigrationStateStore,
) -> Result<PendingMigrations> {
    let pending = evaluate(app_version, registry, |name| store.get(name))?;
    for name in pending.all() {
        if store.create_if_absent(name)? {
            info!(migration = name, "migration became applicable");
        }
    }
    Ok(pending)
}

/// Same decision as `compute_pending`, reading records through `get` and
/// writing nothing.
pub fn evaluate(
    app_version: &Version,
    registry: &MigrationRegistry,
    get: impl Fn(&str) -> Result<Option<MigrationRecord>>,
) -> Result<PendingMigrations> {
    let mut pending = PendingMigrations::default();

    for definition in registry.iter() {
        let name = definition.name();
        if get(name)?.is_some_and(|record| record.is_completed()) {
            continue;
        }

        let range = definition.app_version_range();
        match range.window(app_version) {
            VersionWindow::Exceeded => {
                return Err(Error::VersionWindowExceeded {
                    migration: name.to_string(),
                    max_version: range.max.to_string(),
                    app_version: app_version.to_string(),
                }
                .into());
            }
            VersionWindow::NotYetApplicable => {
                debug!(migration = name, range = %range, "migration not yet applicable");
                continue;
            }
            VersionWindow::Within => {}
        }

        if *app_version == range.max {
            pending.required.push(name.to_string());
        } else {
            pending.optional.push(name.to_string());
        }
    }

    Ok(pending)
}
