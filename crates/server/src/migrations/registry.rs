use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tracing::{debug, info};

use super::{
    definition::{ClusterSettings, MigrationDefinition},
    definitions,
    error::Error,
};

/// Every known migration definition, indexed by name. Built once at startup
/// from the compiled-in list and never mutated afterwards.
pub struct MigrationRegistry {
    migrations: BTreeMap<String, Arc<dyn MigrationDefinition>>,
}

impl MigrationRegistry {
    /// Registry of the compiled-in definitions. Example migrations are only
    /// registered in development mode.
    pub fn new(settings: &ClusterSettings, dev_mode: bool) -> Result<Self> {
        let registry = Self::from_definitions(
            definitions::all(settings)?
                .into_iter()
                .filter(|definition| {
                    let keep = dev_mode || !definition.is_example();
                    if !keep {
                        debug!(migration = definition.name(), "skipping example migration");
                    }
                    keep
                }),
        )?;
        info!(
            migrations = ?registry.names(),
            dev_mode,
            "loaded migration registry"
        );
        Ok(registry)
    }

    /// Fails on the first name registered twice.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = Arc<dyn MigrationDefinition>>,
    ) -> Result<Self> {
        let mut migrations = BTreeMap::new();
        for definition in definitions {
            let name = definition.name().to_string();
            if migrations.insert(name.clone(), definition).is_some() {
                return Err(Error::DuplicateMigration { name }.into());
            }
        }
        Ok(Self { migrations })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MigrationDefinition>> {
        self.migrations.get(name).cloned()
    }

    /// Like `get`, but an unknown name is an error.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn MigrationDefinition>> {
        self.get(name).ok_or_else(|| {
            Error::UnknownMigration {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Names in lexicographic order.
    pub fn names(&self) -> Vec<&str> {
        self.migrations.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn MigrationDefinition>> {
        self.migrations.values()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::testing::{create_tables_operations, TestMigration};

    fn test_migration(name: &'static str) -> Arc<dyn MigrationDefinition> {
        Arc::new(TestMigration::new(name, create_tables_operations(&["a"])))
    }

    #[test]
    fn test_registry_orders_by_name() -> Result<()> {
        let registry = MigrationRegistry::from_definitions(vec![
            test_migration("0003_c"),
            test_migration("0001_a"),
            test_migration("0002_b"),
        ])?;

        assert_eq!(registry.names(), vec!["0001_a", "0002_b", "0003_c"]);
        assert!(registry.get("0002_b").is_some());
        assert!(registry.get("0004_d").is_none());
        Ok(())
    }

    #[test]
    fn test_registry_detects_duplicates() {
        let result = MigrationRegistry::from_definitions(vec![
            test_migration("0001_a"),
            test_migration("0001_a"),
        ]);

        let err = result.err().unwrap();
        assert_eq!(err.to_string(), "duplicate migration name: 0001_a");
        let err = err.downcast_ref::<Error>().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_migration_lookup() -> Result<()> {
        let registry = MigrationRegistry::from_definitions(vec![test_migration("0001_a")])?;
        let err = registry.lookup("missing").err().unwrap();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownMigration { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_examples_only_in_dev_mode() -> Result<()> {
        let settings = ClusterSettings::default();

        let production = MigrationRegistry::new(&settings, false)?;
        assert!(production.iter().all(|m| !m.is_example()));
        assert!(production.get(definitions::events_sample_by::NAME).is_some());

        let dev = MigrationRegistry::new(&settings, true)?;
        assert_eq!(dev.len(), production.len() + 1);
        assert!(dev.get(definitions::example::NAME).is_some());
        Ok(())
    }
}
