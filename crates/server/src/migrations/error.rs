use crate::data_model::MigrationStatus;

/// Failures the engine classifies. Propagated inside `anyhow::Error`; callers
/// use `downcast_ref::<Error>()` to tell them apart.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("duplicate migration name: {name}")]
    DuplicateMigration { name: String },

    #[error(
        "migration {migration} is required for application versions up to {max_version}, \
         but version {app_version} is running and the migration is not complete"
    )]
    VersionWindowExceeded {
        migration: String,
        max_version: String,
        app_version: String,
    },

    #[error(
        "migration {migration} does not apply to application version {app_version} \
         (supported {range})"
    )]
    NotApplicable {
        migration: String,
        range: String,
        app_version: String,
    },

    #[error("unknown migration: {name}")]
    UnknownMigration { name: String },

    #[error(
        "migration {migration} requires {service} {required}, but the running version is \
         {actual}"
    )]
    IncompatibleServiceVersion {
        migration: String,
        service: String,
        required: String,
        actual: String,
    },

    #[error("healthcheck for migration {migration} failed: {detail}")]
    HealthcheckFailed { migration: String, detail: String },

    #[error("migration {migration} failed at operation {index}: {message}")]
    OperationFailed {
        migration: String,
        index: usize,
        message: String,
    },

    #[error(
        "rollback of migration {migration} failed at operation {index}: {message}; manual \
         intervention is required"
    )]
    RollbackFailed {
        migration: String,
        index: usize,
        message: String,
    },

    #[error("migration {migration} cannot be rolled back past operation {index}: it is not reversible")]
    NotReversible { migration: String, index: usize },

    #[error(
        "operations of migration {migration} changed since it was started (fingerprint \
         {recorded} != {current})"
    )]
    OperationsChanged {
        migration: String,
        recorded: String,
        current: String,
    },

    #[error("migration {migration} cannot {action} while {status}")]
    InvalidTransition {
        migration: String,
        action: &'static str,
        status: MigrationStatus,
    },

    #[error("no cluster client configured for {database}")]
    MissingClient { database: String },
}

impl Error {
    /// Configuration errors abort process startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DuplicateMigration { .. } | Error::VersionWindowExceeded { .. }
        )
    }

    /// Precondition failures leave the migration untouched and are safe to
    /// retry later.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::HealthcheckFailed { .. }
                | Error::IncompatibleServiceVersion { .. }
                | Error::NotApplicable { .. }
        )
    }
}
