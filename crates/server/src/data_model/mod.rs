use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::utils::get_epoch_time_in_ms;

/// Lifecycle of a migration record.
///
/// `NotStarted -> Starting -> Running -> {CompletedSuccessfully | Errored}`,
/// `Errored -> RolledBack -> NotStarted`. `Starting` is persisted while the
/// engine holds the lock and verifies preconditions, so it is also the
/// re-entry point when an interrupted or errored migration is resumed.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumIter,
    EnumString,
)]
pub enum MigrationStatus {
    #[default]
    NotStarted,
    Starting,
    Running,
    CompletedSuccessfully,
    Errored,
    RolledBack,
}

impl MigrationStatus {
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (NotStarted, Starting) |
                (Starting, Starting) |
                (Starting, Running) |
                (Starting, CompletedSuccessfully) |
                (Running, Starting) |
                (Running, CompletedSuccessfully) |
                (Running, Errored) |
                (Errored, Starting) |
                (Errored, RolledBack) |
                (RolledBack, NotStarted)
        )
    }

    /// A migration in one of these states has external effects that may be
    /// partially applied.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Starting | MigrationStatus::Running | MigrationStatus::Errored
        )
    }
}

/// Durable state of one migration, keyed by migration name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct MigrationRecord {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default)]
    pub status: MigrationStatus,
    /// The operation about to run, or the one that last failed.
    #[builder(default)]
    pub current_operation_index: usize,
    #[builder(default)]
    pub progress: f64,
    #[builder(setter(into, strip_option), default)]
    pub last_error: Option<String>,
    #[builder(setter(strip_option), default)]
    pub started_at: Option<u64>,
    #[builder(setter(strip_option), default)]
    pub finished_at: Option<u64>,
    /// Application version the current run was started with.
    #[builder(setter(into, strip_option), default)]
    #[serde(default)]
    pub app_version: Option<String>,
    /// Fingerprint of the operation list the current run was started with.
    #[builder(setter(into, strip_option), default)]
    #[serde(default)]
    pub operations_fingerprint: Option<String>,
    /// Engine instance that last drove this migration.
    #[builder(setter(into, strip_option), default)]
    #[serde(default)]
    pub executor_id: Option<String>,
    #[builder(default = "self.default_timestamp()")]
    pub created_at: u64,
    #[builder(default = "self.default_timestamp()")]
    pub updated_at: u64,
}

impl MigrationRecordBuilder {
    fn default_timestamp(&self) -> u64 {
        get_epoch_time_in_ms()
    }
}

impl MigrationRecord {
    pub fn new(name: &str) -> Self {
        let now = get_epoch_time_in_ms();
        Self {
            name: name.to_string(),
            status: MigrationStatus::NotStarted,
            current_operation_index: 0,
            progress: 0.0,
            last_error: None,
            started_at: None,
            finished_at: None,
            app_version: None,
            operations_fingerprint: None,
            executor_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> &str {
        &self.name
    }

    pub fn is_completed(&self) -> bool {
        self.status == MigrationStatus::CompletedSuccessfully
    }

    /// Moves the record to `next`, rejecting transitions the lifecycle does
    /// not allow.
    pub fn transition(&mut self, next: MigrationStatus) -> anyhow::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(anyhow::anyhow!(
                "invalid status transition for migration {}: {} -> {}",
                self.name,
                self.status,
                next
            ));
        }
        self.status = next;
        self.updated_at = get_epoch_time_in_ms();
        Ok(())
    }

    /// Records a progress reading. Progress never decreases while the
    /// migration is running.
    pub fn update_progress(&mut self, progress: f64) {
        let progress = crate::utils::clamp_percentage(progress);
        if self.status == MigrationStatus::Running && progress < self.progress {
            return;
        }
        self.progress = progress;
    }
}

/// Single-flight lock entry for a migration name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationLock {
    pub name: String,
    /// Engine instance holding the lock.
    pub holder: String,
    /// Unique per acquisition; writes under the lock must present it.
    pub token: String,
    pub acquired_at: u64,
}

impl MigrationLock {
    pub fn new(name: &str, holder: &str) -> Self {
        Self {
            name: name.to_string(),
            holder: holder.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: get_epoch_time_in_ms(),
        }
    }
}
