use std::fmt::{self, Display};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

use super::feature_flags::FeatureFlags;

/// Target system of an operation. Also used as the service name in version
/// requirements.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    AsRefStr,
    StrumDisplay,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Database {
    ClickHouse,
    Postgres,
}

/// A unit of work against the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Statement {
    Sql(String),
    Noop,
}

impl Statement {
    pub fn sql(sql: impl Into<String>) -> Self {
        Statement::Sql(sql.into())
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Sql(sql) => write!(f, "{}", sql.trim()),
            Statement::Noop => write!(f, "noop"),
        }
    }
}

/// A process-local mutation applied by the engine right after a forward or
/// rollback statement succeeds. Applying the same side effect twice has the
/// same result as applying it once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEffect {
    SetFlag { flag: String, value: bool },
}

impl SideEffect {
    pub fn set_flag(flag: &str, value: bool) -> Self {
        SideEffect::SetFlag {
            flag: flag.to_string(),
            value,
        }
    }

    pub fn apply(&self, flags: &FeatureFlags) {
        match self {
            SideEffect::SetFlag { flag, value } => flags.set(flag, *value),
        }
    }
}

/// One forward step of a migration and the matching way to undo it.
///
/// An operation without a rollback statement is not reversible; the engine
/// refuses to roll a migration back past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub database: Database,
    pub forward: Statement,
    pub rollback: Option<Statement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effect: Option<SideEffect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effect_rollback: Option<SideEffect>,
}

impl Operation {
    pub fn new(database: Database, forward: Statement) -> Self {
        Self {
            database,
            forward,
            rollback: None,
            side_effect: None,
            side_effect_rollback: None,
        }
    }

    /// A reversible SQL operation.
    pub fn sql(database: Database, forward: impl Into<String>, rollback: impl Into<String>) -> Self {
        Self::new(database, Statement::sql(forward)).with_rollback(Statement::sql(rollback))
    }

    pub fn with_rollback(mut self, rollback: Statement) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn with_side_effects(mut self, apply: SideEffect, undo: SideEffect) -> Self {
        self.side_effect = Some(apply);
        self.side_effect_rollback = Some(undo);
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.rollback.is_some()
    }
}

/// Stable fingerprint of an operation list. Operation indices are the
/// resumability contract, so a shipped list must keep its fingerprint.
pub fn fingerprint(operations: &[Operation]) -> Result<String> {
    let encoded = serde_json::to_vec(operations).context("encoding operations for fingerprint")?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}
