//! The migration engine: operation model, definitions, registry, version
//! gate and runner.

pub mod client;
pub mod definition;
pub mod definitions;
pub mod error;
pub mod feature_flags;
pub mod operation;
pub mod registry;
pub mod runner;
#[cfg(test)]
pub mod testing;
pub mod version;
pub mod version_gate;

pub use error::Error;
