pub mod config;
pub mod data_model;
pub mod metrics;
pub mod migrations;
pub mod service;
pub mod state_store;
pub mod tracing;
pub mod utils;
