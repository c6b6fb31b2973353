use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cluster_migrator::{
    config::MigratorConfig,
    migrations::runner::{ResetOutcome, RollbackOutcome, RunOutcome},
    service::{ReadOnlyService, Service},
    state_store::is_store_in_use,
    tracing::setup_tracing,
};
use serde::Serialize;
use serde_json::json;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List migrations due at the configured application version
    Pending,
    /// Show the record of a migration, or of every migration
    Status { name: Option<String> },
    /// Run a migration, resuming it if it was interrupted or errored
    Run { name: String },
    /// Roll back an errored migration
    Rollback { name: String },
    /// Delete the record of a migration
    Reset { name: String },
    /// Print the definition of a migration, including its operations
    Describe { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => MigratorConfig::from_path(&path.to_string_lossy())?,
        None => MigratorConfig::from_env()?,
    };

    let _log_guard = setup_tracing(&config)?;

    execute(config, cli.command).await
}

#[::tracing::instrument(skip_all, fields(env = config.env, instance_id = config.instance_id()))]
async fn execute(config: MigratorConfig, command: Command) -> Result<()> {
    let service = match Service::new(config.clone()).await {
        Ok(service) => service,
        Err(err) if is_store_in_use(&err) => {
            ::tracing::warn!(
                error = format!("{err:#}"),
                "state store is held by another migrator"
            );
            return execute_while_busy(&config, command);
        }
        Err(err) => return Err(err.context("failed to start migrator")),
    };
    let runner = &service.runner;

    match command {
        Command::Pending => print_json(&service.pending),
        Command::Status { name: Some(name) } => print_json(&runner.status(&name)?),
        Command::Status { name: None } => print_json(&runner.list()?),
        Command::Run { name } => {
            let outcome = runner.run(&name).await?;
            print_json(&json!({
                "outcome": outcome,
                "record": runner.status(&name)?,
            }))
        }
        Command::Rollback { name } => {
            let outcome = runner.rollback(&name).await?;
            print_json(&json!({
                "outcome": outcome,
                "record": runner.status(&name)?,
            }))
        }
        Command::Reset { name } => print_json(&runner.reset(&name)?),
        Command::Describe { name } => print_json(&runner.describe(&name)?),
    }
}

/// Queries are answered from a read-only view of the state store. Commands
/// that would change it report `busy`.
fn execute_while_busy(config: &MigratorConfig, command: Command) -> Result<()> {
    let view = || ReadOnlyService::new(config).context("failed to read migrator state");
    match command {
        Command::Pending => print_json(&view()?.pending),
        Command::Status { name: Some(name) } => print_json(&view()?.status(&name)?),
        Command::Status { name: None } => print_json(&view()?.list()?),
        Command::Describe { name } => print_json(&view()?.describe(&name)?),
        Command::Run { .. } => print_json(&json!({ "outcome": RunOutcome::Busy })),
        Command::Rollback { .. } => print_json(&json!({ "outcome": RollbackOutcome::Busy })),
        Command::Reset { .. } => print_json(&ResetOutcome::Busy),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
