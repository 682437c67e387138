//! `queuectl` command-line entry point.

mod cli;
mod commands;
mod config_file;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::warn;

use queuectl_infra::jobs::SqliteJobStore;

use crate::cli::{Cli, Commands, ConfigAction};
use crate::commands::WorkerOptions;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    queuectl_observability::init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn open_store(cli: &Cli) -> anyhow::Result<SqliteJobStore> {
    SqliteJobStore::open(&cli.db)
        .await
        .with_context(|| format!("failed to open job database {}", cli.db.display()))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Enqueue { job } => {
            let config = config_file::load_or_init(&cli.config)
                .with_context(|| format!("failed to load {}", cli.config.display()))?;
            let store = open_store(&cli).await?;
            let id = commands::enqueue(&store, &config, job).await?;
            println!("{id}");
        }
        Commands::Worker {
            count,
            poll_ms,
            lease_secs,
            timeout_secs,
        } => {
            let config = config_file::load_or_init(&cli.config)
                .with_context(|| format!("failed to load {}", cli.config.display()))?;
            let store = Arc::new(open_store(&cli).await?);
            let options = WorkerOptions {
                count: count.get(),
                poll_interval: Duration::from_millis(*poll_ms),
                lease: Duration::from_secs(*lease_secs),
                command_timeout: timeout_secs.map(Duration::from_secs),
            };
            commands::run_workers(store, &config, options, async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "could not listen for Ctrl-C; stopping workers");
                }
            })
            .await;
        }
        Commands::Status => {
            let store = open_store(&cli).await?;
            println!("{}", commands::status(&store).await?);
        }
        Commands::List { state } => {
            let store = open_store(&cli).await?;
            println!("{}", commands::list(&store, *state).await?);
        }
        Commands::Dlq { list, retry } => {
            let store = open_store(&cli).await?;
            if let Some(id) = retry {
                let id = commands::dlq_retry(&store, id).await?;
                println!("{id}");
            } else if *list {
                println!("{}", commands::dlq_list(&store).await?);
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => println!("{}", commands::config_show(&cli.config)?),
            ConfigAction::Set { key, value } => {
                let config = commands::config_set(&cli.config, key, value)?;
                println!("{}", config.to_json_pretty()?);
            }
        },
    }
    Ok(())
}
