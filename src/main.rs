//! Resources Worker - resource domain service for the university booking platform
//!
//! Answers cross-service resource queries over the message bus and runs CSV
//! imports of resources, synchronously or as tracked import jobs.

mod cli;
mod config;
mod db;
mod defaults;
mod handlers;
mod services;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command, QueryCommand};
use crate::config::{BusBackend, Config, StoreBackend};
use crate::handlers::queries::QueryResponder;
use crate::services::bus::{MemoryBus, MessageBus, NatsBus};
use crate::services::import_jobs::{AsyncImportRequest, ImportJobTracker};
use crate::services::query_client::QueryClient;
use crate::services::store::Stores;

fn init_logging() -> WorkerGuard {
    // Logs directory - use LOGS_DIR env var or default to ../logs
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "worker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,resources_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logging();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    info!("Configuration loaded");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::Migrate => migrate(&config).await,
        Command::Import {
            file,
            user,
            mode,
            skip_errors,
        } => {
            let csv_content = read_csv(&file).await?;
            let tracker = ImportJobTracker::new(&open_stores(&config).await?, config.sync_import_max_bytes);

            if csv_content.len() > config.sync_import_max_bytes {
                // Too large for a synchronous run: go through a tracked job
                let job = tracker
                    .start_async_import(AsyncImportRequest {
                        user_id: user,
                        file_name: file.display().to_string(),
                        file_size: None,
                        csv_content,
                        mode,
                        skip_errors,
                    })
                    .await?;
                tracker.wait_idle().await;
                print_json(&tracker.get_import_job(job.id, user).await?)
            } else {
                let result = tracker.import_sync(&csv_content, mode, skip_errors, user).await?;
                print_json(&result)
            }
        }
        Command::Validate { file, user, mode } => {
            let csv_content = read_csv(&file).await?;
            let tracker = ImportJobTracker::new(&open_stores(&config).await?, config.sync_import_max_bytes);
            print_json(&tracker.validate(&csv_content, mode, user).await?)
        }
        Command::Rollback {
            job_id,
            user,
            reason,
        } => {
            let tracker = ImportJobTracker::new(&open_stores(&config).await?, config.sync_import_max_bytes);
            print_json(&tracker.rollback_import(job_id, reason, user).await?)
        }
        Command::Query { query } => run_query(&config, query).await,
    }
}

/// Run the responders and import command handlers until Ctrl-C
async fn serve(config: &Config) -> Result<()> {
    info!("Starting Resources Worker...");

    let stores = open_stores(config).await?;
    match stores.resources.count_resources().await {
        Ok(count) => info!("{} resources in store", count),
        Err(e) => warn!("Could not count resources: {}", e),
    }

    let bus = connect_bus(config).await?;
    let responder = Arc::new(QueryResponder::new(
        stores.resources.clone(),
        config.candidate_default_limit,
    ));
    let tracker = ImportJobTracker::new(&stores, config.sync_import_max_bytes);

    let mut handlers = handlers::start_handlers(
        bus,
        responder,
        tracker.clone(),
        &config.service_name,
        &config.consumer_group,
    )
    .await?;
    debug!("Serving topics: {:?}", handlers.topics());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
        (topic, result) = handlers.first_exit() => {
            error!("Handler for {} finished: {:?}", topic, result);
        }
    }

    handlers.shutdown().await;
    tracker.wait_idle().await;
    info!("Resources Worker stopped");

    Ok(())
}

async fn migrate(config: &Config) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to run migrations")?;
    let pool = db::create_pool(database_url).await?;
    db::run_migrations(&pool).await
}

async fn open_stores(config: &Config) -> Result<Stores> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set when STORE_BACKEND=postgres")?;
            let pool = db::create_pool(database_url).await?;
            info!("Connected to PostgreSQL");

            db::run_migrations(&pool).await?;
            Ok(Stores::postgres(pool))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; nothing is persisted");
            Ok(Stores::memory().0)
        }
    }
}

async fn connect_bus(config: &Config) -> Result<Arc<dyn MessageBus>> {
    match config.bus_backend {
        BusBackend::Nats => {
            // Supports optional NATS_USER/NATS_PASSWORD auth
            let client = match config.nats_credentials {
                Some((ref user, ref password)) => {
                    async_nats::ConnectOptions::new()
                        .user_and_password(user.clone(), password.clone())
                        .connect(&config.nats_url)
                        .await?
                }
                None => async_nats::connect(&config.nats_url).await?,
            };
            info!("Connected to NATS at {}", config.nats_url);
            Ok(Arc::new(NatsBus::new(client)))
        }
        BusBackend::Memory => {
            warn!("Using in-process bus; only this process can reach the handlers");
            Ok(Arc::new(MemoryBus::new()))
        }
    }
}

async fn run_query(config: &Config, query: QueryCommand) -> Result<()> {
    let bus = connect_bus(config).await?;
    let client = QueryClient::connect(
        bus,
        format!("{}-cli", config.service_name),
        config.query_timeout,
        config.query_max_attempts,
    )
    .await?;

    match query {
        QueryCommand::ById { id } => print_json(&client.resource_by_id(&id).await?),
        QueryCommand::ByIds { ids } => print_json(&client.resources_by_ids(ids).await?),
        QueryCommand::Candidates {
            resource_type,
            exclude,
            limit,
        } => print_json(
            &client
                .candidate_resources(resource_type, exclude, None, limit)
                .await?,
        ),
        QueryCommand::Availability { id, start, end } => {
            print_json(&client.check_availability(&id, start, end).await?)
        }
    }
}

async fn read_csv(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
