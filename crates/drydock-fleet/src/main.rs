// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! drydockd - runs the fleet machines against one SQLite database.
//!
//! Remote collaborators are the in-memory set here. Deployments embed the
//! library and pass real clients to [`Collaborators`].

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use drydock_core::config::Config;
use drydock_core::persistence::SqlitePersistence;
use drydock_core::runtime::EngineRuntime;
use drydock_core::worker::WorkerConfig;
use drydock_core::{Clock, ProgramRegistry, SystemClock};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use drydock_fleet::collab::{Collaborators, InMemoryCloud};
use drydock_fleet::config::FleetConfig;
use drydock_fleet::programs::{self, doctor};
use drydock_fleet::{Fleet, store};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("drydock_fleet=info,drydock_core=info")),
        )
        .init();

    info!("Starting drydockd");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let fleet_config = FleetConfig::from_env().map_err(|e| {
        error!("Fleet configuration error: {}", e);
        e
    })?;

    info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        locations = ?fleet_config.locations,
        "Configuration loaded"
    );

    let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    drydock_core::migrations::run(&pool).await?;
    store::apply_schema(&pool).await?;
    info!("Database ready");

    let clock = Arc::new(SystemClock);
    let seeded = doctor::seed_system_queries(&pool, clock.now()).await?;
    if seeded > 0 {
        info!(seeded, "System health checks added");
    }

    let collab = Collaborators::in_memory(Arc::new(InMemoryCloud::new()));
    let fleet = Arc::new(Fleet::new(pool.clone(), collab, fleet_config));

    let mut registry = ProgramRegistry::new();
    programs::register(&mut registry, fleet);

    let runtime = EngineRuntime::builder()
        .persistence(Arc::new(SqlitePersistence::new(pool.clone())))
        .registry(registry)
        .clock(clock)
        .lease_duration(config.lease_duration)
        .worker(WorkerConfig {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            max_concurrent: config.max_concurrent_processes,
        })
        .build()?
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
