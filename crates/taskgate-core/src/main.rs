// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Taskgate Core - Delegate Task Dispatch Engine
//!
//! Core is responsible for:
//! - Delegate task lifecycle (submit, dispatch, cancel, expire)
//! - Perpetual task placement and rebalancing
//! - Result callback registration and progress updates

use anyhow::Result;
use tracing::{error, info};

use taskgate_core::config::Config;
use taskgate_core::persistence;
use taskgate_core::runtime::TaskgateRuntimeBuilder;

/// Pool size of the standalone server.
const MAX_DB_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("taskgate_core=info".parse()?),
        )
        .init();

    info!("Starting Taskgate Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        service_addr = %config.service_addr,
        agent_addr = %config.agent_addr,
        sync_wait_ms = config.sync_wait.as_millis() as u64,
        "Configuration loaded"
    );

    // Connect and migrate
    info!("Connecting to database...");
    let persistence = persistence::connect(&config.database_url, MAX_DB_CONNECTIONS).await?;
    persistence.health_check_db().await?;
    info!("Database ready, migrations applied");

    let runtime = TaskgateRuntimeBuilder::from_config(&config)
        .persistence(persistence)
        .build()?
        .start()
        .await?;

    info!("Taskgate Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
