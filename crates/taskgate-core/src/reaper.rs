// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that terminates tasks nobody will finish.
//!
//! Two sweeps per tick:
//! - non-terminal tasks past `expires_at` become EXPIRED
//! - STARTED tasks whose delegate stopped heartbeating become FAILED
//!
//! Both use the same terminal-guarded write as every other transition, so a
//! result that lands first wins and the sweep becomes a no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::dispatcher::TaskDispatcher;
use crate::error::Result;

/// Configuration for the task reaper.
#[derive(Debug, Clone)]
pub struct TaskReaperConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Silence after which a delegate's STARTED tasks are failed.
    pub delegate_heartbeat_timeout: Duration,
    /// Maximum tasks handled per sweep.
    pub batch_size: i64,
}

impl Default for TaskReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            delegate_heartbeat_timeout: Duration::from_secs(90),
            batch_size: 200,
        }
    }
}

/// Background worker expiring overdue tasks and failing orphaned ones.
pub struct TaskReaper {
    dispatcher: Arc<TaskDispatcher>,
    config: TaskReaperConfig,
    shutdown: Arc<Notify>,
}

impl TaskReaper {
    pub fn new(dispatcher: Arc<TaskDispatcher>, config: TaskReaperConfig) -> Self {
        Self {
            dispatcher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            heartbeat_timeout_secs = self.config.delegate_heartbeat_timeout.as_secs(),
            "Task reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Task reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Task reaper sweep failed");
                    }
                }
            }
        }

        info!("Task reaper stopped");
    }

    /// One expiry sweep followed by one lost-delegate sweep.
    pub async fn sweep(&self) -> Result<(usize, usize)> {
        let expired = self
            .dispatcher
            .expire_overdue_tasks(self.config.batch_size)
            .await?;
        let failed = self
            .dispatcher
            .fail_tasks_of_lost_delegates(self.config.batch_size)
            .await?;

        if expired == 0 && failed == 0 {
            debug!("Nothing to reap");
        } else {
            info!(expired, failed, "Reaped tasks");
        }
        Ok((expired, failed))
    }
}
