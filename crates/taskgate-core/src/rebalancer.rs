// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker placing perpetual tasks on live delegates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::perpetual_scheduler::PerpetualTaskScheduler;

/// Configuration for the perpetual task rebalancer.
#[derive(Debug, Clone)]
pub struct RebalancerConfig {
    /// How often to rebalance.
    pub poll_interval: Duration,
    /// Tolerated max-min load difference before sticky tasks move.
    pub skew_threshold: usize,
    /// Silence after which a delegate stops receiving perpetual tasks.
    pub delegate_heartbeat_timeout: Duration,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            skew_threshold: 2,
            delegate_heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

pub struct PerpetualTaskRebalancer {
    scheduler: Arc<PerpetualTaskScheduler>,
    config: RebalancerConfig,
    shutdown: Arc<Notify>,
}

impl PerpetualTaskRebalancer {
    pub fn new(scheduler: Arc<PerpetualTaskScheduler>, config: RebalancerConfig) -> Self {
        Self {
            scheduler,
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
            skew_threshold = self.config.skew_threshold,
            "Perpetual task rebalancer started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Perpetual task rebalancer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.scheduler.rebalance_all(self.config.skew_threshold).await {
                        Ok(summary) if summary.planned == 0 => debug!("Perpetual tasks balanced"),
                        Ok(summary) => info!(
                            planned = summary.planned,
                            applied = summary.applied,
                            "Perpetual tasks rebalanced"
                        ),
                        Err(e) => error!(error = %e, "Perpetual task rebalance failed"),
                    }
                }
            }
        }

        info!("Perpetual task rebalancer stopped");
    }
}
