// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Perpetual task lifecycle and placement.
//!
//! Creation never assigns a delegate. Placement happens in
//! [`PerpetualTaskScheduler::rebalance_account`], which runs out of the
//! request path (see [`crate::rebalancer`]) and applies every planned move as
//! a compare-and-swap on the previous assignment.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::delegate::liveness_cutoff;
use crate::error::{CoreError, Result};
use crate::perpetual::{ExecutionBundle, NewPerpetualTask, PerpetualTask, PerpetualTaskContext};
use crate::persistence::Persistence;
use crate::rebalance::plan_rebalance;

/// Outcome of a rebalance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceSummary {
    /// Moves the plan asked for.
    pub planned: usize,
    /// Moves whose compare-and-swap applied.
    pub applied: usize,
}

impl std::ops::AddAssign for RebalanceSummary {
    fn add_assign(&mut self, other: Self) {
        self.planned += other.planned;
        self.applied += other.applied;
    }
}

pub struct PerpetualTaskScheduler {
    persistence: Arc<dyn Persistence>,
    heartbeat_timeout: Duration,
}

impl PerpetualTaskScheduler {
    /// `heartbeat_timeout` decides which delegates count as live when placing.
    pub fn new(persistence: Arc<dyn Persistence>, heartbeat_timeout: Duration) -> Self {
        Self {
            persistence,
            heartbeat_timeout,
        }
    }

    /// Persist a new, unassigned perpetual task and return its id.
    ///
    /// Unless `allow_stale_task_id` is set, a task of the same type and
    /// context already owned by the account is returned instead.
    #[instrument(skip(self, ctx, request), fields(account_id = %ctx.account_id(), task_type = %request.task_type))]
    pub async fn create_task(&self, ctx: &RequestContext, request: NewPerpetualTask) -> Result<String> {
        let context = request.resolve_context()?;
        let fingerprint = context.fingerprint()?;

        if !request.allow_stale_task_id
            && let Some(existing) = self
                .persistence
                .find_perpetual_task(ctx.account_id(), &request.task_type, &fingerprint)
                .await?
        {
            debug!(perpetual_task_id = %existing.id, "Perpetual task already exists");
            return Ok(existing.id);
        }

        let now = Utc::now();
        let task = PerpetualTask {
            id: Uuid::new_v4().to_string(),
            account_id: ctx.account_id().to_string(),
            task_type: request.task_type,
            context,
            schedule: request.schedule,
            delegate_id: None,
            paused: false,
            allow_stale_task_id: request.allow_stale_task_id,
            description: request.description,
            context_fingerprint: fingerprint,
            created_at: now,
            context_updated_at: now,
            assigned_at: None,
            last_heartbeat_at: None,
        };
        self.persistence.insert_perpetual_task(&task).await?;

        info!(perpetual_task_id = %task.id, "Perpetual task created");
        Ok(task.id)
    }

    /// Recompute a task's execution context. Identity and assignment are
    /// kept; a missing bundle re-stamps the current context. Returns false
    /// when the task does not exist.
    #[instrument(skip(self, ctx, execution_bundle), fields(account_id = %ctx.account_id()))]
    pub async fn reset_task(
        &self,
        ctx: &RequestContext,
        perpetual_task_id: &str,
        execution_bundle: Option<Vec<u8>>,
    ) -> Result<bool> {
        // Decode before touching the store.
        let replacement = match execution_bundle.filter(|b| !b.is_empty()) {
            Some(bytes) => Some(PerpetualTaskContext::ExecutionBundle {
                bundle: ExecutionBundle::from_bytes(&bytes)?,
            }),
            None => None,
        };

        let Some(task) = self
            .persistence
            .get_perpetual_task(ctx.account_id(), perpetual_task_id)
            .await?
        else {
            debug!("Reset for unknown perpetual task");
            return Ok(false);
        };

        let context = replacement.unwrap_or(task.context);
        let fingerprint = context.fingerprint()?;
        let updated = self
            .persistence
            .update_perpetual_task_context(
                ctx.account_id(),
                perpetual_task_id,
                &context,
                &fingerprint,
                Utc::now(),
            )
            .await?;
        if updated {
            info!(delegate_id = ?task.delegate_id, "Perpetual task reset");
        }
        Ok(updated)
    }

    /// Remove a task. Deleting an unknown task is not an error.
    #[instrument(skip(self, ctx), fields(account_id = %ctx.account_id()))]
    pub async fn delete_task(&self, ctx: &RequestContext, perpetual_task_id: &str) -> Result<bool> {
        let deleted = self
            .persistence
            .delete_perpetual_task(ctx.account_id(), perpetual_task_id)
            .await?;
        if deleted {
            info!("Perpetual task deleted");
        } else {
            debug!("Delete for unknown perpetual task");
        }
        Ok(deleted)
    }

    /// Stop handing the task to delegates. The assignment is kept.
    pub async fn pause_task(&self, ctx: &RequestContext, perpetual_task_id: &str) -> Result<()> {
        self.set_paused(ctx, perpetual_task_id, true).await
    }

    pub async fn resume_task(&self, ctx: &RequestContext, perpetual_task_id: &str) -> Result<()> {
        self.set_paused(ctx, perpetual_task_id, false).await
    }

    #[instrument(skip(self, ctx), fields(account_id = %ctx.account_id()))]
    async fn set_paused(&self, ctx: &RequestContext, perpetual_task_id: &str, paused: bool) -> Result<()> {
        let found = self
            .persistence
            .set_perpetual_task_paused(ctx.account_id(), perpetual_task_id, paused)
            .await?;
        if !found {
            return Err(CoreError::PerpetualTaskNotFound {
                perpetual_task_id: perpetual_task_id.to_string(),
            });
        }
        info!(paused, "Perpetual task pause state changed");
        Ok(())
    }

    pub async fn get_task(
        &self,
        ctx: &RequestContext,
        perpetual_task_id: &str,
    ) -> Result<Option<PerpetualTask>> {
        self.persistence
            .get_perpetual_task(ctx.account_id(), perpetual_task_id)
            .await
    }

    /// Unpaused tasks currently assigned to the delegate.
    pub async fn list_assigned_tasks(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
    ) -> Result<Vec<PerpetualTask>> {
        self.persistence
            .list_perpetual_tasks_for_delegate(ctx.account_id(), delegate_id)
            .await
    }

    /// Record a successful probe. False when the task is gone or no longer
    /// assigned to this delegate, which tells the delegate to stop it.
    pub async fn heartbeat(
        &self,
        ctx: &RequestContext,
        perpetual_task_id: &str,
        delegate_id: &str,
    ) -> Result<bool> {
        let recorded = self
            .persistence
            .record_perpetual_task_heartbeat(ctx.account_id(), perpetual_task_id, delegate_id, Utc::now())
            .await?;
        if !recorded {
            debug!(perpetual_task_id, delegate_id, "Perpetual task heartbeat from non-owner");
        }
        Ok(recorded)
    }

    /// Plan and apply placement for one account.
    #[instrument(skip(self))]
    pub async fn rebalance_account(&self, account_id: &str, skew_threshold: usize) -> Result<RebalanceSummary> {
        let tasks = self.persistence.list_perpetual_tasks(account_id).await?;
        if tasks.is_empty() {
            return Ok(RebalanceSummary::default());
        }
        let cutoff = liveness_cutoff(Utc::now(), self.heartbeat_timeout);
        let live = self.persistence.list_live_delegates(account_id, cutoff).await?;

        let moves = plan_rebalance(&tasks, &live, skew_threshold);
        let mut summary = RebalanceSummary {
            planned: moves.len(),
            applied: 0,
        };
        for mv in moves {
            let applied = self
                .persistence
                .reassign_perpetual_task(
                    account_id,
                    &mv.task_id,
                    mv.from.as_deref(),
                    mv.to.as_deref(),
                    Utc::now(),
                )
                .await?;
            if applied {
                info!(
                    perpetual_task_id = %mv.task_id,
                    from = ?mv.from,
                    to = ?mv.to,
                    "Perpetual task reassigned"
                );
                summary.applied += 1;
            } else {
                debug!(perpetual_task_id = %mv.task_id, "Stale move skipped");
            }
        }
        Ok(summary)
    }

    /// Rebalance every account that owns perpetual tasks. A failing account
    /// is logged and skipped.
    pub async fn rebalance_all(&self, skew_threshold: usize) -> Result<RebalanceSummary> {
        let mut total = RebalanceSummary::default();
        for account_id in self.persistence.list_perpetual_task_accounts().await? {
            match self.rebalance_account(&account_id, skew_threshold).await {
                Ok(summary) => total += summary,
                Err(e) => warn!(account_id = %account_id, error = %e, "Rebalance failed for account"),
            }
        }
        Ok(total)
    }
}
