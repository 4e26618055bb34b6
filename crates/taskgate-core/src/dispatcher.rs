// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task dispatcher: submission, cancellation, progress and the
//! delegate-facing pickup protocol.
//!
//! The store is the only authority on task state. The in-memory structures
//! here ([`TaskWakeups`], sync waiters) only shorten waits; every decision
//! re-reads the record and every transition is a guarded write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::capability::CapabilityMatcher;
use crate::context::RequestContext;
use crate::delegate::{DelegateRecord, liveness_cutoff};
use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::task::{
    DelegateTask, ExecutionStage, NewTask, TaskMode, TaskOutcome, TaskStatus, deadline,
    latest_deadline,
};

/// Queued tasks fetched per page while a poll looks for eligible work.
const POLL_PAGE_SIZE: i64 = 500;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bounded wait of a SYNC submission.
    pub sync_wait: Duration,
    /// Re-check period while waiting, covers wakeups lost to other processes.
    pub sync_poll_interval: Duration,
    /// Exclusive pickup window of the preferred delegate.
    pub broadcast_grace: Duration,
    /// Silence after which a delegate no longer counts as live.
    pub delegate_heartbeat_timeout: Duration,
    /// How far back `list_aborted_tasks` looks.
    pub aborted_task_lookback: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sync_wait: Duration::from_secs(30),
            sync_poll_interval: Duration::from_millis(500),
            broadcast_grace: Duration::from_secs(5),
            delegate_heartbeat_timeout: Duration::from_secs(90),
            aborted_task_lookback: Duration::from_secs(600),
        }
    }
}

/// Hook invoked once per task that becomes visible to delegates.
#[async_trait]
pub trait TaskBroadcaster: Send + Sync {
    async fn broadcast_new_task(&self, task: &DelegateTask);
}

/// Per-account wakeups for delegate long-polls in this process.
#[derive(Debug, Default)]
pub struct TaskWakeups {
    accounts: Mutex<HashMap<String, Arc<Notify>>>,
}

impl TaskWakeups {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, account_id: &str) -> Arc<Notify> {
        self.lock()
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn notify(&self, account_id: &str) {
        if let Some(notify) = self.lock().get(account_id) {
            notify.notify_waiters();
        }
    }
}

/// Default broadcaster: wakes long-polling delegates of the account.
pub struct LocalBroadcaster {
    wakeups: Arc<TaskWakeups>,
}

impl LocalBroadcaster {
    pub fn new(wakeups: Arc<TaskWakeups>) -> Self {
        Self { wakeups }
    }
}

#[async_trait]
impl TaskBroadcaster for LocalBroadcaster {
    async fn broadcast_new_task(&self, task: &DelegateTask) {
        self.wakeups.notify(&task.account_id);
    }
}

/// SYNC submitters waiting for a terminal status, by task id.
#[derive(Default)]
struct SyncWaiters {
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl SyncWaiters {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, task_id: &str) -> Arc<Notify> {
        self.lock()
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn remove(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    fn wake(&self, task_id: &str) {
        if let Some(notify) = self.lock().get(task_id) {
            notify.notify_waiters();
        }
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTask {
    pub task_id: String,
    /// Stage when `submit` returned. For SYNC tasks, after the bounded wait.
    pub stage: ExecutionStage,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Stage observed when the cancel was applied, or the current stage
    /// when nothing was applied. `TypeUnspecified` for unknown tasks.
    pub stage: ExecutionStage,
    /// Whether this call moved the task to ABORTED.
    pub aborted: bool,
}

pub struct TaskDispatcher {
    persistence: Arc<dyn Persistence>,
    matcher: CapabilityMatcher,
    broadcaster: Arc<dyn TaskBroadcaster>,
    wakeups: Arc<TaskWakeups>,
    sync_waiters: SyncWaiters,
    config: DispatcherConfig,
}

impl TaskDispatcher {
    pub fn new(persistence: Arc<dyn Persistence>, config: DispatcherConfig) -> Self {
        let wakeups = Arc::new(TaskWakeups::default());
        Self {
            persistence,
            matcher: CapabilityMatcher,
            broadcaster: Arc::new(LocalBroadcaster::new(wakeups.clone())),
            wakeups,
            sync_waiters: SyncWaiters::default(),
            config,
        }
    }

    /// Replace the broadcast hook. Local long-polls still re-check on their
    /// own schedule.
    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn TaskBroadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Persist a new task and make it visible to delegates.
    #[instrument(skip(self, ctx, task), fields(account_id = %ctx.account_id(), task_type = %task.task_type, mode = task.mode.as_str()))]
    pub async fn submit(&self, ctx: &RequestContext, task: NewTask) -> Result<SubmittedTask> {
        task.validate()?;
        if let Some(token) = &task.callback_token
            && self.persistence.get_callback(token).await?.is_none()
        {
            return Err(CoreError::invalid(
                "callback_token",
                format!("callback token '{}' is not registered", token),
            ));
        }

        let now = Utc::now();
        let timeout = task.effective_timeout();
        let mut record = DelegateTask {
            task_id: Uuid::new_v4().to_string(),
            account_id: ctx.account_id().to_string(),
            task_type: task.task_type,
            parameters: task.parameters,
            mode: task.mode,
            status: TaskStatus::Parked,
            timeout,
            expression_functor_token: task.expression_functor_token,
            setup_abstractions: task.setup_abstractions,
            log_abstractions: task.log_abstractions,
            capabilities: task.capabilities,
            selectors: task.selectors,
            callback_token: task.callback_token,
            eligible_delegate_ids: Vec::new(),
            preferred_delegate_id: None,
            delegate_id: None,
            result: None,
            error_message: None,
            created_at: now,
            assigned_at: None,
            finished_at: None,
            expires_at: None,
        };

        if task.parked {
            self.persistence.insert_task(&record).await?;
            info!(task_id = %record.task_id, "Task parked");
            return Ok(SubmittedTask {
                task_id: record.task_id,
                stage: ExecutionStage::Parked,
                expires_at: None,
            });
        }

        let (eligible, preferred) = self.select_delegates(&record).await?;
        record.status = TaskStatus::Queued;
        record.eligible_delegate_ids = eligible;
        record.preferred_delegate_id = preferred;
        record.expires_at = Some(deadline(now, timeout));
        self.persistence.insert_task(&record).await?;

        info!(
            task_id = %record.task_id,
            eligible = record.eligible_delegate_ids.len(),
            preferred = ?record.preferred_delegate_id,
            "Task queued"
        );

        let stage = match record.mode {
            TaskMode::Sync => self.schedule_sync_task(&record).await,
            TaskMode::Async => {
                self.schedule_async_task(&record).await;
                ExecutionStage::Queueing
            }
        };

        Ok(SubmittedTask {
            task_id: record.task_id,
            stage,
            expires_at: record.expires_at,
        })
    }

    async fn schedule_async_task(&self, task: &DelegateTask) {
        self.broadcaster.broadcast_new_task(task).await;
    }

    /// Broadcast and wait, bounded by `sync_wait`, for a terminal status.
    /// Read failures end the wait; the task id is still returned.
    async fn schedule_sync_task(&self, task: &DelegateTask) -> ExecutionStage {
        let notify = self.sync_waiters.register(&task.task_id);
        self.broadcaster.broadcast_new_task(task).await;

        let wait_until = Instant::now() + self.config.sync_wait;
        let mut stage = ExecutionStage::Queueing;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.persistence.get_task(&task.account_id, &task.task_id).await {
                Ok(Some(current)) => {
                    stage = current.stage();
                    if current.is_terminal() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Failed to read SYNC task while waiting");
                    break;
                }
            }

            let now = Instant::now();
            if now >= wait_until {
                debug!(task_id = %task.task_id, "SYNC wait elapsed");
                break;
            }
            let nap = (wait_until - now).min(self.config.sync_poll_interval);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }

        self.sync_waiters.remove(&task.task_id);
        stage
    }

    /// Live delegates eligible for `task`, and the least-loaded of them.
    async fn select_delegates(
        &self,
        task: &DelegateTask,
    ) -> Result<(Vec<String>, Option<String>)> {
        let cutoff = liveness_cutoff(Utc::now(), self.config.delegate_heartbeat_timeout);
        let live = self
            .persistence
            .list_live_delegates(&task.account_id, cutoff)
            .await?;
        let requirements = task.requirements();
        let eligible =
            self.matcher
                .eligible_delegates(&requirements, &task.setup_abstractions, &live);
        if eligible.is_empty() {
            warn!(task_id = %task.task_id, live = live.len(), "No eligible delegate for task yet");
            return Ok((Vec::new(), None));
        }

        let load = self
            .persistence
            .count_started_tasks_by_delegate(&task.account_id)
            .await?;
        let preferred = eligible
            .iter()
            .min_by(|a, b| {
                let la = load.get(&a.delegate_id).copied().unwrap_or(0);
                let lb = load.get(&b.delegate_id).copied().unwrap_or(0);
                la.cmp(&lb).then_with(|| a.delegate_id.cmp(&b.delegate_id))
            })
            .map(|d| d.delegate_id.clone());

        Ok((
            eligible.iter().map(|d| d.delegate_id.clone()).collect(),
            preferred,
        ))
    }

    /// Move a task toward ABORTED. Unknown tasks report `TypeUnspecified`.
    #[instrument(skip(self, ctx), fields(account_id = %ctx.account_id()))]
    pub async fn cancel(&self, ctx: &RequestContext, task_id: &str) -> Result<CancelOutcome> {
        let Some(task) = self.persistence.get_task(ctx.account_id(), task_id).await? else {
            debug!("Cancel for unknown task");
            return Ok(CancelOutcome {
                stage: ExecutionStage::TypeUnspecified,
                aborted: false,
            });
        };
        if task.is_terminal() {
            debug!(status = %task.status, "Cancel for terminal task ignored");
            return Ok(CancelOutcome {
                stage: task.stage(),
                aborted: false,
            });
        }

        let outcome = TaskOutcome::new(TaskStatus::Aborted).with_error("Task was aborted by the caller");
        if self
            .persistence
            .finish_task(ctx.account_id(), task_id, &outcome)
            .await?
        {
            info!(previous = %task.status, "Task aborted");
            self.sync_waiters.wake(task_id);
            return Ok(CancelOutcome {
                stage: task.stage(),
                aborted: true,
            });
        }

        // Lost the race to another terminal write.
        let stage = self
            .persistence
            .get_task(ctx.account_id(), task_id)
            .await?
            .map(|t| t.stage())
            .unwrap_or(ExecutionStage::TypeUnspecified);
        Ok(CancelOutcome {
            stage,
            aborted: false,
        })
    }

    /// Current stage. Unknown tasks report `TypeUnspecified`.
    pub async fn task_progress(&self, ctx: &RequestContext, task_id: &str) -> Result<ExecutionStage> {
        let stage = self
            .persistence
            .get_task(ctx.account_id(), task_id)
            .await?
            .map(|t| t.stage())
            .unwrap_or(ExecutionStage::TypeUnspecified);
        debug!(task_id, ?stage, "Task progress");
        Ok(stage)
    }

    pub async fn get_task(&self, ctx: &RequestContext, task_id: &str) -> Result<Option<DelegateTask>> {
        self.persistence.get_task(ctx.account_id(), task_id).await
    }

    /// PARKED → QUEUED. Returns false when the task is unknown or not parked.
    #[instrument(skip(self, ctx), fields(account_id = %ctx.account_id()))]
    pub async fn queue_parked_task(&self, ctx: &RequestContext, task_id: &str) -> Result<bool> {
        let Some(task) = self.persistence.get_task(ctx.account_id(), task_id).await? else {
            debug!("Queue request for unknown task");
            return Ok(false);
        };
        if task.status != TaskStatus::Parked {
            debug!(status = %task.status, "Queue request for task that is not parked");
            return Ok(false);
        }

        let (eligible, preferred) = self.select_delegates(&task).await?;
        let expires_at = task.expiry_from(Utc::now());
        let queued = self
            .persistence
            .queue_parked_task(
                ctx.account_id(),
                task_id,
                &eligible,
                preferred.as_deref(),
                expires_at,
            )
            .await?;
        if !queued {
            return Ok(false);
        }

        info!(eligible = eligible.len(), "Parked task queued");
        if let Some(task) = self.persistence.get_task(ctx.account_id(), task_id).await? {
            self.schedule_async_task(&task).await;
        }
        Ok(true)
    }

    fn in_preferred_window(&self, task: &DelegateTask, delegate_id: &str, now: DateTime<Utc>) -> bool {
        let Some(preferred) = task.preferred_delegate_id.as_deref() else {
            return false;
        };
        if preferred == delegate_id {
            return false;
        }
        let Some(expires_at) = task.expires_at else {
            return false;
        };
        // While queued, expires_at = queued_at + timeout unless clamped.
        let queued_at = chrono::Duration::from_std(task.timeout)
            .ok()
            .filter(|_| expires_at < latest_deadline())
            .and_then(|t| expires_at.checked_sub_signed(t))
            .unwrap_or(task.created_at);
        now < deadline(queued_at, self.config.broadcast_grace)
    }

    fn can_pick_up(&self, task: &DelegateTask, delegate: &DelegateRecord, now: DateTime<Utc>) -> bool {
        self.matcher
            .is_eligible(&task.requirements(), &task.setup_abstractions, delegate)
            && !self.in_preferred_window(task, &delegate.delegate_id, now)
    }

    async fn require_delegate(&self, ctx: &RequestContext, delegate_id: &str) -> Result<DelegateRecord> {
        self.persistence
            .get_delegate(ctx.account_id(), delegate_id)
            .await?
            .ok_or_else(|| CoreError::DelegateNotFound {
                delegate_id: delegate_id.to_string(),
            })
    }

    /// Pages through the queue, oldest first, until `limit` tasks the
    /// delegate may pick up are found or the queue runs out.
    async fn eligible_queued_tasks(
        &self,
        ctx: &RequestContext,
        delegate: &DelegateRecord,
        limit: usize,
    ) -> Result<Vec<DelegateTask>> {
        let now = Utc::now();
        let mut tasks = Vec::new();
        let mut offset = 0;
        while tasks.len() < limit {
            let page = self
                .persistence
                .list_queued_tasks(ctx.account_id(), offset, POLL_PAGE_SIZE)
                .await?;
            let exhausted = (page.len() as i64) < POLL_PAGE_SIZE;
            offset += page.len() as i64;
            let wanted = limit - tasks.len();
            tasks.extend(
                page.into_iter()
                    .filter(|t| self.can_pick_up(t, delegate, now))
                    .take(wanted),
            );
            if exhausted {
                break;
            }
        }
        Ok(tasks)
    }

    /// Queued tasks the delegate may acquire now, waiting up to `wait` for
    /// one to appear. Counts as a delegate heartbeat.
    #[instrument(skip(self, ctx), fields(account_id = %ctx.account_id()))]
    pub async fn poll_tasks(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
        limit: usize,
        wait: Duration,
    ) -> Result<Vec<DelegateTask>> {
        let delegate = self.require_delegate(ctx, delegate_id).await?;
        self.persistence
            .touch_delegate(ctx.account_id(), delegate_id, Utc::now())
            .await?;

        let notify = self.wakeups.subscribe(ctx.account_id());
        let wait_until = Instant::now() + wait;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let tasks = self.eligible_queued_tasks(ctx, &delegate, limit).await?;

            let remaining = wait_until.saturating_duration_since(Instant::now());
            if !tasks.is_empty() || remaining.is_zero() || limit == 0 {
                debug!(count = tasks.len(), "Poll answered");
                return Ok(tasks);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(remaining.min(self.config.sync_poll_interval)) => {}
            }
        }
    }

    /// Claim a queued task. `None` when another delegate won or the task is
    /// not available to this delegate.
    #[instrument(skip(self, ctx), fields(account_id = %ctx.account_id()))]
    pub async fn acquire_task(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
        task_id: &str,
    ) -> Result<Option<DelegateTask>> {
        let delegate = self.require_delegate(ctx, delegate_id).await?;
        let Some(task) = self.persistence.get_task(ctx.account_id(), task_id).await? else {
            debug!("Acquire for unknown task");
            return Ok(None);
        };

        if task.status == TaskStatus::Started && task.delegate_id.as_deref() == Some(delegate_id) {
            debug!("Acquire retried by the owning delegate");
            return Ok(Some(task));
        }
        if task.status != TaskStatus::Queued {
            debug!(status = %task.status, "Task is not acquirable");
            return Ok(None);
        }
        let now = Utc::now();
        if !self.can_pick_up(&task, &delegate, now) {
            debug!("Delegate may not acquire this task now");
            return Ok(None);
        }

        let expires_at = task.expiry_from(now);
        let won = self
            .persistence
            .assign_task(ctx.account_id(), task_id, delegate_id, now, expires_at)
            .await?;
        let current = self.persistence.get_task(ctx.account_id(), task_id).await?;
        if won {
            info!("Task started");
            return Ok(current);
        }
        Ok(current.filter(|t| {
            t.status == TaskStatus::Started && t.delegate_id.as_deref() == Some(delegate_id)
        }))
    }

    /// Terminal result from the executing delegate. Returns whether it was
    /// applied; results for already-terminal tasks are dropped.
    #[instrument(skip(self, ctx, result, error_message), fields(account_id = %ctx.account_id()))]
    pub async fn report_result(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
        task_id: &str,
        status: TaskStatus,
        result: Option<Vec<u8>>,
        error_message: Option<String>,
    ) -> Result<bool> {
        if !matches!(status, TaskStatus::Success | TaskStatus::Error | TaskStatus::Failed) {
            return Err(CoreError::invalid(
                "status",
                format!("delegates cannot report status '{}'", status),
            ));
        }

        let task = self
            .persistence
            .get_task(ctx.account_id(), task_id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        if task.is_terminal() {
            debug!(status = %task.status, "Result for terminal task dropped");
            return Ok(false);
        }
        if task.delegate_id.as_deref() != Some(delegate_id) {
            return Err(CoreError::InvalidTaskState {
                task_id: task_id.to_string(),
                expected: format!("started by delegate {}", delegate_id),
                actual: format!("{} on {:?}", task.status, task.delegate_id),
            });
        }

        let mut outcome = TaskOutcome::new(status);
        outcome.result = result;
        outcome.error_message = error_message;
        let applied = self
            .persistence
            .finish_task(ctx.account_id(), task_id, &outcome)
            .await?;
        if applied {
            info!(status = %status, "Task finished");
            self.sync_waiters.wake(task_id);
        }
        Ok(applied)
    }

    /// Recently aborted tasks the delegate still holds.
    pub async fn list_aborted_tasks(&self, ctx: &RequestContext, delegate_id: &str) -> Result<Vec<String>> {
        let since = liveness_cutoff(Utc::now(), self.config.aborted_task_lookback);
        self.persistence
            .list_aborted_tasks_for_delegate(ctx.account_id(), delegate_id, since)
            .await
    }

    /// Move overdue non-terminal tasks to EXPIRED. Returns how many moved.
    pub async fn expire_overdue_tasks(&self, batch_size: i64) -> Result<usize> {
        let overdue = self
            .persistence
            .list_expired_tasks(Utc::now(), batch_size)
            .await?;
        let mut expired = 0;
        for task in overdue {
            let outcome = TaskOutcome::new(TaskStatus::Expired).with_error(format!(
                "Task expired. Not completed within {}s while {}",
                task.timeout.as_secs(),
                task.status
            ));
            if self
                .persistence
                .finish_task(&task.account_id, &task.task_id, &outcome)
                .await?
            {
                info!(task_id = %task.task_id, account_id = %task.account_id, previous = %task.status, "Task expired");
                self.sync_waiters.wake(&task.task_id);
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Fail STARTED tasks of delegates that stopped heartbeating.
    pub async fn fail_tasks_of_lost_delegates(&self, batch_size: i64) -> Result<usize> {
        let cutoff = liveness_cutoff(Utc::now(), self.config.delegate_heartbeat_timeout);
        let orphaned = self
            .persistence
            .list_tasks_of_lost_delegates(cutoff, batch_size)
            .await?;
        let mut failed = 0;
        for task in orphaned {
            let delegate_id = task.delegate_id.as_deref().unwrap_or("unknown");
            let outcome = TaskOutcome::new(TaskStatus::Failed).with_error(format!(
                "Delegate [{}] disconnected while executing the task",
                delegate_id
            ));
            if self
                .persistence
                .finish_task(&task.account_id, &task.task_id, &outcome)
                .await?
            {
                warn!(task_id = %task.task_id, delegate_id, "Task failed, delegate lost");
                self.sync_waiters.wake(&task.task_id);
                failed += 1;
            }
        }
        Ok(failed)
    }
}
