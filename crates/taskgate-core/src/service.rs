// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delegate service facade.
//!
//! [`DelegateService`] is the one place engine errors are translated. Caller
//! operations return [`ServiceError`], so a persistence failure reaches the
//! client only as the fixed message of its [`DriverOperation`]. Agent
//! operations keep [`CoreError`](crate::error::CoreError) since delegates act
//! on the specific code.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::callback::{CallbackDestination, CallbackRegistry, ProgressDisposition};
use crate::capability::ScopingRules;
use crate::context::RequestContext;
use crate::delegate::{DelegateRecord, DelegateRegistration, DelegateRegistry};
use crate::dispatcher::{CancelOutcome, SubmittedTask, TaskDispatcher};
use crate::error::{CoreError, DriverOperation, Result, ServiceError};
use crate::perpetual::{NewPerpetualTask, PerpetualTask};
use crate::perpetual_scheduler::PerpetualTaskScheduler;
use crate::task::{DelegateTask, ExecutionStage, NewTask, ProgressRecord, TaskStatus};

type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Engine components behind both QUIC servers.
pub struct DelegateService {
    dispatcher: Arc<TaskDispatcher>,
    scheduler: Arc<PerpetualTaskScheduler>,
    callbacks: Arc<CallbackRegistry>,
    delegates: Arc<DelegateRegistry>,
}

impl DelegateService {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        scheduler: Arc<PerpetualTaskScheduler>,
        callbacks: Arc<CallbackRegistry>,
        delegates: Arc<DelegateRegistry>,
    ) -> Self {
        Self {
            dispatcher,
            scheduler,
            callbacks,
            delegates,
        }
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<PerpetualTaskScheduler> {
        &self.scheduler
    }

    // ========================================================================
    // Caller operations
    // ========================================================================

    pub async fn submit_task(&self, ctx: &RequestContext, task: NewTask) -> ServiceResult<SubmittedTask> {
        self.dispatcher
            .submit(ctx, task)
            .await
            .map_err(|e| ServiceError::wrap(DriverOperation::SubmitTask, e))
    }

    /// Serves both `CancelTask` and `CancelTaskV2`.
    pub async fn cancel_task(&self, ctx: &RequestContext, task_id: &str) -> ServiceResult<CancelOutcome> {
        self.dispatcher
            .cancel(ctx, task_id)
            .await
            .map_err(|e| ServiceError::wrap(DriverOperation::CancelTask, e))
    }

    pub async fn task_progress(&self, ctx: &RequestContext, task_id: &str) -> ServiceResult<ExecutionStage> {
        self.dispatcher
            .task_progress(ctx, task_id)
            .await
            .map_err(|e| ServiceError::wrap(DriverOperation::TaskProgress, e))
    }

    /// The streaming progress subscription has no implementation.
    #[instrument(skip(self, ctx), fields(account_id = %ctx.account_id()))]
    pub async fn task_progress_updates(
        &self,
        ctx: &RequestContext,
        task_id: &str,
    ) -> ServiceResult<ExecutionStage> {
        debug!("Progress subscription requested");
        Err(ServiceError::wrap(
            DriverOperation::TaskProgress,
            CoreError::NotImplemented {
                operation: "TaskProgressUpdates",
            },
        ))
    }

    pub async fn register_callback(&self, destination: CallbackDestination) -> ServiceResult<String> {
        self.callbacks
            .ensure_callback(destination)
            .await
            .map_err(|e| ServiceError::wrap(DriverOperation::RegisterCallback, e))
    }

    pub async fn create_perpetual_task(
        &self,
        ctx: &RequestContext,
        request: NewPerpetualTask,
    ) -> ServiceResult<String> {
        self.scheduler
            .create_task(ctx, request)
            .await
            .map_err(|e| ServiceError::wrap(DriverOperation::CreatePerpetualTask, e))
    }

    /// Resetting an unknown task succeeds.
    pub async fn reset_perpetual_task(
        &self,
        ctx: &RequestContext,
        perpetual_task_id: &str,
        execution_bundle: Option<Vec<u8>>,
    ) -> ServiceResult<()> {
        self.scheduler
            .reset_task(ctx, perpetual_task_id, execution_bundle)
            .await
            .map(|_| ())
            .map_err(|e| ServiceError::wrap(DriverOperation::ResetPerpetualTask, e))
    }

    /// Deleting an unknown task succeeds.
    pub async fn delete_perpetual_task(&self, ctx: &RequestContext, perpetual_task_id: &str) -> ServiceResult<()> {
        self.scheduler
            .delete_task(ctx, perpetual_task_id)
            .await
            .map(|_| ())
            .map_err(|e| ServiceError::wrap(DriverOperation::DeletePerpetualTask, e))
    }

    pub async fn send_task_progress_update(
        &self,
        ctx: &RequestContext,
        task_id: &str,
        callback_token: &str,
        payload: Vec<u8>,
    ) -> ServiceResult<ProgressDisposition> {
        self.callbacks
            .send_progress_update(ctx, task_id, callback_token, payload)
            .await
            .map_err(|e| ServiceError::wrap(DriverOperation::SendTaskProgressUpdate, e))
    }

    pub async fn queue_parked_task(&self, ctx: &RequestContext, task_id: &str) -> ServiceResult<bool> {
        self.dispatcher
            .queue_parked_task(ctx, task_id)
            .await
            .map_err(|e| ServiceError::wrap(DriverOperation::QueueParkedTask, e))
    }

    // ========================================================================
    // Read-side helpers (embedding callers)
    // ========================================================================

    pub async fn get_task(&self, ctx: &RequestContext, task_id: &str) -> Result<Option<DelegateTask>> {
        self.dispatcher.get_task(ctx, task_id).await
    }

    pub async fn get_perpetual_task(
        &self,
        ctx: &RequestContext,
        perpetual_task_id: &str,
    ) -> Result<Option<PerpetualTask>> {
        self.scheduler.get_task(ctx, perpetual_task_id).await
    }

    pub async fn list_progress(&self, ctx: &RequestContext, task_id: &str) -> Result<Vec<ProgressRecord>> {
        self.callbacks.list_progress(ctx, task_id).await
    }

    pub async fn pause_perpetual_task(&self, ctx: &RequestContext, perpetual_task_id: &str) -> Result<()> {
        self.scheduler.pause_task(ctx, perpetual_task_id).await
    }

    pub async fn resume_perpetual_task(&self, ctx: &RequestContext, perpetual_task_id: &str) -> Result<()> {
        self.scheduler.resume_task(ctx, perpetual_task_id).await
    }

    // ========================================================================
    // Agent operations
    // ========================================================================

    pub async fn register_delegate(
        &self,
        ctx: &RequestContext,
        registration: DelegateRegistration,
    ) -> Result<DelegateRecord> {
        self.delegates.register(ctx, registration).await
    }

    pub async fn delegate_heartbeat(&self, ctx: &RequestContext, delegate_id: &str) -> Result<bool> {
        self.delegates.heartbeat(ctx, delegate_id).await
    }

    /// Validated before any write; empty rule sets are rejected.
    pub async fn update_delegate_scoping_rules(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
        rules: ScopingRules,
    ) -> Result<()> {
        self.delegates.update_scoping_rules(ctx, delegate_id, rules).await
    }

    pub async fn poll_tasks(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
        limit: usize,
        wait: std::time::Duration,
    ) -> Result<Vec<DelegateTask>> {
        self.dispatcher.poll_tasks(ctx, delegate_id, limit, wait).await
    }

    pub async fn acquire_task(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
        task_id: &str,
    ) -> Result<Option<DelegateTask>> {
        self.dispatcher.acquire_task(ctx, delegate_id, task_id).await
    }

    pub async fn report_task_result(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
        task_id: &str,
        status: TaskStatus,
        result: Option<Vec<u8>>,
        error_message: Option<String>,
    ) -> Result<bool> {
        self.dispatcher
            .report_result(ctx, delegate_id, task_id, status, result, error_message)
            .await
    }

    pub async fn list_aborted_tasks(&self, ctx: &RequestContext, delegate_id: &str) -> Result<Vec<String>> {
        self.dispatcher.list_aborted_tasks(ctx, delegate_id).await
    }

    pub async fn list_perpetual_tasks(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
    ) -> Result<Vec<PerpetualTask>> {
        self.scheduler.list_assigned_tasks(ctx, delegate_id).await
    }

    pub async fn perpetual_task_heartbeat(
        &self,
        ctx: &RequestContext,
        perpetual_task_id: &str,
        delegate_id: &str,
    ) -> Result<bool> {
        self.scheduler.heartbeat(ctx, perpetual_task_id, delegate_id).await
    }
}
