// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delegate service protocol handlers.
//!
//! Each handler decodes a `delegate_proto` request into engine types, calls
//! the [`DelegateService`] and encodes the response. Input that cannot be
//! decoded is an `InvalidRequest` for the handler's operation.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, instrument};

use taskgate_protocol::delegate_proto::{
    self as proto, CancelTaskRequest, CancelTaskResponse, CancelTaskV2Response,
    CreatePerpetualTaskRequest, CreatePerpetualTaskResponse, DeletePerpetualTaskRequest,
    DeletePerpetualTaskResponse, QueueParkedTaskRequest, QueueParkedTaskResponse,
    RegisterCallbackRequest, RegisterCallbackResponse, ResetPerpetualTaskRequest,
    ResetPerpetualTaskResponse, SendTaskProgressUpdateRequest, SendTaskProgressUpdateResponse,
    SubmitTaskRequest, SubmitTaskResponse, TaskExecutionStage, TaskProgressRequest,
    TaskProgressResponse, TaskProgressUpdatesRequest, TaskProgressUpdatesResponse,
    delegate_callback::Destination,
};

use crate::callback::CallbackDestination;
use crate::capability::Capability;
use crate::context::RequestContext;
use crate::error::{CoreError, DriverOperation, ServiceError};
use crate::perpetual::{NewPerpetualTask, PerpetualTaskSchedule};
use crate::service::DelegateService;
use crate::task::{ExecutionStage, NewTask, TaskMode, TaskSelector};

type HandlerResult<T> = std::result::Result<T, ServiceError>;

/// Shared state for delegate service handlers.
pub type ServiceHandlerState = DelegateService;

fn invalid(operation: DriverOperation, field: &str, message: &str) -> ServiceError {
    ServiceError::wrap(operation, CoreError::invalid(field, message))
}

fn context(operation: DriverOperation, envelope: Option<&proto::AccountId>) -> HandlerResult<RequestContext> {
    RequestContext::from_envelope(envelope).map_err(|e| ServiceError::wrap(operation, e))
}

fn required_id(operation: DriverOperation, field: &str, id: Option<String>) -> HandlerResult<String> {
    id.filter(|id| !id.trim().is_empty())
        .ok_or_else(|| invalid(operation, field, "id is required"))
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn stage_code(stage: ExecutionStage) -> i32 {
    TaskExecutionStage::from(stage) as i32
}

/// Decode the wire form of a submission.
pub fn decode_new_task(request: SubmitTaskRequest) -> Result<NewTask, CoreError> {
    let details = request
        .details
        .ok_or_else(|| CoreError::invalid("details", "task details are required"))?;

    let mode = match proto::TaskMode::try_from(details.mode) {
        Ok(proto::TaskMode::Sync) => TaskMode::Sync,
        Ok(_) => TaskMode::Async,
        Err(_) => {
            return Err(CoreError::invalid(
                "details.mode",
                format!("unknown task mode {}", details.mode),
            ));
        }
    };

    let capabilities = request
        .capabilities
        .iter()
        .map(|c| Capability::from_bytes(&c.payload))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::invalid("capabilities", e.to_string()))?;

    let selectors = request
        .selectors
        .into_iter()
        .map(|s| TaskSelector {
            selector: s.selector,
            origin: non_empty(s.origin),
        })
        .collect();

    Ok(NewTask {
        task_type: details.task_type,
        parameters: details.parameters,
        mode,
        parked: details.parked,
        timeout: Duration::from_millis(details.execution_timeout_ms),
        expression_functor_token: non_empty(details.expression_functor_token),
        setup_abstractions: request.setup_abstractions.into_iter().collect(),
        log_abstractions: request.log_abstractions.into_iter().collect(),
        capabilities,
        selectors,
        callback_token: request.callback_token.and_then(|t| non_empty(t.token)),
    })
}

// ============================================================================
// Tasks
// ============================================================================

#[instrument(skip(state, request))]
pub async fn handle_submit_task(
    state: &ServiceHandlerState,
    request: SubmitTaskRequest,
) -> HandlerResult<SubmitTaskResponse> {
    let op = DriverOperation::SubmitTask;
    let ctx = context(op, request.account_id.as_ref())?;
    let task = decode_new_task(request).map_err(|e| ServiceError::wrap(op, e))?;

    let submitted = state.submit_task(&ctx, task).await?;
    Ok(SubmitTaskResponse {
        task_id: Some(proto::TaskId {
            id: submitted.task_id,
        }),
        total_expiry_ms: submitted
            .expires_at
            .map(|t| t.timestamp_millis())
            .unwrap_or_default(),
        stage: stage_code(submitted.stage),
    })
}

#[instrument(skip(state, request))]
pub async fn handle_cancel_task(
    state: &ServiceHandlerState,
    request: CancelTaskRequest,
) -> HandlerResult<CancelTaskResponse> {
    let op = DriverOperation::CancelTask;
    let ctx = context(op, request.account_id.as_ref())?;
    let task_id = required_id(op, "task_id", request.task_id.map(|t| t.id))?;

    let outcome = state.cancel_task(&ctx, &task_id).await?;
    Ok(CancelTaskResponse {
        canceled_at_stage: stage_code(outcome.stage),
    })
}

#[instrument(skip(state, request))]
pub async fn handle_cancel_task_v2(
    state: &ServiceHandlerState,
    request: CancelTaskRequest,
) -> HandlerResult<CancelTaskV2Response> {
    let op = DriverOperation::CancelTask;
    let ctx = context(op, request.account_id.as_ref())?;
    let task_id = required_id(op, "task_id", request.task_id.map(|t| t.id))?;

    let outcome = state.cancel_task(&ctx, &task_id).await?;
    Ok(CancelTaskV2Response {
        canceled_at_stage: stage_code(outcome.stage),
        aborted: outcome.aborted,
    })
}

#[instrument(skip(state, request))]
pub async fn handle_task_progress(
    state: &ServiceHandlerState,
    request: TaskProgressRequest,
) -> HandlerResult<TaskProgressResponse> {
    let op = DriverOperation::TaskProgress;
    let ctx = context(op, request.account_id.as_ref())?;
    let task_id = required_id(op, "task_id", request.task_id.map(|t| t.id))?;

    let stage = state.task_progress(&ctx, &task_id).await?;
    Ok(TaskProgressResponse {
        current_stage: stage_code(stage),
    })
}

#[instrument(skip(state, request))]
pub async fn handle_task_progress_updates(
    state: &ServiceHandlerState,
    request: TaskProgressUpdatesRequest,
) -> HandlerResult<TaskProgressUpdatesResponse> {
    let op = DriverOperation::TaskProgress;
    let ctx = context(op, request.account_id.as_ref())?;
    let task_id = request.task_id.map(|t| t.id).unwrap_or_default();

    let stage = state.task_progress_updates(&ctx, &task_id).await?;
    Ok(TaskProgressUpdatesResponse {
        current_stage: stage_code(stage),
    })
}

#[instrument(skip(state, request))]
pub async fn handle_queue_parked_task(
    state: &ServiceHandlerState,
    request: QueueParkedTaskRequest,
) -> HandlerResult<QueueParkedTaskResponse> {
    let op = DriverOperation::QueueParkedTask;
    let ctx = context(op, request.account_id.as_ref())?;
    let task_id = required_id(op, "task_id", request.task_id.map(|t| t.id))?;

    let queued = state.queue_parked_task(&ctx, &task_id).await?;
    Ok(QueueParkedTaskResponse { queued })
}

// ============================================================================
// Callbacks and progress
// ============================================================================

#[instrument(skip(state, request))]
pub async fn handle_register_callback(
    state: &ServiceHandlerState,
    request: RegisterCallbackRequest,
) -> HandlerResult<RegisterCallbackResponse> {
    let op = DriverOperation::RegisterCallback;
    let destination = match request.callback.and_then(|c| c.destination) {
        Some(Destination::DataStore(ds)) => CallbackDestination::DataStore {
            connection: ds.connection,
            collection_prefix: ds.collection_prefix,
        },
        Some(Destination::Queue(q)) => CallbackDestination::Queue { topic: q.topic },
        None => return Err(invalid(op, "callback", "callback destination is required")),
    };

    let token = state.register_callback(destination).await?;
    Ok(RegisterCallbackResponse {
        callback_token: Some(proto::DelegateCallbackToken { token }),
    })
}

#[instrument(skip(state, request))]
pub async fn handle_send_task_progress_update(
    state: &ServiceHandlerState,
    request: SendTaskProgressUpdateRequest,
) -> HandlerResult<SendTaskProgressUpdateResponse> {
    let op = DriverOperation::SendTaskProgressUpdate;
    let ctx = context(op, request.account_id.as_ref())?;
    let task_id = required_id(op, "task_id", request.task_id.map(|t| t.id))?;
    let token = request.callback_token.map(|t| t.token).unwrap_or_default();

    let disposition = state
        .send_task_progress_update(&ctx, &task_id, &token, request.payload)
        .await?;
    debug!(?disposition, "Progress update handled");
    Ok(SendTaskProgressUpdateResponse {
        accepted: disposition.accepted(),
    })
}

// ============================================================================
// Perpetual tasks
// ============================================================================

#[instrument(skip(state, request), fields(task_type = %request.task_type))]
pub async fn handle_create_perpetual_task(
    state: &ServiceHandlerState,
    request: CreatePerpetualTaskRequest,
) -> HandlerResult<CreatePerpetualTaskResponse> {
    let op = DriverOperation::CreatePerpetualTask;
    let ctx = context(op, request.account_id.as_ref())?;
    let schedule = request.schedule.unwrap_or_default();

    let new_task = NewPerpetualTask {
        task_type: request.task_type,
        client_context: request
            .client_context
            .map(|c| c.parameters.into_iter().collect::<BTreeMap<_, _>>()),
        execution_bundle: (!request.execution_bundle.is_empty()).then_some(request.execution_bundle),
        schedule: PerpetualTaskSchedule {
            interval: Duration::from_millis(schedule.interval_ms),
            timeout: Duration::from_millis(schedule.timeout_ms),
        },
        allow_stale_task_id: request.allow_stale_task_id,
        description: request.description,
    };

    let id = state.create_perpetual_task(&ctx, new_task).await?;
    Ok(CreatePerpetualTaskResponse {
        perpetual_task_id: Some(proto::PerpetualTaskId { id }),
    })
}

#[instrument(skip(state, request))]
pub async fn handle_reset_perpetual_task(
    state: &ServiceHandlerState,
    request: ResetPerpetualTaskRequest,
) -> HandlerResult<ResetPerpetualTaskResponse> {
    let op = DriverOperation::ResetPerpetualTask;
    let ctx = context(op, request.account_id.as_ref())?;
    let id = required_id(op, "perpetual_task_id", request.perpetual_task_id.map(|t| t.id))?;
    let bundle = (!request.execution_bundle.is_empty()).then_some(request.execution_bundle);

    state.reset_perpetual_task(&ctx, &id, bundle).await?;
    Ok(ResetPerpetualTaskResponse {})
}

#[instrument(skip(state, request))]
pub async fn handle_delete_perpetual_task(
    state: &ServiceHandlerState,
    request: DeletePerpetualTaskRequest,
) -> HandlerResult<DeletePerpetualTaskResponse> {
    let op = DriverOperation::DeletePerpetualTask;
    let ctx = context(op, request.account_id.as_ref())?;
    let id = required_id(op, "perpetual_task_id", request.perpetual_task_id.map(|t| t.id))?;

    state.delete_perpetual_task(&ctx, &id).await?;
    Ok(DeletePerpetualTaskResponse {})
}
