// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent protocol handlers.
//!
//! These handlers process requests from delegates: registration, heartbeats,
//! task pickup and results, and perpetual task assignment.

use std::time::Duration;

use tracing::{debug, instrument};

use taskgate_protocol::agent_proto::{
    AcquireTaskRequest, AcquireTaskResponse, AssignedPerpetualTask, DelegateHeartbeatRequest,
    DelegateHeartbeatResponse, ListAbortedTasksRequest, ListAbortedTasksResponse,
    ListPerpetualTasksRequest, ListPerpetualTasksResponse, PerpetualTaskHeartbeatRequest,
    PerpetualTaskHeartbeatResponse, PollTasksRequest, PollTasksResponse, QueuedTask,
    RegisterDelegateRequest, RegisterDelegateResponse, ReportTaskResultRequest,
    ReportTaskResultResponse, TaskPackage, TaskResultStatus, UpdateScopingRulesRequest,
    UpdateScopingRulesResponse,
};

use crate::capability::{DelegateFacts, ScopingRules};
use crate::context::RequestContext;
use crate::delegate::DelegateRegistration;
use crate::error::{CoreError, Result};
use crate::perpetual::{PerpetualTask, PerpetualTaskContext};
use crate::service::DelegateService;
use crate::task::{DelegateTask, TaskStatus};

/// Shared state for agent handlers.
pub type AgentHandlerState = DelegateService;

/// Poll size when the delegate does not ask for one.
const DEFAULT_POLL_SIZE: usize = 10;
const MAX_POLL_SIZE: usize = 100;
/// Upper bound of a long-poll.
const MAX_POLL_WAIT: Duration = Duration::from_secs(30);

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Wire form of a task handed to its delegate.
pub fn task_package(task: DelegateTask) -> TaskPackage {
    TaskPackage {
        task_id: task.task_id,
        task_type: task.task_type,
        parameters: task.parameters,
        expression_functor_token: task.expression_functor_token.unwrap_or_default(),
        log_abstractions: task.log_abstractions.into_iter().collect(),
        expires_at_ms: task.expires_at.map(|t| t.timestamp_millis()).unwrap_or_default(),
        callback_token: task.callback_token.unwrap_or_default(),
    }
}

/// Wire form of an assigned perpetual task.
pub fn assigned_perpetual_task(task: PerpetualTask) -> Result<AssignedPerpetualTask> {
    let (client_parameters, execution_bundle) = match task.context {
        PerpetualTaskContext::ClientContext { parameters } => (parameters.into_iter().collect(), Vec::new()),
        PerpetualTaskContext::ExecutionBundle { bundle } => (Default::default(), bundle.to_bytes()?),
    };
    Ok(AssignedPerpetualTask {
        perpetual_task_id: task.id,
        task_type: task.task_type,
        interval_ms: millis(task.schedule.interval),
        timeout_ms: millis(task.schedule.timeout),
        client_parameters,
        execution_bundle,
        context_updated_at_ms: task.context_updated_at.timestamp_millis(),
    })
}

fn result_status(code: i32) -> Result<TaskStatus> {
    match TaskResultStatus::try_from(code) {
        Ok(TaskResultStatus::Success) => Ok(TaskStatus::Success),
        Ok(TaskResultStatus::Error) => Ok(TaskStatus::Error),
        Ok(TaskResultStatus::Failed) => Ok(TaskStatus::Failed),
        _ => Err(CoreError::invalid(
            "status",
            format!("unsupported result status {}", code),
        )),
    }
}

// ============================================================================
// Delegates
// ============================================================================

#[instrument(skip(state, request), fields(delegate_id = %request.delegate_id))]
pub async fn handle_register_delegate(
    state: &AgentHandlerState,
    request: RegisterDelegateRequest,
) -> Result<RegisterDelegateResponse> {
    let ctx = RequestContext::from_envelope(request.account_id.as_ref())?;
    let registration = DelegateRegistration {
        delegate_id: request.delegate_id,
        host_name: request.host_name,
        facts: DelegateFacts {
            tags: request.tags.into_iter().collect(),
            env: request.env.into_iter().collect(),
            system_properties: request.system_properties.into_iter().collect(),
            reachable_hosts: request.reachable_hosts,
            reachable_sockets: request.reachable_sockets,
        },
    };

    let record = state.register_delegate(&ctx, registration).await?;
    Ok(RegisterDelegateResponse {
        registered_at_ms: record.registered_at.timestamp_millis(),
    })
}

#[instrument(skip(state, request), fields(delegate_id = %request.delegate_id))]
pub async fn handle_heartbeat(
    state: &AgentHandlerState,
    request: DelegateHeartbeatRequest,
) -> Result<DelegateHeartbeatResponse> {
    let ctx = RequestContext::from_envelope(request.account_id.as_ref())?;
    let known = state.delegate_heartbeat(&ctx, &request.delegate_id).await?;
    Ok(DelegateHeartbeatResponse { known })
}

#[instrument(skip(state, request), fields(delegate_id = %request.delegate_id))]
pub async fn handle_update_scoping_rules(
    state: &AgentHandlerState,
    request: UpdateScopingRulesRequest,
) -> Result<UpdateScopingRulesResponse> {
    let ctx = RequestContext::from_envelope(request.account_id.as_ref())?;
    let mut rules = ScopingRules::new();
    for rule in request.rules {
        rules.entry(rule.key).or_default().extend(rule.values);
    }

    state
        .update_delegate_scoping_rules(&ctx, &request.delegate_id, rules)
        .await?;
    Ok(UpdateScopingRulesResponse {})
}

// ============================================================================
// Tasks
// ============================================================================

#[instrument(skip(state, request), fields(delegate_id = %request.delegate_id))]
pub async fn handle_poll_tasks(
    state: &AgentHandlerState,
    request: PollTasksRequest,
) -> Result<PollTasksResponse> {
    let ctx = RequestContext::from_envelope(request.account_id.as_ref())?;
    let limit = match request.max_tasks {
        0 => DEFAULT_POLL_SIZE,
        n => (n as usize).min(MAX_POLL_SIZE),
    };
    let wait = Duration::from_millis(request.wait_ms).min(MAX_POLL_WAIT);

    let tasks = state
        .poll_tasks(&ctx, &request.delegate_id, limit, wait)
        .await?;
    Ok(PollTasksResponse {
        tasks: tasks
            .into_iter()
            .map(|t| QueuedTask {
                task_id: t.task_id,
                task_type: t.task_type,
            })
            .collect(),
    })
}

#[instrument(skip(state, request), fields(delegate_id = %request.delegate_id, task_id = %request.task_id))]
pub async fn handle_acquire_task(
    state: &AgentHandlerState,
    request: AcquireTaskRequest,
) -> Result<AcquireTaskResponse> {
    let ctx = RequestContext::from_envelope(request.account_id.as_ref())?;
    let task = state
        .acquire_task(&ctx, &request.delegate_id, &request.task_id)
        .await?;
    if task.is_none() {
        debug!("Task not acquired");
    }
    Ok(AcquireTaskResponse {
        task: task.map(task_package),
    })
}

#[instrument(skip(state, request), fields(delegate_id = %request.delegate_id, task_id = %request.task_id))]
pub async fn handle_report_task_result(
    state: &AgentHandlerState,
    request: ReportTaskResultRequest,
) -> Result<ReportTaskResultResponse> {
    let ctx = RequestContext::from_envelope(request.account_id.as_ref())?;
    let status = result_status(request.status)?;
    let result = (!request.result.is_empty()).then_some(request.result);
    let error_message = (!request.error_message.is_empty()).then_some(request.error_message);

    let applied = state
        .report_task_result(
            &ctx,
            &request.delegate_id,
            &request.task_id,
            status,
            result,
            error_message,
        )
        .await?;
    Ok(ReportTaskResultResponse { applied })
}

#[instrument(skip(state, request), fields(delegate_id = %request.delegate_id))]
pub async fn handle_list_aborted_tasks(
    state: &AgentHandlerState,
    request: ListAbortedTasksRequest,
) -> Result<ListAbortedTasksResponse> {
    let ctx = RequestContext::from_envelope(request.account_id.as_ref())?;
    let task_ids = state.list_aborted_tasks(&ctx, &request.delegate_id).await?;
    Ok(ListAbortedTasksResponse { task_ids })
}

// ============================================================================
// Perpetual tasks
// ============================================================================

#[instrument(skip(state, request), fields(delegate_id = %request.delegate_id))]
pub async fn handle_list_perpetual_tasks(
    state: &AgentHandlerState,
    request: ListPerpetualTasksRequest,
) -> Result<ListPerpetualTasksResponse> {
    let ctx = RequestContext::from_envelope(request.account_id.as_ref())?;
    let tasks = state
        .list_perpetual_tasks(&ctx, &request.delegate_id)
        .await?
        .into_iter()
        .map(assigned_perpetual_task)
        .collect::<Result<Vec<_>>>()?;
    Ok(ListPerpetualTasksResponse { tasks })
}

#[instrument(skip(state, request), fields(delegate_id = %request.delegate_id, perpetual_task_id = %request.perpetual_task_id))]
pub async fn handle_perpetual_task_heartbeat(
    state: &AgentHandlerState,
    request: PerpetualTaskHeartbeatRequest,
) -> Result<PerpetualTaskHeartbeatResponse> {
    let ctx = RequestContext::from_envelope(request.account_id.as_ref())?;
    let accepted = state
        .perpetual_task_heartbeat(&ctx, &request.perpetual_task_id, &request.delegate_id)
        .await?;
    Ok(PerpetualTaskHeartbeatResponse { accepted })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_status_mapping() {
        assert_eq!(result_status(TaskResultStatus::Success as i32).unwrap(), TaskStatus::Success);
        assert_eq!(result_status(TaskResultStatus::Failed as i32).unwrap(), TaskStatus::Failed);
        assert!(result_status(TaskResultStatus::Unspecified as i32).is_err());
        assert!(result_status(42).is_err());
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(2)), 2_000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
