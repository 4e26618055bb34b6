// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent QUIC server for taskgate-core.
//!
//! Accepts connections from delegates and routes `agent_proto` messages to
//! the agent handlers.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, instrument, warn};

use taskgate_protocol::agent_proto::{
    RpcError, RpcRequest, RpcResponse, rpc_request::Request, rpc_response::Response,
};
use taskgate_protocol::server::{ConnectionHandler, StreamHandler};

use crate::agent_handlers::{
    AgentHandlerState, handle_acquire_task, handle_heartbeat, handle_list_aborted_tasks,
    handle_list_perpetual_tasks, handle_perpetual_task_heartbeat, handle_poll_tasks,
    handle_register_delegate, handle_report_task_result, handle_update_scoping_rules,
};

/// Shared state for the agent server
pub type AgentServerState = AgentHandlerState;

/// Handle a single connection
#[instrument(skip(conn, state), fields(remote = %conn.remote_address()))]
pub async fn handle_connection(conn: ConnectionHandler, state: Arc<AgentServerState>) {
    info!("New delegate connection accepted");

    conn.run(move |stream: StreamHandler| {
        let state = state.clone();
        async move {
            if let Err(e) = handle_stream(stream, state).await {
                error!("Stream error: {}", e);
            }
        }
    })
    .await;

    debug!("Delegate connection closed");
}

/// Handle a single stream (request/response)
async fn handle_stream(mut stream: StreamHandler, state: Arc<AgentServerState>) -> Result<()> {
    let request_frame = stream.read_frame().await?;
    let rpc_request: RpcRequest = request_frame.decode()?;

    let Some(request) = rpc_request.request else {
        warn!("Received empty RpcRequest");
        let response = RpcResponse {
            response: Some(Response::Error(RpcError {
                code: "EMPTY_REQUEST".to_string(),
                message: "RpcRequest contained no request".to_string(),
            })),
        };
        stream.respond(&response).await?;
        return Ok(());
    };

    let response = dispatch_request(&state, request).await;
    stream.respond(&RpcResponse {
        response: Some(response),
    })
    .await?;

    Ok(())
}

/// Route one request to its handler.
pub async fn dispatch_request(state: &AgentServerState, request: Request) -> Response {
    match request {
        Request::RegisterDelegate(req) => match handle_register_delegate(state, req).await {
            Ok(resp) => Response::RegisterDelegate(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::Heartbeat(req) => match handle_heartbeat(state, req).await {
            Ok(resp) => Response::Heartbeat(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::UpdateScopingRules(req) => match handle_update_scoping_rules(state, req).await {
            Ok(resp) => Response::UpdateScopingRules(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::PollTasks(req) => match handle_poll_tasks(state, req).await {
            Ok(resp) => Response::PollTasks(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::AcquireTask(req) => match handle_acquire_task(state, req).await {
            Ok(resp) => Response::AcquireTask(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::ReportTaskResult(req) => match handle_report_task_result(state, req).await {
            Ok(resp) => Response::ReportTaskResult(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::ListAbortedTasks(req) => match handle_list_aborted_tasks(state, req).await {
            Ok(resp) => Response::ListAbortedTasks(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::ListPerpetualTasks(req) => match handle_list_perpetual_tasks(state, req).await {
            Ok(resp) => Response::ListPerpetualTasks(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::PerpetualTaskHeartbeat(req) => {
            match handle_perpetual_task_heartbeat(state, req).await {
                Ok(resp) => Response::PerpetualTaskHeartbeat(resp),
                Err(e) => Response::Error(e.to_rpc_error()),
            }
        }
    }
}
