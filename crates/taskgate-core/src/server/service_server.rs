// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delegate service QUIC server.
//!
//! Accepts connections from callers and routes `delegate_proto` messages to
//! the service handlers. Every failure leaves as `RpcResponse::Error` built
//! from a [`ServiceError`](crate::error::ServiceError).

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, instrument, warn};

use taskgate_protocol::delegate_proto::{
    RpcError, RpcRequest, RpcResponse, rpc_request::Request, rpc_response::Response,
};
use taskgate_protocol::server::{ConnectionHandler, StreamHandler};

use crate::service_handlers::{
    ServiceHandlerState, handle_cancel_task, handle_cancel_task_v2, handle_create_perpetual_task,
    handle_delete_perpetual_task, handle_queue_parked_task, handle_register_callback,
    handle_reset_perpetual_task, handle_send_task_progress_update, handle_submit_task,
    handle_task_progress, handle_task_progress_updates,
};

/// Shared state for the service server
pub type ServiceServerState = ServiceHandlerState;

/// Handle a single connection
#[instrument(skip(conn, state), fields(remote = %conn.remote_address()))]
pub async fn handle_connection(conn: ConnectionHandler, state: Arc<ServiceServerState>) {
    debug!("New service connection accepted");

    conn.run(move |stream: StreamHandler| {
        let state = state.clone();
        async move {
            if let Err(e) = handle_stream(stream, state).await {
                error!("Stream error: {}", e);
            }
        }
    })
    .await;

    debug!("Service connection closed");
}

/// Handle a single stream (request/response)
async fn handle_stream(mut stream: StreamHandler, state: Arc<ServiceServerState>) -> Result<()> {
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
pub async fn dispatch_request(state: &ServiceServerState, request: Request) -> Response {
    match request {
        Request::SubmitTask(req) => match handle_submit_task(state, req).await {
            Ok(resp) => Response::SubmitTask(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::CancelTask(req) => match handle_cancel_task(state, req).await {
            Ok(resp) => Response::CancelTask(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::CancelTaskV2(req) => match handle_cancel_task_v2(state, req).await {
            Ok(resp) => Response::CancelTaskV2(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::TaskProgress(req) => match handle_task_progress(state, req).await {
            Ok(resp) => Response::TaskProgress(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::TaskProgressUpdates(req) => match handle_task_progress_updates(state, req).await {
            Ok(resp) => Response::TaskProgressUpdates(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::RegisterCallback(req) => match handle_register_callback(state, req).await {
            Ok(resp) => Response::RegisterCallback(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::CreatePerpetualTask(req) => match handle_create_perpetual_task(state, req).await {
            Ok(resp) => Response::CreatePerpetualTask(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::ResetPerpetualTask(req) => match handle_reset_perpetual_task(state, req).await {
            Ok(resp) => Response::ResetPerpetualTask(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::DeletePerpetualTask(req) => match handle_delete_perpetual_task(state, req).await {
            Ok(resp) => Response::DeletePerpetualTask(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
        Request::SendTaskProgressUpdate(req) => {
            match handle_send_task_progress_update(state, req).await {
                Ok(resp) => Response::SendTaskProgressUpdate(resp),
                Err(e) => Response::Error(e.to_rpc_error()),
            }
        }
        Request::QueueParkedTask(req) => match handle_queue_parked_task(state, req).await {
            Ok(resp) => Response::QueueParkedTask(resp),
            Err(e) => Response::Error(e.to_rpc_error()),
        },
    }
}
