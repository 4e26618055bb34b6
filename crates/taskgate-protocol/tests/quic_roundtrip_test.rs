// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client/server tests over a real QUIC endpoint on localhost.

use std::net::SocketAddr;
use std::sync::Arc;

use taskgate_protocol::delegate_proto::{
    AccountId, TaskExecutionStage, TaskId, TaskProgressRequest, TaskProgressResponse,
};
use taskgate_protocol::{
    ClientError, ConnectionHandler, FrameError, StreamHandler, TaskgateClient,
    TaskgateClientConfig, TaskgateServer,
};

/// Answers progress requests for "task-1" and rejects everything else.
async fn serve_stream(mut stream: StreamHandler) {
    let frame = match stream.read_frame().await {
        Ok(frame) => frame,
        Err(_) => return,
    };
    let request: TaskProgressRequest = match frame.decode() {
        Ok(req) => req,
        Err(_) => {
            let _ = stream.reject("BAD_REQUEST", "undecodable").await;
            return;
        }
    };

    let known = request.task_id.as_ref().is_some_and(|t| t.id == "task-1");
    if known {
        let _ = stream
            .respond(&TaskProgressResponse {
                current_stage: TaskExecutionStage::Executing as i32,
            })
            .await;
    } else {
        let _ = stream.reject("UNKNOWN_TASK", "no such task").await;
    }
}

async fn start_server() -> (Arc<TaskgateServer>, SocketAddr) {
    let server = Arc::new(
        TaskgateServer::localhost(SocketAddr::from(([127, 0, 0, 1], 0)))
            .expect("server should bind"),
    );
    let addr = server.local_addr().expect("bound address");

    let acceptor = server.clone();
    tokio::spawn(async move {
        while let Some(incoming) = acceptor.accept().await {
            tokio::spawn(async move {
                if let Ok(connection) = incoming.await {
                    ConnectionHandler::new(connection)
                        .run(|stream: StreamHandler| serve_stream(stream))
                        .await;
                }
            });
        }
    });

    (server, addr)
}

fn progress_request(task_id: &str) -> TaskProgressRequest {
    TaskProgressRequest {
        account_id: Some(AccountId {
            id: "acct-1".to_string(),
        }),
        task_id: Some(TaskId {
            id: task_id.to_string(),
        }),
    }
}

#[tokio::test]
async fn test_request_response_over_quic() {
    let (server, addr) = start_server().await;
    let client = TaskgateClient::localhost(addr).unwrap();

    let response: TaskProgressResponse = client.request(&progress_request("task-1")).await.unwrap();
    assert_eq!(response.current_stage, TaskExecutionStage::Executing as i32);
    assert!(client.is_connected().await);

    // Second call reuses the connection on a new stream.
    let again: TaskProgressResponse = client.request(&progress_request("task-1")).await.unwrap();
    assert_eq!(again, response);

    client.close().await;
    server.close();
}

#[tokio::test]
async fn test_error_frame_surfaces_as_remote_error() {
    let (server, addr) = start_server().await;
    let client = TaskgateClient::localhost(addr).unwrap();

    let err = client
        .request::<_, TaskProgressResponse>(&progress_request("missing"))
        .await
        .unwrap_err();

    match err {
        ClientError::Frame(FrameError::Remote { code, .. }) => assert_eq!(code, "UNKNOWN_TASK"),
        other => panic!("unexpected error: {other}"),
    }

    server.close();
}

#[tokio::test]
async fn test_client_not_connected_before_first_call() {
    let client = TaskgateClient::localhost(SocketAddr::from(([127, 0, 0, 1], 9))).unwrap();
    assert!(!client.is_connected().await);
    client.close().await;
}

#[test]
fn test_default_client_config() {
    let config = TaskgateClientConfig::default();
    assert_eq!(config.server_addr, SocketAddr::from(([127, 0, 0, 1], 9001)));
    assert_eq!(config.idle_timeout_ms, 120_000);
}

#[tokio::test]
async fn test_closed_server_ends_accept() {
    let server = TaskgateServer::localhost(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
    server.close();
    assert!(server.accept().await.is_none());
}
