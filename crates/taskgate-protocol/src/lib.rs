// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Taskgate Protocol - QUIC + Protobuf communication layer
//!
//! Two protocols share one transport:
//!
//! - **Delegate service** (`delegate_proto`): callers submit, cancel and
//!   inspect tasks, register result callbacks and manage perpetual tasks.
//! - **Agent** (`agent_proto`): delegates register their runtime facts,
//!   heartbeat, pull and acquire work, and report results.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    taskgate-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: RpcRequest/RpcResponse oneof per protocol       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn), one bidi stream per call          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use taskgate_protocol::{TaskgateClient, delegate_proto as proto};
//!
//! let client = TaskgateClient::localhost("127.0.0.1:9001".parse()?)?;
//! let request = proto::RpcRequest {
//!     request: Some(proto::rpc_request::Request::TaskProgress(proto::TaskProgressRequest {
//!         account_id: Some(proto::AccountId { id: "acct".into() }),
//!         task_id: Some(proto::TaskId { id: task_id }),
//!     })),
//! };
//! let response: proto::RpcResponse = client.request(&request).await?;
//! ```

pub mod agent_proto;
pub mod client;
pub mod delegate_proto;
pub mod frame;
pub mod server;

pub use client::{ClientError, TaskgateClient, TaskgateClientConfig};
pub use frame::{Frame, FrameError, FrameKind};
pub use server::{
    ConnectionHandler, ServerError, StreamHandler, TaskgateServer, TaskgateServerConfig,
};
