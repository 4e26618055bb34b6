// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent protocol (delegates -> taskgate-core).
//!
//! Delegates register their runtime facts, heartbeat, pull work and report
//! results over this protocol.

use std::collections::HashMap;

pub use crate::delegate_proto::{AccountId, RpcError};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDelegateRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub delegate_id: String,
    #[prost(string, tag = "3")]
    pub host_name: String,
    #[prost(string, repeated, tag = "4")]
    pub tags: Vec<String>,
    #[prost(map = "string, string", tag = "5")]
    pub env: HashMap<String, String>,
    #[prost(map = "string, string", tag = "6")]
    pub system_properties: HashMap<String, String>,
    /// Host patterns the delegate can reach (`*`, `*.example.com`, `api.example.com`).
    #[prost(string, repeated, tag = "7")]
    pub reachable_hosts: Vec<String>,
    /// `host:port` endpoints the delegate can open sockets to.
    #[prost(string, repeated, tag = "8")]
    pub reachable_sockets: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDelegateResponse {
    #[prost(int64, tag = "1")]
    pub registered_at_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DelegateHeartbeatRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub delegate_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DelegateHeartbeatResponse {
    /// False when the delegate is unknown and must register again.
    #[prost(bool, tag = "1")]
    pub known: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScopingRule {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, repeated, tag = "2")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateScopingRulesRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub delegate_id: String,
    #[prost(message, repeated, tag = "3")]
    pub rules: Vec<ScopingRule>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateScopingRulesResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollTasksRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub delegate_id: String,
    #[prost(uint32, tag = "3")]
    pub max_tasks: u32,
    /// Long-poll budget. Zero returns immediately.
    #[prost(uint64, tag = "4")]
    pub wait_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueuedTask {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub task_type: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollTasksResponse {
    #[prost(message, repeated, tag = "1")]
    pub tasks: Vec<QueuedTask>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcquireTaskRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub delegate_id: String,
    #[prost(string, tag = "3")]
    pub task_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskPackage {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub task_type: String,
    #[prost(bytes = "vec", tag = "3")]
    pub parameters: Vec<u8>,
    #[prost(string, tag = "4")]
    pub expression_functor_token: String,
    #[prost(map = "string, string", tag = "5")]
    pub log_abstractions: HashMap<String, String>,
    #[prost(int64, tag = "6")]
    pub expires_at_ms: i64,
    #[prost(string, tag = "7")]
    pub callback_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AcquireTaskResponse {
    /// Absent when another delegate won the assignment or the task is no longer queued.
    #[prost(message, optional, tag = "1")]
    pub task: Option<TaskPackage>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskResultStatus {
    Unspecified = 0,
    Success = 1,
    Error = 2,
    Failed = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportTaskResultRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub delegate_id: String,
    #[prost(string, tag = "3")]
    pub task_id: String,
    #[prost(enumeration = "TaskResultStatus", tag = "4")]
    pub status: i32,
    #[prost(bytes = "vec", tag = "5")]
    pub result: Vec<u8>,
    #[prost(string, tag = "6")]
    pub error_message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportTaskResultResponse {
    /// False when the task had already reached a terminal state.
    #[prost(bool, tag = "1")]
    pub applied: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListAbortedTasksRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub delegate_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListAbortedTasksResponse {
    #[prost(string, repeated, tag = "1")]
    pub task_ids: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListPerpetualTasksRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub delegate_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssignedPerpetualTask {
    #[prost(string, tag = "1")]
    pub perpetual_task_id: String,
    #[prost(string, tag = "2")]
    pub task_type: String,
    #[prost(uint64, tag = "3")]
    pub interval_ms: u64,
    #[prost(uint64, tag = "4")]
    pub timeout_ms: u64,
    #[prost(map = "string, string", tag = "5")]
    pub client_parameters: HashMap<String, String>,
    #[prost(bytes = "vec", tag = "6")]
    pub execution_bundle: Vec<u8>,
    #[prost(int64, tag = "7")]
    pub context_updated_at_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListPerpetualTasksResponse {
    #[prost(message, repeated, tag = "1")]
    pub tasks: Vec<AssignedPerpetualTask>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PerpetualTaskHeartbeatRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub delegate_id: String,
    #[prost(string, tag = "3")]
    pub perpetual_task_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PerpetualTaskHeartbeatResponse {
    /// False when the task is no longer assigned to the reporting delegate.
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9")]
    pub request: Option<rpc_request::Request>,
}

pub mod rpc_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        RegisterDelegate(super::RegisterDelegateRequest),
        #[prost(message, tag = "2")]
        Heartbeat(super::DelegateHeartbeatRequest),
        #[prost(message, tag = "3")]
        UpdateScopingRules(super::UpdateScopingRulesRequest),
        #[prost(message, tag = "4")]
        PollTasks(super::PollTasksRequest),
        #[prost(message, tag = "5")]
        AcquireTask(super::AcquireTaskRequest),
        #[prost(message, tag = "6")]
        ReportTaskResult(super::ReportTaskResultRequest),
        #[prost(message, tag = "7")]
        ListAbortedTasks(super::ListAbortedTasksRequest),
        #[prost(message, tag = "8")]
        ListPerpetualTasks(super::ListPerpetualTasksRequest),
        #[prost(message, tag = "9")]
        PerpetualTaskHeartbeat(super::PerpetualTaskHeartbeatRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 15")]
    pub response: Option<rpc_response::Response>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        RegisterDelegate(super::RegisterDelegateResponse),
        #[prost(message, tag = "2")]
        Heartbeat(super::DelegateHeartbeatResponse),
        #[prost(message, tag = "3")]
        UpdateScopingRules(super::UpdateScopingRulesResponse),
        #[prost(message, tag = "4")]
        PollTasks(super::PollTasksResponse),
        #[prost(message, tag = "5")]
        AcquireTask(super::AcquireTaskResponse),
        #[prost(message, tag = "6")]
        ReportTaskResult(super::ReportTaskResultResponse),
        #[prost(message, tag = "7")]
        ListAbortedTasks(super::ListAbortedTasksResponse),
        #[prost(message, tag = "8")]
        ListPerpetualTasks(super::ListPerpetualTasksResponse),
        #[prost(message, tag = "9")]
        PerpetualTaskHeartbeat(super::PerpetualTaskHeartbeatResponse),
        #[prost(message, tag = "15")]
        Error(super::RpcError),
    }
}
