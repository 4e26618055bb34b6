// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delegate service protocol (callers -> taskgate-core).
//!
//! Message numbering is part of the wire contract. New fields get new tags;
//! tags are never reused.

use std::collections::HashMap;

/// Account scoping envelope carried by every request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AccountId {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskId {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PerpetualTaskId {
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Serialized capability requirement. The payload encoding is owned by the core.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Capability {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskSelector {
    #[prost(string, tag = "1")]
    pub selector: String,
    #[prost(string, tag = "2")]
    pub origin: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskMode {
    TypeUnspecified = 0,
    Sync = 1,
    Async = 2,
}

/// Coarse-grained view of a task's lifecycle reported to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskExecutionStage {
    TypeUnspecified = 0,
    Queueing = 1,
    Validating = 2,
    Executing = 3,
    Finished = 4,
    Aborted = 5,
    Expired = 6,
    Failed = 7,
    Parked = 8,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskDetails {
    #[prost(string, tag = "1")]
    pub task_type: String,
    /// Opaque task parameters.
    #[prost(bytes = "vec", tag = "2")]
    pub parameters: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub execution_timeout_ms: u64,
    #[prost(string, tag = "4")]
    pub expression_functor_token: String,
    #[prost(enumeration = "TaskMode", tag = "5")]
    pub mode: i32,
    #[prost(bool, tag = "6")]
    pub parked: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitTaskRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(map = "string, string", tag = "2")]
    pub setup_abstractions: HashMap<String, String>,
    #[prost(map = "string, string", tag = "3")]
    pub log_abstractions: HashMap<String, String>,
    #[prost(message, optional, tag = "4")]
    pub details: Option<TaskDetails>,
    #[prost(message, repeated, tag = "5")]
    pub capabilities: Vec<Capability>,
    #[prost(message, repeated, tag = "6")]
    pub selectors: Vec<TaskSelector>,
    /// Optional callback token obtained from `RegisterCallback`.
    #[prost(message, optional, tag = "7")]
    pub callback_token: Option<DelegateCallbackToken>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitTaskResponse {
    #[prost(message, optional, tag = "1")]
    pub task_id: Option<TaskId>,
    /// Queue expiry as unix epoch milliseconds.
    #[prost(int64, tag = "2")]
    pub total_expiry_ms: i64,
    /// Stage observed when the call returned. For SYNC tasks this is the
    /// stage after the bounded wait.
    #[prost(enumeration = "TaskExecutionStage", tag = "3")]
    pub stage: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelTaskRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(message, optional, tag = "2")]
    pub task_id: Option<TaskId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelTaskResponse {
    #[prost(enumeration = "TaskExecutionStage", tag = "1")]
    pub canceled_at_stage: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelTaskV2Response {
    #[prost(enumeration = "TaskExecutionStage", tag = "1")]
    pub canceled_at_stage: i32,
    /// True when this call moved the task to ABORTED.
    #[prost(bool, tag = "2")]
    pub aborted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskProgressRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(message, optional, tag = "2")]
    pub task_id: Option<TaskId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskProgressResponse {
    #[prost(enumeration = "TaskExecutionStage", tag = "1")]
    pub current_stage: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskProgressUpdatesRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(message, optional, tag = "2")]
    pub task_id: Option<TaskId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskProgressUpdatesResponse {
    #[prost(enumeration = "TaskExecutionStage", tag = "1")]
    pub current_stage: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataStoreCallback {
    #[prost(string, tag = "1")]
    pub connection: String,
    #[prost(string, tag = "2")]
    pub collection_prefix: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueueCallback {
    #[prost(string, tag = "1")]
    pub topic: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DelegateCallback {
    #[prost(oneof = "delegate_callback::Destination", tags = "1, 2")]
    pub destination: Option<delegate_callback::Destination>,
}

pub mod delegate_callback {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Destination {
        #[prost(message, tag = "1")]
        DataStore(super::DataStoreCallback),
        #[prost(message, tag = "2")]
        Queue(super::QueueCallback),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DelegateCallbackToken {
    #[prost(string, tag = "1")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterCallbackRequest {
    #[prost(message, optional, tag = "1")]
    pub callback: Option<DelegateCallback>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterCallbackResponse {
    #[prost(message, optional, tag = "1")]
    pub callback_token: Option<DelegateCallbackToken>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendTaskProgressUpdateRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(message, optional, tag = "2")]
    pub task_id: Option<TaskId>,
    #[prost(message, optional, tag = "3")]
    pub callback_token: Option<DelegateCallbackToken>,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendTaskProgressUpdateResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PerpetualTaskSchedule {
    #[prost(uint64, tag = "1")]
    pub interval_ms: u64,
    #[prost(uint64, tag = "2")]
    pub timeout_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PerpetualTaskClientContext {
    #[prost(map = "string, string", tag = "1")]
    pub parameters: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatePerpetualTaskRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(string, tag = "2")]
    pub task_type: String,
    #[prost(message, optional, tag = "3")]
    pub schedule: Option<PerpetualTaskSchedule>,
    /// Plain key/value context. Mutually exclusive with `execution_bundle`.
    #[prost(message, optional, tag = "4")]
    pub client_context: Option<PerpetualTaskClientContext>,
    /// Serialized execution bundle. Mutually exclusive with `client_context`.
    #[prost(bytes = "vec", tag = "5")]
    pub execution_bundle: Vec<u8>,
    #[prost(bool, tag = "6")]
    pub allow_stale_task_id: bool,
    #[prost(string, tag = "7")]
    pub description: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatePerpetualTaskResponse {
    #[prost(message, optional, tag = "1")]
    pub perpetual_task_id: Option<PerpetualTaskId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResetPerpetualTaskRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(message, optional, tag = "2")]
    pub perpetual_task_id: Option<PerpetualTaskId>,
    #[prost(bytes = "vec", tag = "3")]
    pub execution_bundle: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResetPerpetualTaskResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeletePerpetualTaskRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(message, optional, tag = "2")]
    pub perpetual_task_id: Option<PerpetualTaskId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeletePerpetualTaskResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueueParkedTaskRequest {
    #[prost(message, optional, tag = "1")]
    pub account_id: Option<AccountId>,
    #[prost(message, optional, tag = "2")]
    pub task_id: Option<TaskId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueueParkedTaskResponse {
    /// False when the task was not parked (already queued, running or finished).
    #[prost(bool, tag = "1")]
    pub queued: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub request: Option<rpc_request::Request>,
}

pub mod rpc_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        SubmitTask(super::SubmitTaskRequest),
        #[prost(message, tag = "2")]
        CancelTask(super::CancelTaskRequest),
        #[prost(message, tag = "3")]
        CancelTaskV2(super::CancelTaskRequest),
        #[prost(message, tag = "4")]
        TaskProgress(super::TaskProgressRequest),
        #[prost(message, tag = "5")]
        TaskProgressUpdates(super::TaskProgressUpdatesRequest),
        #[prost(message, tag = "6")]
        RegisterCallback(super::RegisterCallbackRequest),
        #[prost(message, tag = "7")]
        CreatePerpetualTask(super::CreatePerpetualTaskRequest),
        #[prost(message, tag = "8")]
        ResetPerpetualTask(super::ResetPerpetualTaskRequest),
        #[prost(message, tag = "9")]
        DeletePerpetualTask(super::DeletePerpetualTaskRequest),
        #[prost(message, tag = "10")]
        SendTaskProgressUpdate(super::SendTaskProgressUpdateRequest),
        #[prost(message, tag = "11")]
        QueueParkedTask(super::QueueParkedTaskRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 15")]
    pub response: Option<rpc_response::Response>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        SubmitTask(super::SubmitTaskResponse),
        #[prost(message, tag = "2")]
        CancelTask(super::CancelTaskResponse),
        #[prost(message, tag = "3")]
        CancelTaskV2(super::CancelTaskV2Response),
        #[prost(message, tag = "4")]
        TaskProgress(super::TaskProgressResponse),
        #[prost(message, tag = "5")]
        TaskProgressUpdates(super::TaskProgressUpdatesResponse),
        #[prost(message, tag = "6")]
        RegisterCallback(super::RegisterCallbackResponse),
        #[prost(message, tag = "7")]
        CreatePerpetualTask(super::CreatePerpetualTaskResponse),
        #[prost(message, tag = "8")]
        ResetPerpetualTask(super::ResetPerpetualTaskResponse),
        #[prost(message, tag = "9")]
        DeletePerpetualTask(super::DeletePerpetualTaskResponse),
        #[prost(message, tag = "10")]
        SendTaskProgressUpdate(super::SendTaskProgressUpdateResponse),
        #[prost(message, tag = "11")]
        QueueParkedTask(super::QueueParkedTaskResponse),
        #[prost(message, tag = "15")]
        Error(super::RpcError),
    }
}
