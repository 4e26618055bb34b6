// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Taskgate Core - Delegate Task Dispatch Engine
//!
//! This crate hands asynchronous units of work ("delegate tasks") to a fleet of
//! remote worker agents ("delegates"), tracks their lifecycle, routes results
//! through registered callbacks and keeps recurring perpetual tasks placed
//! across the fleet. All state lives in PostgreSQL or SQLite.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Callers                                    │
//! │              (pipelines, deployment steps, monitoring)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ Delegate service protocol
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          taskgate-core                                  │
//! │  DelegateService ─► TaskDispatcher / PerpetualTaskScheduler /           │
//! │                     CallbackRegistry / DelegateRegistry                 │
//! │  TaskReaper, PerpetualTaskRebalancer (background)                       │
//! │                         Port 9001 + 9002                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           ▲                                              │
//!           │ Agent protocol                               ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │      Delegates        │                    │   PostgreSQL / SQLite       │
//! │ poll, acquire, report │                    │     (Task Record Store)     │
//! └───────────────────────┘                    └─────────────────────────────┘
//! ```
//!
//! # QUIC Servers
//!
//! | Server | Port | Purpose |
//! |--------|------|---------|
//! | Delegate Service Server | 9001 | Callers submit and manage tasks |
//! | Agent Server | 9002 | Delegates register, pull work and report results |
//!
//! # Delegate Service Protocol (Port 9001)
//!
//! Every request carries an `AccountId` envelope. Failures are returned as a
//! single driver error kind with a fixed message per operation; the cause is
//! only logged.
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `SubmitTask` | Persist a task (QUEUED or PARKED); SYNC tasks wait for a result |
//! | `CancelTask` / `CancelTaskV2` | Mark the task ABORTED, returning the stage seen at cancel time |
//! | `TaskProgress` | Coarse execution stage of a task |
//! | `TaskProgressUpdates` | Streaming subscription, not implemented |
//! | `RegisterCallback` | Allocate a callback token for a result destination |
//! | `CreatePerpetualTask` | Persist an unassigned perpetual task |
//! | `ResetPerpetualTask` | Recompute the execution context, keeping identity and delegate |
//! | `DeletePerpetualTask` | Idempotent removal |
//! | `SendTaskProgressUpdate` | Store a progress payload, discarded for finished tasks |
//! | `QueueParkedTask` | Release a PARKED task for dispatch |
//!
//! # Agent Protocol (Port 9002)
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `RegisterDelegate` | Upsert the delegate and its advertised facts |
//! | `Heartbeat` | Refresh liveness |
//! | `UpdateScopingRules` | Replace the delegate's scoping rules |
//! | `PollTasks` | Long-poll for queued tasks the delegate is eligible for |
//! | `AcquireTask` | Compare-and-swap a queued task to STARTED |
//! | `ReportTaskResult` | Terminal write, ignored when already terminal |
//! | `ListAbortedTasks` | Cancelled tasks the delegate should stop |
//! | `ListPerpetualTasks` | Perpetual tasks assigned to the delegate |
//! | `PerpetualTaskHeartbeat` | Record a successful probe |
//!
//! # Task Status State Machine
//!
//! ```text
//!     ┌────────┐  queue_parked_task   ┌────────┐
//!     │ PARKED │ ───────────────────► │ QUEUED │
//!     └────────┘                      └───┬────┘
//!                                         │ acquire
//!                                         ▼
//!                                    ┌─────────┐
//!                                    │ STARTED │
//!                                    └────┬────┘
//!                                         │ report / cancel / reaper
//!                                         ▼
//!                 ┌─────────┬───────┬────────┬─────────┬─────────┐
//!                 │ SUCCESS │ ERROR │ FAILED │ EXPIRED │ ABORTED │
//!                 └─────────┴───────┴────────┴─────────┴─────────┘
//! ```
//!
//! Any non-terminal task may be cancelled (ABORTED) or expired (EXPIRED).
//! Terminal states never change again.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TASKGATE_DATABASE_URL` | Yes | - | `postgres://...` or `sqlite:...` |
//! | `TASKGATE_SERVICE_PORT` | No | `9001` | Delegate service QUIC port |
//! | `TASKGATE_AGENT_PORT` | No | `9002` | Agent QUIC port |
//! | `TASKGATE_SYNC_WAIT_MS` | No | `30000` | Bounded wait of a SYNC submission |
//! | `TASKGATE_DELEGATE_HEARTBEAT_TIMEOUT_SECS` | No | `90` | Delegate liveness window |
//! | `TASKGATE_REAPER_INTERVAL_SECS` | No | `10` | Reaper period |
//! | `TASKGATE_REBALANCE_INTERVAL_SECS` | No | `60` | Rebalancer period |
//! | `TASKGATE_REBALANCE_SKEW_THRESHOLD` | No | `2` | Tolerated load difference |
//! | `TASKGATE_BROADCAST_GRACE_MS` | No | `5000` | Preferred delegate pickup window |
//!
//! # Modules
//!
//! - [`dispatcher`]: task lifecycle and pickup
//! - [`capability`]: capability requirements and eligibility
//! - [`perpetual_scheduler`]: perpetual task lifecycle and rebalancing
//! - [`callback`]: callback tokens and progress updates
//! - [`service`]: the RPC facade both servers route to
//! - [`runtime`]: embeddable runtime with servers and background workers

/// Agent protocol handlers (registration, pickup, results, perpetual tasks).
pub mod agent_handlers;

/// Callback registry for asynchronous result routing.
pub mod callback;

/// Capability requirements and the eligibility matcher.
pub mod capability;

/// Server configuration loaded from environment variables.
pub mod config;

/// Explicit per-request account context.
pub mod context;

/// Delegate registry and scoping rules.
pub mod delegate;

/// Task dispatcher and the task state machine.
pub mod dispatcher;

/// Error types with RPC error code mapping.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Perpetual task data model.
pub mod perpetual;

/// Perpetual task scheduler.
pub mod perpetual_scheduler;

/// Persistence trait and SQL backends.
pub mod persistence;

/// Background reaper for expired tasks and lost delegates.
pub mod reaper;

/// Pure perpetual task placement planning.
pub mod rebalance;

/// Background perpetual task rebalancer.
pub mod rebalancer;

/// Embeddable runtime.
pub mod runtime;

/// QUIC server implementations for the service and agent protocols.
pub mod server;

/// Delegate service facade.
pub mod service;

/// Delegate service protocol handlers.
pub mod service_handlers;

/// Delegate task data model.
pub mod task;

pub use context::RequestContext;
pub use error::{CoreError, DriverError, DriverOperation, ServiceError};
pub use runtime::{TaskgateRuntime, TaskgateRuntimeBuilder};
pub use service::DelegateService;
