// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC servers for taskgate-core.
//!
//! Provides two separate server components:
//! - Service Server: accepts connections from callers submitting and managing tasks
//! - Agent Server: accepts connections from delegates pulling and reporting work

pub mod agent_server;
pub mod service_server;

pub use agent_server::AgentServerState;
pub use service_server::ServiceServerState;
