// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delegate task model and lifecycle state machine.
//!
//! ```text
//!   submit(parked) ──► PARKED ──queue_parked_task──┐
//!                                                  ▼
//!   submit ─────────────────────────────────────► QUEUED ──acquire──► STARTED
//!                                                  │                   │
//!                      cancel / expiry             │                   │ result / cancel /
//!                                                  ▼                   ▼ expiry / lost delegate
//!                          { SUCCESS, ERROR, FAILED, EXPIRED, ABORTED }   (terminal, final)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskgate_protocol::delegate_proto::TaskExecutionStage;

use crate::capability::{Capability, TASK_SELECTOR_ORIGIN};
use crate::error::{CoreError, Result};

/// Timeout applied when a submission does not declare one.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Persisted task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Parked,
    Queued,
    Started,
    Success,
    Error,
    Failed,
    Expired,
    Aborted,
}

impl TaskStatus {
    /// Statuses a task can still leave.
    pub const ACTIVE: [TaskStatus; 3] = [TaskStatus::Parked, TaskStatus::Queued, TaskStatus::Started];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parked => "parked",
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Success => "success",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !Self::ACTIVE.contains(&self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "parked" => Self::Parked,
            "queued" => Self::Queued,
            "started" => Self::Started,
            "success" => Self::Success,
            "error" => Self::Error,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            "aborted" => Self::Aborted,
            other => {
                return Err(CoreError::DatabaseError {
                    operation: "decode_status".to_string(),
                    details: format!("unknown task status '{}'", other),
                });
            }
        })
    }
}

/// Whether the submitter waits for the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskMode {
    Sync,
    #[default]
    Async,
}

impl TaskMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

impl FromStr for TaskMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(CoreError::DatabaseError {
                operation: "decode_mode".to_string(),
                details: format!("unknown task mode '{}'", other),
            }),
        }
    }
}

/// Coarse lifecycle stage reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    /// Task unknown to the caller's account.
    TypeUnspecified,
    Parked,
    Queueing,
    Executing,
    Finished,
    Failed,
    Expired,
    Aborted,
}

impl From<TaskStatus> for ExecutionStage {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Parked => Self::Parked,
            TaskStatus::Queued => Self::Queueing,
            TaskStatus::Started => Self::Executing,
            TaskStatus::Success => Self::Finished,
            TaskStatus::Error | TaskStatus::Failed => Self::Failed,
            TaskStatus::Expired => Self::Expired,
            TaskStatus::Aborted => Self::Aborted,
        }
    }
}

impl From<ExecutionStage> for TaskExecutionStage {
    fn from(stage: ExecutionStage) -> Self {
        match stage {
            ExecutionStage::TypeUnspecified => Self::TypeUnspecified,
            ExecutionStage::Parked => Self::Parked,
            ExecutionStage::Queueing => Self::Queueing,
            ExecutionStage::Executing => Self::Executing,
            ExecutionStage::Finished => Self::Finished,
            ExecutionStage::Failed => Self::Failed,
            ExecutionStage::Expired => Self::Expired,
            ExecutionStage::Aborted => Self::Aborted,
        }
    }
}

/// Explicit delegate selector attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSelector {
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// A submission before it has an id.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub task_type: String,
    /// Opaque parameters handed to the delegate.
    pub parameters: Vec<u8>,
    pub mode: TaskMode,
    /// Create without making the task visible to delegates.
    pub parked: bool,
    /// Zero means [`DEFAULT_TASK_TIMEOUT`].
    pub timeout: Duration,
    pub expression_functor_token: Option<String>,
    pub setup_abstractions: BTreeMap<String, String>,
    pub log_abstractions: BTreeMap<String, String>,
    pub capabilities: Vec<Capability>,
    pub selectors: Vec<TaskSelector>,
    pub callback_token: Option<String>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, parameters: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            parameters: parameters.into(),
            ..Default::default()
        }
    }

    /// Field-level checks. Callback token existence is checked by the dispatcher.
    pub fn validate(&self) -> Result<()> {
        if self.task_type.trim().is_empty() {
            return Err(CoreError::invalid("task_type", "task type is required"));
        }
        if self.parameters.is_empty() {
            return Err(CoreError::invalid("parameters", "task parameters are required"));
        }
        for capability in &self.capabilities {
            capability
                .validate()
                .map_err(|e| CoreError::invalid("capabilities", e.to_string()))?;
        }
        if self.selectors.iter().any(|s| s.selector.trim().is_empty()) {
            return Err(CoreError::invalid("selectors", "selector must not be empty"));
        }
        Ok(())
    }

    pub fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TASK_TIMEOUT
        } else {
            self.timeout
        }
    }
}

/// Folds explicit selectors into a selector capability.
pub fn effective_capabilities(
    capabilities: &[Capability],
    selectors: &[TaskSelector],
) -> Vec<Capability> {
    let mut requirements = capabilities.to_vec();
    if !selectors.is_empty() {
        requirements.push(Capability::selectors(
            selectors.iter().map(|s| s.selector.clone()),
            Some(TASK_SELECTOR_ORIGIN),
        ));
    }
    requirements
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateTask {
    pub task_id: String,
    pub account_id: String,
    pub task_type: String,
    pub parameters: Vec<u8>,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub timeout: Duration,
    pub expression_functor_token: Option<String>,
    pub setup_abstractions: BTreeMap<String, String>,
    pub log_abstractions: BTreeMap<String, String>,
    pub capabilities: Vec<Capability>,
    pub selectors: Vec<TaskSelector>,
    pub callback_token: Option<String>,
    /// Live delegates that matched at submission (or un-parking).
    pub eligible_delegate_ids: Vec<String>,
    /// Least-loaded eligible delegate; gets an exclusive pickup window.
    pub preferred_delegate_id: Option<String>,
    /// Delegate holding the assignment.
    pub delegate_id: Option<String>,
    pub result: Option<Vec<u8>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Queue expiry while queued, execution expiry once started.
    pub expires_at: Option<DateTime<Utc>>,
}

impl DelegateTask {
    pub fn stage(&self) -> ExecutionStage {
        self.status.into()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Capability requirements including selector tags.
    pub fn requirements(&self) -> Vec<Capability> {
        effective_capabilities(&self.capabilities, &self.selectors)
    }

    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        deadline(now, self.timeout)
    }
}

/// 9999-12-31T23:59:59Z in Unix seconds.
const LATEST_DEADLINE_SECS: i64 = 253_402_300_799;

/// Latest instant a deadline may take. Stored timestamps are RFC 3339 text on
/// SQLite; past year 9999 they gain a `+` prefix and sort before every
/// four-digit year.
pub fn latest_deadline() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_DEADLINE_SECS, 0).unwrap_or_default()
}

/// `now + timeout`, saturating at [`latest_deadline`].
pub(crate) fn deadline(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    let latest = latest_deadline();
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or(latest, |at| at.min(latest))
}

/// Terminal write requested for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub result: Option<Vec<u8>>,
    pub error_message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            result: None,
            error_message: None,
            finished_at: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: Vec<u8>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// A progress update received for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub account_id: String,
    pub task_id: String,
    pub callback_token: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}
