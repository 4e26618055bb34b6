// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for taskgate-core.
//!
//! [`CoreError`] is what engine components return. The service facade folds
//! those into [`ServiceError`], which is the only error kind callers of the
//! delegate service ever see:
//!
//! | Kind | When |
//! |------|------|
//! | `InvalidRequest` | malformed input, validated before any write |
//! | `Driver` | any other engine failure, with a fixed per-operation message |
//! | `NotImplemented` | the streaming progress subscription |

use std::fmt;

use taskgate_protocol::delegate_proto::RpcError;
use tracing::error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by engine components.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Task does not exist for the account.
    TaskNotFound {
        /// The task ID.
        task_id: String,
    },

    /// Perpetual task does not exist for the account.
    PerpetualTaskNotFound {
        /// The perpetual task ID.
        perpetual_task_id: String,
    },

    /// Delegate is not registered for the account.
    DelegateNotFound {
        /// The delegate ID.
        delegate_id: String,
    },

    /// Callback token was never registered.
    CallbackNotFound {
        /// The callback token.
        token: String,
    },

    /// Input failed validation.
    InvalidRequest {
        /// The offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Task is in a state that does not permit the operation.
    InvalidTaskState {
        /// The task ID.
        task_id: String,
        /// What the operation required.
        expected: String,
        /// What was found.
        actual: String,
    },

    /// Operation exists on the wire but has no implementation.
    NotImplemented {
        /// The operation name.
        operation: &'static str,
    },

    /// Store access failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::InvalidRequest`].
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Convert this error to an RpcError for protocol responses.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::PerpetualTaskNotFound { .. } => "PERPETUAL_TASK_NOT_FOUND",
            Self::DelegateNotFound { .. } => "DELEGATE_NOT_FOUND",
            Self::CallbackNotFound { .. } => "CALLBACK_NOT_FOUND",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::InvalidTaskState { .. } => "INVALID_TASK_STATE",
            Self::NotImplemented { .. } => "NOT_IMPLEMENTED",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskNotFound { task_id } => write!(f, "Task '{}' not found", task_id),
            Self::PerpetualTaskNotFound { perpetual_task_id } => {
                write!(f, "Perpetual task '{}' not found", perpetual_task_id)
            }
            Self::DelegateNotFound { delegate_id } => {
                write!(f, "Delegate '{}' is not registered", delegate_id)
            }
            Self::CallbackNotFound { token } => {
                write!(f, "Callback token '{}' is not registered", token)
            }
            Self::InvalidRequest { field, message } => {
                write!(f, "Invalid request for '{}': {}", field, message)
            }
            Self::InvalidTaskState {
                task_id,
                expected,
                actual,
            } => write!(
                f,
                "Task '{}' is in invalid state: expected {}, got {}",
                task_id, expected, actual
            ),
            Self::NotImplemented { operation } => write!(f, "{} is not implemented", operation),
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Delegate service operations and the fixed message each reports on failure.
///
/// Registered statically; the facade looks messages up here instead of
/// deriving them from the failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOperation {
    /// `SubmitTask`
    SubmitTask,
    /// `CancelTask` / `CancelTaskV2`
    CancelTask,
    /// `TaskProgress`
    TaskProgress,
    /// `RegisterCallback`
    RegisterCallback,
    /// `CreatePerpetualTask`
    CreatePerpetualTask,
    /// `ResetPerpetualTask`
    ResetPerpetualTask,
    /// `DeletePerpetualTask`
    DeletePerpetualTask,
    /// `SendTaskProgressUpdate`
    SendTaskProgressUpdate,
    /// `QueueParkedTask`
    QueueParkedTask,
}

/// (operation, rpc name, failure message)
const DRIVER_OPERATIONS: &[(DriverOperation, &str, &str)] = &[
    (
        DriverOperation::SubmitTask,
        "SubmitTask",
        "Unexpected error occurred while submitting task.",
    ),
    (
        DriverOperation::CancelTask,
        "CancelTask",
        "Unexpected error occurred while cancelling task.",
    ),
    (
        DriverOperation::TaskProgress,
        "TaskProgress",
        "Unexpected error occurred while checking task progress.",
    ),
    (
        DriverOperation::RegisterCallback,
        "RegisterCallback",
        "Unexpected error occurred while registering callback.",
    ),
    (
        DriverOperation::CreatePerpetualTask,
        "CreatePerpetualTask",
        "Unexpected error occurred while creating perpetual task.",
    ),
    (
        DriverOperation::ResetPerpetualTask,
        "ResetPerpetualTask",
        "Unexpected error occurred while resetting perpetual task.",
    ),
    (
        DriverOperation::DeletePerpetualTask,
        "DeletePerpetualTask",
        "Unexpected error occurred while deleting perpetual task.",
    ),
    (
        DriverOperation::SendTaskProgressUpdate,
        "SendTaskProgressUpdate",
        "Unexpected error occurred while sending task progress update.",
    ),
    (
        DriverOperation::QueueParkedTask,
        "QueueParkedTask",
        "Unexpected error occurred while queueing parked task.",
    ),
];

impl DriverOperation {
    fn entry(self) -> (&'static str, &'static str) {
        DRIVER_OPERATIONS
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, rpc, message)| (*rpc, *message))
            .unwrap_or(("Unknown", "Unexpected error occurred."))
    }

    /// Wire name of the RPC.
    pub fn rpc_name(self) -> &'static str {
        self.entry().0
    }

    /// Client-visible failure message.
    pub fn failure_message(self) -> &'static str {
        self.entry().1
    }
}

/// Unexpected failure of a delegate service operation.
///
/// Displays only the operation's fixed message; the underlying cause is
/// reachable through [`std::error::Error::source`] and is logged.
#[derive(Debug, Clone)]
pub struct DriverError {
    operation: DriverOperation,
    cause: CoreError,
}

impl DriverError {
    /// Wrap `cause` as a failure of `operation`.
    pub fn new(operation: DriverOperation, cause: CoreError) -> Self {
        Self { operation, cause }
    }

    /// The failed operation.
    pub fn operation(&self) -> DriverOperation {
        self.operation
    }

    /// The underlying engine error.
    pub fn cause(&self) -> &CoreError {
        &self.cause
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation.failure_message())
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Errors surfaced by the delegate service facade.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// Malformed input.
    #[error("{0}")]
    InvalidRequest(String),

    /// Unexpected failure, message fixed per operation.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Operation is not implemented.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

impl ServiceError {
    /// Translate an engine error raised while serving `operation`.
    ///
    /// Validation failures keep their message. Everything else becomes a
    /// [`DriverError`] and the cause is logged here, at the boundary.
    pub fn wrap(operation: DriverOperation, err: CoreError) -> Self {
        match err {
            CoreError::InvalidRequest { .. } => Self::InvalidRequest(err.to_string()),
            CoreError::NotImplemented { operation } => Self::NotImplemented(operation),
            other => {
                error!(
                    operation = operation.rpc_name(),
                    error_code = other.error_code(),
                    error = %other,
                    "Delegate service operation failed"
                );
                Self::Driver(DriverError::new(operation, other))
            }
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Driver(_) => "DRIVER_ERROR",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
        }
    }

    /// Convert this error to an RpcError for protocol responses.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    fn db_error() -> CoreError {
        CoreError::DatabaseError {
            operation: "update".to_string(),
            details: "connection reset by peer".to_string(),
        }
    }

    #[test]
    fn test_core_error_codes() {
        let cases = vec![
            (
                CoreError::TaskNotFound {
                    task_id: "t".to_string(),
                },
                "TASK_NOT_FOUND",
            ),
            (
                CoreError::PerpetualTaskNotFound {
                    perpetual_task_id: "p".to_string(),
                },
                "PERPETUAL_TASK_NOT_FOUND",
            ),
            (
                CoreError::DelegateNotFound {
                    delegate_id: "d".to_string(),
                },
                "DELEGATE_NOT_FOUND",
            ),
            (
                CoreError::CallbackNotFound {
                    token: "cb".to_string(),
                },
                "CALLBACK_NOT_FOUND",
            ),
            (CoreError::invalid("task_type", "required"), "INVALID_REQUEST"),
            (
                CoreError::InvalidTaskState {
                    task_id: "t".to_string(),
                    expected: "queued".to_string(),
                    actual: "success".to_string(),
                },
                "INVALID_TASK_STATE",
            ),
            (
                CoreError::NotImplemented {
                    operation: "TaskProgressUpdates",
                },
                "NOT_IMPLEMENTED",
            ),
            (db_error(), "DATABASE_ERROR"),
        ];

        for (err, code) in cases {
            let rpc = err.to_rpc_error();
            assert_eq!(rpc.code, code);
            assert!(!rpc.message.is_empty());
        }
    }

    #[test]
    fn test_every_operation_has_a_message() {
        let ops = [
            DriverOperation::SubmitTask,
            DriverOperation::CancelTask,
            DriverOperation::TaskProgress,
            DriverOperation::RegisterCallback,
            DriverOperation::CreatePerpetualTask,
            DriverOperation::ResetPerpetualTask,
            DriverOperation::DeletePerpetualTask,
            DriverOperation::SendTaskProgressUpdate,
            DriverOperation::QueueParkedTask,
        ];
        for op in ops {
            assert!(op.failure_message().starts_with("Unexpected error occurred while"));
            assert_ne!(op.rpc_name(), "Unknown");
        }
        assert_eq!(ops.len(), DRIVER_OPERATIONS.len());
    }

    #[test]
    fn test_driver_error_hides_cause() {
        let err = ServiceError::wrap(DriverOperation::CancelTask, db_error());

        assert_eq!(err.to_string(), "Unexpected error occurred while cancelling task.");
        assert_eq!(err.error_code(), "DRIVER_ERROR");
        assert!(!err.to_rpc_error().message.contains("connection reset"));

        let ServiceError::Driver(driver) = err else {
            panic!("expected driver error");
        };
        assert_eq!(driver.operation(), DriverOperation::CancelTask);
        let source = driver.source().expect("cause attached");
        assert!(source.to_string().contains("connection reset"));
    }

    #[test]
    fn test_invalid_request_passes_through() {
        let err = ServiceError::wrap(
            DriverOperation::CreatePerpetualTask,
            CoreError::invalid("context", "client context or execution bundle is required"),
        );
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        assert!(err.to_string().contains("execution bundle"));
    }

    #[test]
    fn test_not_implemented_passes_through() {
        let err = ServiceError::wrap(
            DriverOperation::TaskProgress,
            CoreError::NotImplemented {
                operation: "TaskProgressUpdates",
            },
        );
        assert_eq!(err.error_code(), "NOT_IMPLEMENTED");
    }
}
