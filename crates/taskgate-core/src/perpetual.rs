// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Perpetual task model.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::capability::Capability;
use crate::error::{CoreError, Result};

/// How often a perpetual task runs and how long one run may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerpetualTaskSchedule {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PerpetualTaskSchedule {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(CoreError::invalid("schedule.interval", "interval must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(CoreError::invalid("schedule.timeout", "timeout must be positive"));
        }
        Ok(())
    }
}

/// Capabilities and targeting of a perpetual task, shipped as one opaque blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionBundle {
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    /// Opaque parameters handed to the delegate.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ExecutionBundle {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bundle: Self = serde_json::from_slice(bytes).map_err(|e| {
            CoreError::invalid("execution_bundle", format!("undecodable bundle: {}", e))
        })?;
        for capability in &bundle.capabilities {
            capability
                .validate()
                .map_err(|e| CoreError::invalid("execution_bundle", e.to_string()))?;
        }
        Ok(bundle)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// The two accepted context forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum PerpetualTaskContext {
    /// Key/value parameters identifying the monitored resource.
    ClientContext { parameters: BTreeMap<String, String> },
    ExecutionBundle { bundle: ExecutionBundle },
}

impl PerpetualTaskContext {
    /// Stable hex SHA-256 over the serialized context.
    pub fn fingerprint(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(hex_digest(&Sha256::digest(&encoded)))
    }

    /// Capability requirements of the task. Client contexts carry none.
    pub fn capabilities(&self) -> &[Capability] {
        match self {
            Self::ClientContext { .. } => &[],
            Self::ExecutionBundle { bundle } => &bundle.capabilities,
        }
    }

    pub fn setup_abstractions(&self) -> BTreeMap<String, String> {
        match self {
            Self::ClientContext { .. } => BTreeMap::new(),
            Self::ExecutionBundle { bundle } => bundle.setup_abstractions.clone(),
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Placement state of a perpetual task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerpetualTaskState {
    Unassigned,
    Assigned,
    Paused,
}

/// A persisted perpetual task.
#[derive(Debug, Clone, PartialEq)]
pub struct PerpetualTask {
    pub id: String,
    pub account_id: String,
    pub task_type: String,
    pub context: PerpetualTaskContext,
    pub schedule: PerpetualTaskSchedule,
    pub delegate_id: Option<String>,
    pub paused: bool,
    pub allow_stale_task_id: bool,
    pub description: String,
    pub context_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub context_updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl PerpetualTask {
    pub fn state(&self) -> PerpetualTaskState {
        if self.paused {
            PerpetualTaskState::Paused
        } else if self.delegate_id.is_some() {
            PerpetualTaskState::Assigned
        } else {
            PerpetualTaskState::Unassigned
        }
    }
}

/// Input of `create_task`.
#[derive(Debug, Clone)]
pub struct NewPerpetualTask {
    pub task_type: String,
    pub client_context: Option<BTreeMap<String, String>>,
    /// Serialized [`ExecutionBundle`].
    pub execution_bundle: Option<Vec<u8>>,
    pub schedule: PerpetualTaskSchedule,
    pub allow_stale_task_id: bool,
    pub description: String,
}

impl NewPerpetualTask {
    /// Validates the request and resolves exactly one context form.
    pub fn resolve_context(&self) -> Result<PerpetualTaskContext> {
        if self.task_type.trim().is_empty() {
            return Err(CoreError::invalid("task_type", "task type is required"));
        }
        self.schedule.validate()?;

        let client_context = self.client_context.as_ref().filter(|c| !c.is_empty());
        let bundle = self.execution_bundle.as_ref().filter(|b| !b.is_empty());
        match (client_context, bundle) {
            (Some(parameters), None) => Ok(PerpetualTaskContext::ClientContext {
                parameters: parameters.clone(),
            }),
            (None, Some(bytes)) => Ok(PerpetualTaskContext::ExecutionBundle {
                bundle: ExecutionBundle::from_bytes(bytes)?,
            }),
            (None, None) => Err(CoreError::invalid(
                "context",
                "either client context or execution bundle is required",
            )),
            (Some(_), Some(_)) => Err(CoreError::invalid(
                "context",
                "client context and execution bundle are mutually exclusive",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> PerpetualTaskSchedule {
        PerpetualTaskSchedule {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }

    fn request() -> NewPerpetualTask {
        NewPerpetualTask {
            task_type: "K8S_WATCH".to_string(),
            client_context: None,
            execution_bundle: None,
            schedule: schedule(),
            allow_stale_task_id: false,
            description: String::new(),
        }
    }

    #[test]
    fn test_context_required() {
        let err = request().resolve_context().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");

        let mut empty = request();
        empty.client_context = Some(BTreeMap::new());
        empty.execution_bundle = Some(Vec::new());
        assert!(empty.resolve_context().is_err());
    }

    #[test]
    fn test_both_contexts_rejected() {
        let mut req = request();
        req.client_context = Some(BTreeMap::from([("cluster".to_string(), "c1".to_string())]));
        req.execution_bundle = Some(ExecutionBundle::default().to_bytes().unwrap());
        assert!(req.resolve_context().is_err());
    }

    #[test]
    fn test_execution_bundle_decoded() {
        let bundle = ExecutionBundle {
            capabilities: vec![Capability::selectors(["k8s"], None)],
            setup_abstractions: BTreeMap::from([("envId".to_string(), "prod".to_string())]),
            parameters: serde_json::json!({"namespace": "default"}),
        };
        let mut req = request();
        req.execution_bundle = Some(bundle.to_bytes().unwrap());

        let context = req.resolve_context().unwrap();
        assert_eq!(context.capabilities().len(), 1);
        assert_eq!(context.setup_abstractions()["envId"], "prod");
    }

    #[test]
    fn test_garbage_bundle_is_invalid_request() {
        let mut req = request();
        req.execution_bundle = Some(b"\x00\x01".to_vec());
        assert_eq!(req.resolve_context().unwrap_err().error_code(), "INVALID_REQUEST");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut req = request();
        req.client_context = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        req.schedule.interval = Duration::ZERO;
        assert!(req.resolve_context().is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_based() {
        let a = PerpetualTaskContext::ClientContext {
            parameters: BTreeMap::from([("cluster".to_string(), "c1".to_string())]),
        };
        let b = PerpetualTaskContext::ClientContext {
            parameters: BTreeMap::from([("cluster".to_string(), "c2".to_string())]),
        };
        let fp = a.fingerprint().unwrap();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, a.clone().fingerprint().unwrap());
        assert_ne!(fp, b.fingerprint().unwrap());
    }
}
