// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callback registry: durable routing of asynchronous task results.
//!
//! Every registration allocates a fresh token, even for a destination that
//! was registered before. The token, not the destination, is the identity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::task::ProgressRecord;

/// Where results for a token are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallbackDestination {
    /// Results are written into `<collection_prefix>_*` collections.
    DataStore {
        connection: String,
        collection_prefix: String,
    },
    /// Results are published to a topic.
    Queue { topic: String },
}

impl CallbackDestination {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::DataStore {
                connection,
                collection_prefix,
            } => {
                if connection.trim().is_empty() {
                    return Err(CoreError::invalid("callback.connection", "connection is required"));
                }
                if collection_prefix.trim().is_empty() {
                    return Err(CoreError::invalid(
                        "callback.collection_prefix",
                        "collection prefix is required",
                    ));
                }
            }
            Self::Queue { topic } => {
                if topic.trim().is_empty() {
                    return Err(CoreError::invalid("callback.topic", "topic is required"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallbackRegistration {
    pub token: String,
    pub destination: CallbackDestination,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressDisposition {
    Stored,
    /// Task is terminal; the update was accepted and dropped.
    Discarded,
    /// Task is unknown to the account.
    UnknownTask,
}

impl ProgressDisposition {
    pub fn accepted(self) -> bool {
        !matches!(self, Self::UnknownTask)
    }
}

pub struct CallbackRegistry {
    persistence: Arc<dyn Persistence>,
}

impl CallbackRegistry {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Register `destination` under a new token.
    #[instrument(skip(self, destination))]
    pub async fn ensure_callback(&self, destination: CallbackDestination) -> Result<String> {
        destination.validate()?;

        let registration = CallbackRegistration {
            token: Uuid::new_v4().to_string(),
            destination,
            created_at: Utc::now(),
        };
        self.persistence.insert_callback(&registration).await?;

        info!(token = %registration.token, "Callback registered");
        Ok(registration.token)
    }

    pub async fn get(&self, token: &str) -> Result<CallbackRegistration> {
        self.persistence
            .get_callback(token)
            .await?
            .ok_or_else(|| CoreError::CallbackNotFound {
                token: token.to_string(),
            })
    }

    /// Fails with `InvalidRequest` when `token` was never registered.
    pub async fn require_token(&self, token: &str) -> Result<()> {
        match self.get(token).await {
            Ok(_) => Ok(()),
            Err(CoreError::CallbackNotFound { token }) => Err(CoreError::invalid(
                "callback_token",
                format!("callback token '{}' is not registered", token),
            )),
            Err(e) => Err(e),
        }
    }

    /// Record a progress update. Terminal tasks accept and discard it.
    #[instrument(skip(self, ctx, token, payload), fields(account_id = %ctx.account_id()))]
    pub async fn send_progress_update(
        &self,
        ctx: &RequestContext,
        task_id: &str,
        token: &str,
        payload: Vec<u8>,
    ) -> Result<ProgressDisposition> {
        if token.trim().is_empty() {
            return Err(CoreError::invalid("callback_token", "callback token is required"));
        }
        self.require_token(token).await?;

        let Some(task) = self.persistence.get_task(ctx.account_id(), task_id).await? else {
            debug!("Progress update for unknown task");
            return Ok(ProgressDisposition::UnknownTask);
        };
        if task.is_terminal() {
            debug!(status = %task.status, "Progress update for terminal task discarded");
            return Ok(ProgressDisposition::Discarded);
        }

        let record = ProgressRecord {
            account_id: ctx.account_id().to_string(),
            task_id: task_id.to_string(),
            callback_token: token.to_string(),
            payload,
            received_at: Utc::now(),
        };
        self.persistence.insert_progress(&record).await?;
        debug!(bytes = record.payload.len(), "Progress update stored");
        Ok(ProgressDisposition::Stored)
    }

    /// Progress updates of a task in arrival order.
    pub async fn list_progress(
        &self,
        ctx: &RequestContext,
        task_id: &str,
    ) -> Result<Vec<ProgressRecord>> {
        self.persistence.list_progress(ctx.account_id(), task_id).await
    }
}
