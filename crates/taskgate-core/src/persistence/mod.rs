// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for taskgate-core.
//!
//! Every lifecycle write is a single conditional statement whose guard
//! encodes the allowed source state (or previous assignment). Methods
//! returning `bool` report whether the guard matched; callers treat `false`
//! as "someone else got there first", never as an error.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::callback::CallbackRegistration;
use crate::capability::ScopingRules;
use crate::delegate::DelegateRecord;
use crate::error::CoreError;
use crate::perpetual::{PerpetualTask, PerpetualTaskContext, PerpetualTaskSchedule};
use crate::task::{DelegateTask, ProgressRecord, TaskOutcome};

/// Column list shared by every `delegate_tasks` select.
pub(crate) const TASK_COLUMNS: &str = "t.task_id, t.account_id, t.task_type, t.parameters, \
     t.mode, t.status, t.timeout_ms, t.expression_functor_token, t.setup_abstractions, \
     t.log_abstractions, t.capabilities, t.selectors, t.callback_token, \
     t.eligible_delegate_ids, t.preferred_delegate_id, t.delegate_id, t.result, \
     t.error_message, t.created_at, t.assigned_at, t.finished_at, t.expires_at";

/// Column list shared by every `perpetual_tasks` select.
pub(crate) const PERPETUAL_TASK_COLUMNS: &str = "id, account_id, task_type, context, \
     context_fingerprint, interval_ms, timeout_ms, delegate_id, paused, allow_stale_task_id, \
     description, created_at, context_updated_at, assigned_at, last_heartbeat_at";

/// `delegate_tasks` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub task_id: String,
    pub account_id: String,
    pub task_type: String,
    pub parameters: Vec<u8>,
    pub mode: String,
    pub status: String,
    pub timeout_ms: i64,
    pub expression_functor_token: Option<String>,
    /// JSON object.
    pub setup_abstractions: String,
    /// JSON object.
    pub log_abstractions: String,
    /// JSON array of capabilities.
    pub capabilities: String,
    /// JSON array of selectors.
    pub selectors: String,
    pub callback_token: Option<String>,
    /// JSON array of delegate ids.
    pub eligible_delegate_ids: String,
    pub preferred_delegate_id: Option<String>,
    pub delegate_id: Option<String>,
    pub result: Option<Vec<u8>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    pub fn from_task(task: &DelegateTask) -> Result<Self, CoreError> {
        Ok(Self {
            task_id: task.task_id.clone(),
            account_id: task.account_id.clone(),
            task_type: task.task_type.clone(),
            parameters: task.parameters.clone(),
            mode: task.mode.as_str().to_string(),
            status: task.status.as_str().to_string(),
            timeout_ms: duration_to_ms(task.timeout),
            expression_functor_token: task.expression_functor_token.clone(),
            setup_abstractions: to_json(&task.setup_abstractions)?,
            log_abstractions: to_json(&task.log_abstractions)?,
            capabilities: to_json(&task.capabilities)?,
            selectors: to_json(&task.selectors)?,
            callback_token: task.callback_token.clone(),
            eligible_delegate_ids: to_json(&task.eligible_delegate_ids)?,
            preferred_delegate_id: task.preferred_delegate_id.clone(),
            delegate_id: task.delegate_id.clone(),
            result: task.result.clone(),
            error_message: task.error_message.clone(),
            created_at: task.created_at,
            assigned_at: task.assigned_at,
            finished_at: task.finished_at,
            expires_at: task.expires_at,
        })
    }

    pub fn into_task(self) -> Result<DelegateTask, CoreError> {
        Ok(DelegateTask {
            mode: self.mode.parse()?,
            status: self.status.parse()?,
            timeout: ms_to_duration(self.timeout_ms),
            setup_abstractions: from_json(&self.setup_abstractions)?,
            log_abstractions: from_json(&self.log_abstractions)?,
            capabilities: from_json(&self.capabilities)?,
            selectors: from_json(&self.selectors)?,
            eligible_delegate_ids: from_json(&self.eligible_delegate_ids)?,
            task_id: self.task_id,
            account_id: self.account_id,
            task_type: self.task_type,
            parameters: self.parameters,
            expression_functor_token: self.expression_functor_token,
            callback_token: self.callback_token,
            preferred_delegate_id: self.preferred_delegate_id,
            delegate_id: self.delegate_id,
            result: self.result,
            error_message: self.error_message,
            created_at: self.created_at,
            assigned_at: self.assigned_at,
            finished_at: self.finished_at,
            expires_at: self.expires_at,
        })
    }
}

/// `delegates` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DelegateRow {
    pub account_id: String,
    pub delegate_id: String,
    pub host_name: String,
    /// JSON object.
    pub facts: String,
    /// JSON object.
    pub scoping_rules: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl DelegateRow {
    pub fn into_record(self) -> Result<DelegateRecord, CoreError> {
        Ok(DelegateRecord {
            facts: from_json(&self.facts)?,
            scoping_rules: from_json(&self.scoping_rules)?,
            delegate_id: self.delegate_id,
            account_id: self.account_id,
            host_name: self.host_name,
            registered_at: self.registered_at,
            last_heartbeat_at: self.last_heartbeat_at,
        })
    }
}

/// `delegate_callbacks` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CallbackRow {
    pub token: String,
    /// JSON destination.
    pub destination: String,
    pub created_at: DateTime<Utc>,
}

impl CallbackRow {
    pub fn into_registration(self) -> Result<CallbackRegistration, CoreError> {
        Ok(CallbackRegistration {
            destination: from_json(&self.destination)?,
            token: self.token,
            created_at: self.created_at,
        })
    }
}

/// `task_progress` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProgressRow {
    pub account_id: String,
    pub task_id: String,
    pub callback_token: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl From<ProgressRow> for ProgressRecord {
    fn from(row: ProgressRow) -> Self {
        Self {
            account_id: row.account_id,
            task_id: row.task_id,
            callback_token: row.callback_token,
            payload: row.payload,
            received_at: row.received_at,
        }
    }
}

/// `perpetual_tasks` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PerpetualTaskRow {
    pub id: String,
    pub account_id: String,
    pub task_type: String,
    /// JSON context.
    pub context: String,
    pub context_fingerprint: String,
    pub interval_ms: i64,
    pub timeout_ms: i64,
    pub delegate_id: Option<String>,
    pub paused: bool,
    pub allow_stale_task_id: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub context_updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl PerpetualTaskRow {
    pub fn into_task(self) -> Result<PerpetualTask, CoreError> {
        Ok(PerpetualTask {
            context: from_json(&self.context)?,
            schedule: PerpetualTaskSchedule {
                interval: ms_to_duration(self.interval_ms),
                timeout: ms_to_duration(self.timeout_ms),
            },
            id: self.id,
            account_id: self.account_id,
            task_type: self.task_type,
            delegate_id: self.delegate_id,
            paused: self.paused,
            allow_stale_task_id: self.allow_stale_task_id,
            description: self.description,
            context_fingerprint: self.context_fingerprint,
            created_at: self.created_at,
            context_updated_at: self.context_updated_at,
            assigned_at: self.assigned_at,
            last_heartbeat_at: self.last_heartbeat_at,
        })
    }
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CoreError> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, CoreError> {
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn ms_to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or_default())
}

pub(crate) fn collect_tasks(rows: Vec<TaskRow>) -> Result<Vec<DelegateTask>, CoreError> {
    rows.into_iter().map(TaskRow::into_task).collect()
}

pub(crate) fn collect_perpetual_tasks(
    rows: Vec<PerpetualTaskRow>,
) -> Result<Vec<PerpetualTask>, CoreError> {
    rows.into_iter().map(PerpetualTaskRow::into_task).collect()
}

/// Persistence interface used by the engine.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Delegate tasks
    // ------------------------------------------------------------------

    async fn insert_task(&self, task: &DelegateTask) -> Result<(), CoreError>;

    async fn get_task(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Option<DelegateTask>, CoreError>;

    /// PARKED → QUEUED.
    async fn queue_parked_task(
        &self,
        account_id: &str,
        task_id: &str,
        eligible_delegate_ids: &[String],
        preferred_delegate_id: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// QUEUED and unassigned → STARTED on `delegate_id`.
    async fn assign_task(
        &self,
        account_id: &str,
        task_id: &str,
        delegate_id: &str,
        assigned_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Any non-terminal status → `outcome.status`.
    async fn finish_task(
        &self,
        account_id: &str,
        task_id: &str,
        outcome: &TaskOutcome,
    ) -> Result<bool, CoreError>;

    /// One page of QUEUED tasks of the account, oldest first.
    async fn list_queued_tasks(
        &self,
        account_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DelegateTask>, CoreError>;

    /// STARTED task count per assigned delegate.
    async fn count_started_tasks_by_delegate(
        &self,
        account_id: &str,
    ) -> Result<BTreeMap<String, i64>, CoreError>;

    /// Non-terminal tasks with `expires_at` before `now`, across accounts.
    async fn list_expired_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DelegateTask>, CoreError>;

    /// STARTED tasks whose delegate is gone or silent since before `cutoff`.
    async fn list_tasks_of_lost_delegates(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DelegateTask>, CoreError>;

    /// ABORTED tasks assigned to the delegate, finished at or after `since`.
    async fn list_aborted_tasks_for_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError>;

    // ------------------------------------------------------------------
    // Progress and callbacks
    // ------------------------------------------------------------------

    async fn insert_progress(&self, record: &ProgressRecord) -> Result<(), CoreError>;

    async fn list_progress(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Vec<ProgressRecord>, CoreError>;

    async fn insert_callback(&self, registration: &CallbackRegistration) -> Result<(), CoreError>;

    async fn get_callback(&self, token: &str) -> Result<Option<CallbackRegistration>, CoreError>;

    // ------------------------------------------------------------------
    // Delegates
    // ------------------------------------------------------------------

    /// Insert, or refresh host, facts and heartbeat keeping scoping rules.
    async fn upsert_delegate(&self, delegate: &DelegateRecord) -> Result<(), CoreError>;

    async fn get_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Option<DelegateRecord>, CoreError>;

    async fn touch_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn update_scoping_rules(
        &self,
        account_id: &str,
        delegate_id: &str,
        rules: &ScopingRules,
    ) -> Result<bool, CoreError>;

    /// Delegates with a heartbeat at or after `cutoff`, ordered by id.
    async fn list_live_delegates(
        &self,
        account_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DelegateRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Perpetual tasks
    // ------------------------------------------------------------------

    async fn insert_perpetual_task(&self, task: &PerpetualTask) -> Result<(), CoreError>;

    async fn get_perpetual_task(
        &self,
        account_id: &str,
        id: &str,
    ) -> Result<Option<PerpetualTask>, CoreError>;

    async fn find_perpetual_task(
        &self,
        account_id: &str,
        task_type: &str,
        context_fingerprint: &str,
    ) -> Result<Option<PerpetualTask>, CoreError>;

    async fn update_perpetual_task_context(
        &self,
        account_id: &str,
        id: &str,
        context: &PerpetualTaskContext,
        context_fingerprint: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn delete_perpetual_task(&self, account_id: &str, id: &str) -> Result<bool, CoreError>;

    async fn set_perpetual_task_paused(
        &self,
        account_id: &str,
        id: &str,
        paused: bool,
    ) -> Result<bool, CoreError>;

    /// Compare-and-swap of the assignment; only applies when the current
    /// assignment equals `expected` and the task is not paused.
    async fn reassign_perpetual_task(
        &self,
        account_id: &str,
        id: &str,
        expected: Option<&str>,
        new_delegate_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn list_perpetual_tasks(&self, account_id: &str)
    -> Result<Vec<PerpetualTask>, CoreError>;

    /// Unpaused tasks assigned to the delegate.
    async fn list_perpetual_tasks_for_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Vec<PerpetualTask>, CoreError>;

    async fn record_perpetual_task_heartbeat(
        &self,
        account_id: &str,
        id: &str,
        delegate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Accounts owning at least one perpetual task.
    async fn list_perpetual_task_accounts(&self) -> Result<Vec<String>, CoreError>;

    async fn health_check_db(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Open a pool for `database_url`, run migrations and return a backend.
///
/// `sqlite:` URLs select [`SqlitePersistence`], everything else
/// [`PostgresPersistence`].
pub async fn connect(
    database_url: &str,
    max_connections: u32,
) -> Result<Arc<dyn Persistence>, CoreError> {
    let migrate_err = |e: sqlx::migrate::MigrateError| CoreError::DatabaseError {
        operation: "migrate".to_string(),
        details: e.to_string(),
    };

    if database_url.starts_with("sqlite:") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(migrate_err)?;
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        crate::migrations::run_postgres(&pool)
            .await
            .map_err(migrate_err)?;
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}
