// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::callback::CallbackRegistration;
use crate::capability::ScopingRules;
use crate::delegate::DelegateRecord;
use crate::error::CoreError;
use crate::perpetual::{PerpetualTask, PerpetualTaskContext};
use crate::task::{DelegateTask, ProgressRecord, TaskOutcome};

use super::{
    CallbackRow, DelegateRow, PERPETUAL_TASK_COLUMNS, Persistence, PerpetualTaskRow, ProgressRow,
    TASK_COLUMNS, TaskRow, collect_perpetual_tasks, collect_tasks, duration_to_ms, to_json,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/taskgate.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::SQLITE
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_task(&self, task: &DelegateTask) -> Result<(), CoreError> {
        let row = TaskRow::from_task(task)?;
        sqlx::query(
            r#"
            INSERT INTO delegate_tasks (
                task_id, account_id, task_type, parameters, mode, status, timeout_ms,
                expression_functor_token, setup_abstractions, log_abstractions, capabilities,
                selectors, callback_token, eligible_delegate_ids, preferred_delegate_id,
                delegate_id, result, error_message, created_at, assigned_at, finished_at,
                expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.task_id)
        .bind(&row.account_id)
        .bind(&row.task_type)
        .bind(&row.parameters)
        .bind(&row.mode)
        .bind(&row.status)
        .bind(row.timeout_ms)
        .bind(&row.expression_functor_token)
        .bind(&row.setup_abstractions)
        .bind(&row.log_abstractions)
        .bind(&row.capabilities)
        .bind(&row.selectors)
        .bind(&row.callback_token)
        .bind(&row.eligible_delegate_ids)
        .bind(&row.preferred_delegate_id)
        .bind(&row.delegate_id)
        .bind(&row.result)
        .bind(&row.error_message)
        .bind(row.created_at)
        .bind(row.assigned_at)
        .bind(row.finished_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Option<DelegateTask>, CoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM delegate_tasks t WHERE t.account_id = ? AND t.task_id = ?"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(account_id)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TaskRow::into_task).transpose()
    }

    async fn queue_parked_task(
        &self,
        account_id: &str,
        task_id: &str,
        eligible_delegate_ids: &[String],
        preferred_delegate_id: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET status = 'queued',
                eligible_delegate_ids = ?1,
                preferred_delegate_id = ?2,
                expires_at = ?3
            WHERE account_id = ?4
              AND task_id = ?5
              AND status = 'parked'
            "#,
        )
        .bind(to_json(eligible_delegate_ids)?)
        .bind(preferred_delegate_id)
        .bind(expires_at)
        .bind(account_id)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn assign_task(
        &self,
        account_id: &str,
        task_id: &str,
        delegate_id: &str,
        assigned_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET status = 'started',
                delegate_id = ?1,
                assigned_at = ?2,
                expires_at = ?3
            WHERE account_id = ?4
              AND task_id = ?5
              AND status = 'queued'
              AND delegate_id IS NULL
            "#,
        )
        .bind(delegate_id)
        .bind(assigned_at)
        .bind(expires_at)
        .bind(account_id)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_task(
        &self,
        account_id: &str,
        task_id: &str,
        outcome: &TaskOutcome,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET status = ?1,
                result = ?2,
                error_message = ?3,
                finished_at = ?4
            WHERE account_id = ?5
              AND task_id = ?6
              AND status IN ('parked', 'queued', 'started')
            "#,
        )
        .bind(outcome.status.as_str())
        .bind(&outcome.result)
        .bind(&outcome.error_message)
        .bind(outcome.finished_at)
        .bind(account_id)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_queued_tasks(
        &self,
        account_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DelegateTask>, CoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM delegate_tasks t \
             WHERE t.account_id = ? AND t.status = 'queued' \
             ORDER BY t.created_at, t.task_id LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(account_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        collect_tasks(rows)
    }

    async fn count_started_tasks_by_delegate(
        &self,
        account_id: &str,
    ) -> Result<BTreeMap<String, i64>, CoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT delegate_id, COUNT(*)
            FROM delegate_tasks
            WHERE account_id = ?
              AND status = 'started'
              AND delegate_id IS NOT NULL
            GROUP BY delegate_id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn list_expired_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DelegateTask>, CoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM delegate_tasks t \
             WHERE t.status IN ('parked', 'queued', 'started') \
               AND t.expires_at IS NOT NULL AND t.expires_at < ? \
             ORDER BY t.expires_at LIMIT ?"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        collect_tasks(rows)
    }

    async fn list_tasks_of_lost_delegates(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DelegateTask>, CoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM delegate_tasks t \
             LEFT JOIN delegates d \
               ON d.account_id = t.account_id AND d.delegate_id = t.delegate_id \
             WHERE t.status = 'started' \
               AND (d.delegate_id IS NULL OR d.last_heartbeat_at < ?) \
             ORDER BY t.assigned_at LIMIT ?"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        collect_tasks(rows)
    }

    async fn list_aborted_tasks_for_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT task_id
            FROM delegate_tasks
            WHERE account_id = ?
              AND delegate_id = ?
              AND status = 'aborted'
              AND finished_at >= ?
            ORDER BY finished_at, task_id
            "#,
        )
        .bind(account_id)
        .bind(delegate_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn insert_progress(&self, record: &ProgressRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_progress (account_id, task_id, callback_token, payload, received_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.account_id)
        .bind(&record.task_id)
        .bind(&record.callback_token)
        .bind(&record.payload)
        .bind(record.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_progress(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Vec<ProgressRecord>, CoreError> {
        let rows = sqlx::query_as::<_, ProgressRow>(
            r#"
            SELECT account_id, task_id, callback_token, payload, received_at
            FROM task_progress
            WHERE account_id = ? AND task_id = ?
            ORDER BY id
            "#,
        )
        .bind(account_id)
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ProgressRecord::from).collect())
    }

    async fn insert_callback(&self, registration: &CallbackRegistration) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO delegate_callbacks (token, destination, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&registration.token)
        .bind(to_json(&registration.destination)?)
        .bind(registration.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_callback(&self, token: &str) -> Result<Option<CallbackRegistration>, CoreError> {
        let row = sqlx::query_as::<_, CallbackRow>(
            "SELECT token, destination, created_at FROM delegate_callbacks WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CallbackRow::into_registration).transpose()
    }

    async fn upsert_delegate(&self, delegate: &DelegateRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO delegates (
                account_id, delegate_id, host_name, facts, scoping_rules,
                registered_at, last_heartbeat_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (account_id, delegate_id) DO UPDATE SET
                host_name = excluded.host_name,
                facts = excluded.facts,
                last_heartbeat_at = excluded.last_heartbeat_at
            "#,
        )
        .bind(&delegate.account_id)
        .bind(&delegate.delegate_id)
        .bind(&delegate.host_name)
        .bind(to_json(&delegate.facts)?)
        .bind(to_json(&delegate.scoping_rules)?)
        .bind(delegate.registered_at)
        .bind(delegate.last_heartbeat_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Option<DelegateRecord>, CoreError> {
        let row = sqlx::query_as::<_, DelegateRow>(
            r#"
            SELECT account_id, delegate_id, host_name, facts, scoping_rules,
                   registered_at, last_heartbeat_at
            FROM delegates
            WHERE account_id = ? AND delegate_id = ?
            "#,
        )
        .bind(account_id)
        .bind(delegate_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DelegateRow::into_record).transpose()
    }

    async fn touch_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE delegates SET last_heartbeat_at = ? WHERE account_id = ? AND delegate_id = ?",
        )
        .bind(now)
        .bind(account_id)
        .bind(delegate_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_scoping_rules(
        &self,
        account_id: &str,
        delegate_id: &str,
        rules: &ScopingRules,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE delegates SET scoping_rules = ? WHERE account_id = ? AND delegate_id = ?",
        )
        .bind(to_json(rules)?)
        .bind(account_id)
        .bind(delegate_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_live_delegates(
        &self,
        account_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DelegateRecord>, CoreError> {
        let rows = sqlx::query_as::<_, DelegateRow>(
            r#"
            SELECT account_id, delegate_id, host_name, facts, scoping_rules,
                   registered_at, last_heartbeat_at
            FROM delegates
            WHERE account_id = ? AND last_heartbeat_at >= ?
            ORDER BY delegate_id
            "#,
        )
        .bind(account_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DelegateRow::into_record).collect()
    }

    async fn insert_perpetual_task(&self, task: &PerpetualTask) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO perpetual_tasks (
                id, account_id, task_type, context, context_fingerprint, interval_ms,
                timeout_ms, delegate_id, paused, allow_stale_task_id, description,
                created_at, context_updated_at, assigned_at, last_heartbeat_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.account_id)
        .bind(&task.task_type)
        .bind(to_json(&task.context)?)
        .bind(&task.context_fingerprint)
        .bind(duration_to_ms(task.schedule.interval))
        .bind(duration_to_ms(task.schedule.timeout))
        .bind(&task.delegate_id)
        .bind(task.paused)
        .bind(task.allow_stale_task_id)
        .bind(&task.description)
        .bind(task.created_at)
        .bind(task.context_updated_at)
        .bind(task.assigned_at)
        .bind(task.last_heartbeat_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_perpetual_task(
        &self,
        account_id: &str,
        id: &str,
    ) -> Result<Option<PerpetualTask>, CoreError> {
        let sql = format!(
            "SELECT {PERPETUAL_TASK_COLUMNS} FROM perpetual_tasks WHERE account_id = ? AND id = ?"
        );
        let row = sqlx::query_as::<_, PerpetualTaskRow>(&sql)
            .bind(account_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PerpetualTaskRow::into_task).transpose()
    }

    async fn find_perpetual_task(
        &self,
        account_id: &str,
        task_type: &str,
        context_fingerprint: &str,
    ) -> Result<Option<PerpetualTask>, CoreError> {
        let sql = format!(
            "SELECT {PERPETUAL_TASK_COLUMNS} FROM perpetual_tasks \
             WHERE account_id = ? AND task_type = ? AND context_fingerprint = ? \
             ORDER BY created_at, id LIMIT 1"
        );
        let row = sqlx::query_as::<_, PerpetualTaskRow>(&sql)
            .bind(account_id)
            .bind(task_type)
            .bind(context_fingerprint)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PerpetualTaskRow::into_task).transpose()
    }

    async fn update_perpetual_task_context(
        &self,
        account_id: &str,
        id: &str,
        context: &PerpetualTaskContext,
        context_fingerprint: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE perpetual_tasks
            SET context = ?1, context_fingerprint = ?2, context_updated_at = ?3
            WHERE account_id = ?4 AND id = ?5
            "#,
        )
        .bind(to_json(context)?)
        .bind(context_fingerprint)
        .bind(updated_at)
        .bind(account_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_perpetual_task(&self, account_id: &str, id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM perpetual_tasks WHERE account_id = ? AND id = ?")
            .bind(account_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_perpetual_task_paused(
        &self,
        account_id: &str,
        id: &str,
        paused: bool,
    ) -> Result<bool, CoreError> {
        let result =
            sqlx::query("UPDATE perpetual_tasks SET paused = ? WHERE account_id = ? AND id = ?")
                .bind(paused)
                .bind(account_id)
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reassign_perpetual_task(
        &self,
        account_id: &str,
        id: &str,
        expected: Option<&str>,
        new_delegate_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE perpetual_tasks
            SET delegate_id = ?1, assigned_at = ?2
            WHERE account_id = ?3
              AND id = ?4
              AND paused = 0
              AND delegate_id IS ?5
            "#,
        )
        .bind(new_delegate_id)
        .bind(new_delegate_id.map(|_| now))
        .bind(account_id)
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_perpetual_tasks(
        &self,
        account_id: &str,
    ) -> Result<Vec<PerpetualTask>, CoreError> {
        let sql = format!(
            "SELECT {PERPETUAL_TASK_COLUMNS} FROM perpetual_tasks \
             WHERE account_id = ? ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, PerpetualTaskRow>(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;

        collect_perpetual_tasks(rows)
    }

    async fn list_perpetual_tasks_for_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Vec<PerpetualTask>, CoreError> {
        let sql = format!(
            "SELECT {PERPETUAL_TASK_COLUMNS} FROM perpetual_tasks \
             WHERE account_id = ? AND delegate_id = ? AND paused = 0 \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, PerpetualTaskRow>(&sql)
            .bind(account_id)
            .bind(delegate_id)
            .fetch_all(&self.pool)
            .await?;

        collect_perpetual_tasks(rows)
    }

    async fn record_perpetual_task_heartbeat(
        &self,
        account_id: &str,
        id: &str,
        delegate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE perpetual_tasks
            SET last_heartbeat_at = ?
            WHERE account_id = ? AND id = ? AND delegate_id = ? AND paused = 0
            "#,
        )
        .bind(now)
        .bind(account_id)
        .bind(id)
        .bind(delegate_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_perpetual_task_accounts(&self) -> Result<Vec<String>, CoreError> {
        let accounts = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT account_id FROM perpetual_tasks ORDER BY account_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn health_check_db(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
