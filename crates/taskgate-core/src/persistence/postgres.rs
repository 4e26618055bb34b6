// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Each statement is exposed as a free function over a [`PgPool`] so
//! embedders can run them inside their own transactions; the
//! [`Persistence`] impl delegates to them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

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

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Delegate Task Operations
// ============================================================================

/// Insert a new task record.
pub async fn insert_task(pool: &PgPool, task: &DelegateTask) -> Result<(), CoreError> {
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
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
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
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a task scoped to its account.
pub async fn get_task(
    pool: &PgPool,
    account_id: &str,
    task_id: &str,
) -> Result<Option<DelegateTask>, CoreError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM delegate_tasks t WHERE t.account_id = $1 AND t.task_id = $2"
    );
    let row = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(account_id)
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    row.map(TaskRow::into_task).transpose()
}

/// Move a parked task to the queue.
pub async fn queue_parked_task(
    pool: &PgPool,
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
            eligible_delegate_ids = $1,
            preferred_delegate_id = $2,
            expires_at = $3
        WHERE account_id = $4
          AND task_id = $5
          AND status = 'parked'
        "#,
    )
    .bind(to_json(eligible_delegate_ids)?)
    .bind(preferred_delegate_id)
    .bind(expires_at)
    .bind(account_id)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Claim a queued, unassigned task for a delegate.
pub async fn assign_task(
    pool: &PgPool,
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
            delegate_id = $1,
            assigned_at = $2,
            expires_at = $3
        WHERE account_id = $4
          AND task_id = $5
          AND status = 'queued'
          AND delegate_id IS NULL
        "#,
    )
    .bind(delegate_id)
    .bind(assigned_at)
    .bind(expires_at)
    .bind(account_id)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Terminal write, guarded on a non-terminal current status.
pub async fn finish_task(
    pool: &PgPool,
    account_id: &str,
    task_id: &str,
    outcome: &TaskOutcome,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE delegate_tasks
        SET status = $1,
            result = $2,
            error_message = $3,
            finished_at = $4
        WHERE account_id = $5
          AND task_id = $6
          AND status IN ('parked', 'queued', 'started')
        "#,
    )
    .bind(outcome.status.as_str())
    .bind(&outcome.result)
    .bind(&outcome.error_message)
    .bind(outcome.finished_at)
    .bind(account_id)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// One page of queued tasks of an account, oldest first.
pub async fn list_queued_tasks(
    pool: &PgPool,
    account_id: &str,
    offset: i64,
    limit: i64,
) -> Result<Vec<DelegateTask>, CoreError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM delegate_tasks t \
         WHERE t.account_id = $1 AND t.status = 'queued' \
         ORDER BY t.created_at, t.task_id LIMIT $2 OFFSET $3"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    collect_tasks(rows)
}

/// Running task count per delegate.
pub async fn count_started_tasks_by_delegate(
    pool: &PgPool,
    account_id: &str,
) -> Result<BTreeMap<String, i64>, CoreError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT delegate_id, COUNT(*)
        FROM delegate_tasks
        WHERE account_id = $1
          AND status = 'started'
          AND delegate_id IS NOT NULL
        GROUP BY delegate_id
        "#,
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Non-terminal tasks past their expiry.
pub async fn list_expired_tasks(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<DelegateTask>, CoreError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM delegate_tasks t \
         WHERE t.status IN ('parked', 'queued', 'started') \
           AND t.expires_at IS NOT NULL AND t.expires_at < $1 \
         ORDER BY t.expires_at LIMIT $2"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    collect_tasks(rows)
}

/// Started tasks whose delegate is unknown or silent.
pub async fn list_tasks_of_lost_delegates(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<DelegateTask>, CoreError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM delegate_tasks t \
         LEFT JOIN delegates d \
           ON d.account_id = t.account_id AND d.delegate_id = t.delegate_id \
         WHERE t.status = 'started' \
           AND (d.delegate_id IS NULL OR d.last_heartbeat_at < $1) \
         ORDER BY t.assigned_at LIMIT $2"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    collect_tasks(rows)
}

/// Recently aborted tasks held by a delegate.
pub async fn list_aborted_tasks_for_delegate(
    pool: &PgPool,
    account_id: &str,
    delegate_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<String>, CoreError> {
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT task_id
        FROM delegate_tasks
        WHERE account_id = $1
          AND delegate_id = $2
          AND status = 'aborted'
          AND finished_at >= $3
        ORDER BY finished_at, task_id
        "#,
    )
    .bind(account_id)
    .bind(delegate_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

// ============================================================================
// Progress and Callback Operations
// ============================================================================

pub async fn insert_progress(pool: &PgPool, record: &ProgressRecord) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO task_progress (account_id, task_id, callback_token, payload, received_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&record.account_id)
    .bind(&record.task_id)
    .bind(&record.callback_token)
    .bind(&record.payload)
    .bind(record.received_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_progress(
    pool: &PgPool,
    account_id: &str,
    task_id: &str,
) -> Result<Vec<ProgressRecord>, CoreError> {
    let rows = sqlx::query_as::<_, ProgressRow>(
        r#"
        SELECT account_id, task_id, callback_token, payload, received_at
        FROM task_progress
        WHERE account_id = $1 AND task_id = $2
        ORDER BY id
        "#,
    )
    .bind(account_id)
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(ProgressRecord::from).collect())
}

pub async fn insert_callback(
    pool: &PgPool,
    registration: &CallbackRegistration,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO delegate_callbacks (token, destination, created_at)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(&registration.token)
    .bind(to_json(&registration.destination)?)
    .bind(registration.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_callback(
    pool: &PgPool,
    token: &str,
) -> Result<Option<CallbackRegistration>, CoreError> {
    let row = sqlx::query_as::<_, CallbackRow>(
        "SELECT token, destination, created_at FROM delegate_callbacks WHERE token = $1",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    row.map(CallbackRow::into_registration).transpose()
}

// ============================================================================
// Delegate Operations
// ============================================================================

/// Insert a delegate or refresh its host, facts and heartbeat.
pub async fn upsert_delegate(pool: &PgPool, delegate: &DelegateRecord) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO delegates (
            account_id, delegate_id, host_name, facts, scoping_rules,
            registered_at, last_heartbeat_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (account_id, delegate_id) DO UPDATE SET
            host_name = EXCLUDED.host_name,
            facts = EXCLUDED.facts,
            last_heartbeat_at = EXCLUDED.last_heartbeat_at
        "#,
    )
    .bind(&delegate.account_id)
    .bind(&delegate.delegate_id)
    .bind(&delegate.host_name)
    .bind(to_json(&delegate.facts)?)
    .bind(to_json(&delegate.scoping_rules)?)
    .bind(delegate.registered_at)
    .bind(delegate.last_heartbeat_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_delegate(
    pool: &PgPool,
    account_id: &str,
    delegate_id: &str,
) -> Result<Option<DelegateRecord>, CoreError> {
    let row = sqlx::query_as::<_, DelegateRow>(
        r#"
        SELECT account_id, delegate_id, host_name, facts, scoping_rules,
               registered_at, last_heartbeat_at
        FROM delegates
        WHERE account_id = $1 AND delegate_id = $2
        "#,
    )
    .bind(account_id)
    .bind(delegate_id)
    .fetch_optional(pool)
    .await?;

    row.map(DelegateRow::into_record).transpose()
}

pub async fn touch_delegate(
    pool: &PgPool,
    account_id: &str,
    delegate_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        "UPDATE delegates SET last_heartbeat_at = $1 WHERE account_id = $2 AND delegate_id = $3",
    )
    .bind(now)
    .bind(account_id)
    .bind(delegate_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn update_scoping_rules(
    pool: &PgPool,
    account_id: &str,
    delegate_id: &str,
    rules: &ScopingRules,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        "UPDATE delegates SET scoping_rules = $1 WHERE account_id = $2 AND delegate_id = $3",
    )
    .bind(to_json(rules)?)
    .bind(account_id)
    .bind(delegate_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_live_delegates(
    pool: &PgPool,
    account_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<DelegateRecord>, CoreError> {
    let rows = sqlx::query_as::<_, DelegateRow>(
        r#"
        SELECT account_id, delegate_id, host_name, facts, scoping_rules,
               registered_at, last_heartbeat_at
        FROM delegates
        WHERE account_id = $1 AND last_heartbeat_at >= $2
        ORDER BY delegate_id
        "#,
    )
    .bind(account_id)
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(DelegateRow::into_record).collect()
}

// ============================================================================
// Perpetual Task Operations
// ============================================================================

pub async fn insert_perpetual_task(pool: &PgPool, task: &PerpetualTask) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO perpetual_tasks (
            id, account_id, task_type, context, context_fingerprint, interval_ms,
            timeout_ms, delegate_id, paused, allow_stale_task_id, description,
            created_at, context_updated_at, assigned_at, last_heartbeat_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
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
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_perpetual_task(
    pool: &PgPool,
    account_id: &str,
    id: &str,
) -> Result<Option<PerpetualTask>, CoreError> {
    let sql = format!(
        "SELECT {PERPETUAL_TASK_COLUMNS} FROM perpetual_tasks WHERE account_id = $1 AND id = $2"
    );
    let row = sqlx::query_as::<_, PerpetualTaskRow>(&sql)
        .bind(account_id)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(PerpetualTaskRow::into_task).transpose()
}

pub async fn find_perpetual_task(
    pool: &PgPool,
    account_id: &str,
    task_type: &str,
    context_fingerprint: &str,
) -> Result<Option<PerpetualTask>, CoreError> {
    let sql = format!(
        "SELECT {PERPETUAL_TASK_COLUMNS} FROM perpetual_tasks \
         WHERE account_id = $1 AND task_type = $2 AND context_fingerprint = $3 \
         ORDER BY created_at, id LIMIT 1"
    );
    let row = sqlx::query_as::<_, PerpetualTaskRow>(&sql)
        .bind(account_id)
        .bind(task_type)
        .bind(context_fingerprint)
        .fetch_optional(pool)
        .await?;

    row.map(PerpetualTaskRow::into_task).transpose()
}

pub async fn update_perpetual_task_context(
    pool: &PgPool,
    account_id: &str,
    id: &str,
    context: &PerpetualTaskContext,
    context_fingerprint: &str,
    updated_at: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE perpetual_tasks
        SET context = $1, context_fingerprint = $2, context_updated_at = $3
        WHERE account_id = $4 AND id = $5
        "#,
    )
    .bind(to_json(context)?)
    .bind(context_fingerprint)
    .bind(updated_at)
    .bind(account_id)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete_perpetual_task(
    pool: &PgPool,
    account_id: &str,
    id: &str,
) -> Result<bool, CoreError> {
    let result = sqlx::query("DELETE FROM perpetual_tasks WHERE account_id = $1 AND id = $2")
        .bind(account_id)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn set_perpetual_task_paused(
    pool: &PgPool,
    account_id: &str,
    id: &str,
    paused: bool,
) -> Result<bool, CoreError> {
    let result =
        sqlx::query("UPDATE perpetual_tasks SET paused = $1 WHERE account_id = $2 AND id = $3")
            .bind(paused)
            .bind(account_id)
            .bind(id)
            .execute(pool)
            .await?;

    Ok(result.rows_affected() > 0)
}

/// Assignment compare-and-swap.
pub async fn reassign_perpetual_task(
    pool: &PgPool,
    account_id: &str,
    id: &str,
    expected: Option<&str>,
    new_delegate_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE perpetual_tasks
        SET delegate_id = $1, assigned_at = $2
        WHERE account_id = $3
          AND id = $4
          AND paused = FALSE
          AND delegate_id IS NOT DISTINCT FROM $5
        "#,
    )
    .bind(new_delegate_id)
    .bind(new_delegate_id.map(|_| now))
    .bind(account_id)
    .bind(id)
    .bind(expected)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_perpetual_tasks(
    pool: &PgPool,
    account_id: &str,
) -> Result<Vec<PerpetualTask>, CoreError> {
    let sql = format!(
        "SELECT {PERPETUAL_TASK_COLUMNS} FROM perpetual_tasks \
         WHERE account_id = $1 ORDER BY created_at, id"
    );
    let rows = sqlx::query_as::<_, PerpetualTaskRow>(&sql)
        .bind(account_id)
        .fetch_all(pool)
        .await?;

    collect_perpetual_tasks(rows)
}

pub async fn list_perpetual_tasks_for_delegate(
    pool: &PgPool,
    account_id: &str,
    delegate_id: &str,
) -> Result<Vec<PerpetualTask>, CoreError> {
    let sql = format!(
        "SELECT {PERPETUAL_TASK_COLUMNS} FROM perpetual_tasks \
         WHERE account_id = $1 AND delegate_id = $2 AND paused = FALSE \
         ORDER BY created_at, id"
    );
    let rows = sqlx::query_as::<_, PerpetualTaskRow>(&sql)
        .bind(account_id)
        .bind(delegate_id)
        .fetch_all(pool)
        .await?;

    collect_perpetual_tasks(rows)
}

pub async fn record_perpetual_task_heartbeat(
    pool: &PgPool,
    account_id: &str,
    id: &str,
    delegate_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE perpetual_tasks
        SET last_heartbeat_at = $1
        WHERE account_id = $2 AND id = $3 AND delegate_id = $4 AND paused = FALSE
        "#,
    )
    .bind(now)
    .bind(account_id)
    .bind(id)
    .bind(delegate_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_perpetual_task_accounts(pool: &PgPool) -> Result<Vec<String>, CoreError> {
    let accounts = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT account_id FROM perpetual_tasks ORDER BY account_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(accounts)
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_task(&self, task: &DelegateTask) -> Result<(), CoreError> {
        insert_task(&self.pool, task).await
    }

    async fn get_task(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Option<DelegateTask>, CoreError> {
        get_task(&self.pool, account_id, task_id).await
    }

    async fn queue_parked_task(
        &self,
        account_id: &str,
        task_id: &str,
        eligible_delegate_ids: &[String],
        preferred_delegate_id: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        queue_parked_task(
            &self.pool,
            account_id,
            task_id,
            eligible_delegate_ids,
            preferred_delegate_id,
            expires_at,
        )
        .await
    }

    async fn assign_task(
        &self,
        account_id: &str,
        task_id: &str,
        delegate_id: &str,
        assigned_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        assign_task(
            &self.pool,
            account_id,
            task_id,
            delegate_id,
            assigned_at,
            expires_at,
        )
        .await
    }

    async fn finish_task(
        &self,
        account_id: &str,
        task_id: &str,
        outcome: &TaskOutcome,
    ) -> Result<bool, CoreError> {
        finish_task(&self.pool, account_id, task_id, outcome).await
    }

    async fn list_queued_tasks(
        &self,
        account_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DelegateTask>, CoreError> {
        list_queued_tasks(&self.pool, account_id, offset, limit).await
    }

    async fn count_started_tasks_by_delegate(
        &self,
        account_id: &str,
    ) -> Result<BTreeMap<String, i64>, CoreError> {
        count_started_tasks_by_delegate(&self.pool, account_id).await
    }

    async fn list_expired_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DelegateTask>, CoreError> {
        list_expired_tasks(&self.pool, now, limit).await
    }

    async fn list_tasks_of_lost_delegates(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DelegateTask>, CoreError> {
        list_tasks_of_lost_delegates(&self.pool, cutoff, limit).await
    }

    async fn list_aborted_tasks_for_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError> {
        list_aborted_tasks_for_delegate(&self.pool, account_id, delegate_id, since).await
    }

    async fn insert_progress(&self, record: &ProgressRecord) -> Result<(), CoreError> {
        insert_progress(&self.pool, record).await
    }

    async fn list_progress(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Vec<ProgressRecord>, CoreError> {
        list_progress(&self.pool, account_id, task_id).await
    }

    async fn insert_callback(&self, registration: &CallbackRegistration) -> Result<(), CoreError> {
        insert_callback(&self.pool, registration).await
    }

    async fn get_callback(&self, token: &str) -> Result<Option<CallbackRegistration>, CoreError> {
        get_callback(&self.pool, token).await
    }

    async fn upsert_delegate(&self, delegate: &DelegateRecord) -> Result<(), CoreError> {
        upsert_delegate(&self.pool, delegate).await
    }

    async fn get_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Option<DelegateRecord>, CoreError> {
        get_delegate(&self.pool, account_id, delegate_id).await
    }

    async fn touch_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        touch_delegate(&self.pool, account_id, delegate_id, now).await
    }

    async fn update_scoping_rules(
        &self,
        account_id: &str,
        delegate_id: &str,
        rules: &ScopingRules,
    ) -> Result<bool, CoreError> {
        update_scoping_rules(&self.pool, account_id, delegate_id, rules).await
    }

    async fn list_live_delegates(
        &self,
        account_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DelegateRecord>, CoreError> {
        list_live_delegates(&self.pool, account_id, cutoff).await
    }

    async fn insert_perpetual_task(&self, task: &PerpetualTask) -> Result<(), CoreError> {
        insert_perpetual_task(&self.pool, task).await
    }

    async fn get_perpetual_task(
        &self,
        account_id: &str,
        id: &str,
    ) -> Result<Option<PerpetualTask>, CoreError> {
        get_perpetual_task(&self.pool, account_id, id).await
    }

    async fn find_perpetual_task(
        &self,
        account_id: &str,
        task_type: &str,
        context_fingerprint: &str,
    ) -> Result<Option<PerpetualTask>, CoreError> {
        find_perpetual_task(&self.pool, account_id, task_type, context_fingerprint).await
    }

    async fn update_perpetual_task_context(
        &self,
        account_id: &str,
        id: &str,
        context: &PerpetualTaskContext,
        context_fingerprint: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        update_perpetual_task_context(
            &self.pool,
            account_id,
            id,
            context,
            context_fingerprint,
            updated_at,
        )
        .await
    }

    async fn delete_perpetual_task(&self, account_id: &str, id: &str) -> Result<bool, CoreError> {
        delete_perpetual_task(&self.pool, account_id, id).await
    }

    async fn set_perpetual_task_paused(
        &self,
        account_id: &str,
        id: &str,
        paused: bool,
    ) -> Result<bool, CoreError> {
        set_perpetual_task_paused(&self.pool, account_id, id, paused).await
    }

    async fn reassign_perpetual_task(
        &self,
        account_id: &str,
        id: &str,
        expected: Option<&str>,
        new_delegate_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        reassign_perpetual_task(&self.pool, account_id, id, expected, new_delegate_id, now).await
    }

    async fn list_perpetual_tasks(
        &self,
        account_id: &str,
    ) -> Result<Vec<PerpetualTask>, CoreError> {
        list_perpetual_tasks(&self.pool, account_id).await
    }

    async fn list_perpetual_tasks_for_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Vec<PerpetualTask>, CoreError> {
        list_perpetual_tasks_for_delegate(&self.pool, account_id, delegate_id).await
    }

    async fn record_perpetual_task_heartbeat(
        &self,
        account_id: &str,
        id: &str,
        delegate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        record_perpetual_task_heartbeat(&self.pool, account_id, id, delegate_id, now).await
    }

    async fn list_perpetual_task_accounts(&self) -> Result<Vec<String>, CoreError> {
        list_perpetual_task_accounts(&self.pool).await
    }

    async fn health_check_db(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
