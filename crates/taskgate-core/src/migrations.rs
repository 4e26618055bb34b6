// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema for the task store.
//!
//! One schema per backend, same tables in both: `delegates`,
//! `delegate_tasks`, `task_progress`, `delegate_callbacks` and
//! `perpetual_tasks`. [`persistence::connect`](crate::persistence::connect)
//! applies them automatically; callers that bring their own pool run them
//! first:
//!
//! ```ignore
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! taskgate_core::migrations::run_postgres(&pool).await?;
//! let persistence = taskgate_core::persistence::PostgresPersistence::new(pool);
//! ```

use sqlx::migrate::{MigrateError, Migrator};

/// Tables every backend must provide.
pub const TABLES: [&str; 5] = [
    "delegates",
    "delegate_tasks",
    "task_progress",
    "delegate_callbacks",
    "perpetual_tasks",
];

pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgresql");

pub static SQLITE: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Bring a Postgres database up to date. Idempotent.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Bring a SQLite database up to date. Idempotent.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
