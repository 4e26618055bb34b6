// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for taskgate-core integration tests.
//!
//! Engine tests run on SQLite in memory. Postgres tests skip unless
//! `TEST_DATABASE_URL` is set.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;

use taskgate_core::callback::{CallbackRegistration, CallbackRegistry};
use taskgate_core::capability::{DelegateFacts, ScopingRules};
use taskgate_core::context::RequestContext;
use taskgate_core::delegate::{DelegateRecord, DelegateRegistration, DelegateRegistry};
use taskgate_core::dispatcher::{DispatcherConfig, TaskBroadcaster, TaskDispatcher};
use taskgate_core::error::CoreError;
use taskgate_core::perpetual::{PerpetualTask, PerpetualTaskContext};
use taskgate_core::perpetual_scheduler::PerpetualTaskScheduler;
use taskgate_core::persistence::{Persistence, SqlitePersistence};
use taskgate_core::service::DelegateService;
use taskgate_core::task::{DelegateTask, ProgressRecord, TaskOutcome};

/// Skip the current test when `TEST_DATABASE_URL` is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("Skipping test: TEST_DATABASE_URL not set");
                return;
            }
        }
    };
}

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Migrated in-memory SQLite store. One connection, so every query sees
/// the same database.
pub async fn memory_persistence() -> Arc<dyn Persistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    taskgate_core::migrations::run_sqlite(&pool)
        .await
        .expect("run sqlite migrations");
    Arc::new(SqlitePersistence::new(pool))
}

/// Dispatcher settings with short waits for tests.
pub fn test_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        sync_wait: Duration::from_millis(300),
        sync_poll_interval: Duration::from_millis(20),
        broadcast_grace: Duration::ZERO,
        ..DispatcherConfig::default()
    }
}

/// Engine components sharing one store.
pub struct Engine {
    pub persistence: Arc<dyn Persistence>,
    pub broadcasts: Arc<CountingBroadcaster>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub scheduler: Arc<PerpetualTaskScheduler>,
    pub callbacks: Arc<CallbackRegistry>,
    pub delegates: Arc<DelegateRegistry>,
    pub service: Arc<DelegateService>,
}

impl Engine {
    pub fn new(persistence: Arc<dyn Persistence>, config: DispatcherConfig) -> Self {
        let broadcasts = Arc::new(CountingBroadcaster::default());
        let dispatcher = Arc::new(
            TaskDispatcher::new(persistence.clone(), config).with_broadcaster(broadcasts.clone()),
        );
        let scheduler = Arc::new(PerpetualTaskScheduler::new(
            persistence.clone(),
            HEARTBEAT_TIMEOUT,
        ));
        let callbacks = Arc::new(CallbackRegistry::new(persistence.clone()));
        let delegates = Arc::new(DelegateRegistry::new(persistence.clone(), HEARTBEAT_TIMEOUT));
        let service = Arc::new(DelegateService::new(
            dispatcher.clone(),
            scheduler.clone(),
            callbacks.clone(),
            delegates.clone(),
        ));
        Self {
            persistence,
            broadcasts,
            dispatcher,
            scheduler,
            callbacks,
            delegates,
            service,
        }
    }

    /// Fresh in-memory engine with test settings.
    pub async fn in_memory() -> Self {
        Self::new(memory_persistence().await, test_dispatcher_config())
    }

    /// Register a live delegate advertising `tags`.
    pub async fn delegate(&self, ctx: &RequestContext, delegate_id: &str, tags: &[&str]) -> DelegateRecord {
        self.delegates
            .register(
                ctx,
                DelegateRegistration {
                    delegate_id: delegate_id.to_string(),
                    host_name: format!("{}.local", delegate_id),
                    facts: DelegateFacts {
                        tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
                        ..Default::default()
                    },
                },
            )
            .await
            .expect("register delegate")
    }
}

pub fn ctx(account_id: &str) -> RequestContext {
    RequestContext::new(account_id).expect("valid account id")
}

/// Broadcaster that counts the tasks it was handed.
#[derive(Default)]
pub struct CountingBroadcaster {
    count: AtomicUsize,
    task_ids: std::sync::Mutex<Vec<String>>,
}

impl CountingBroadcaster {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.task_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskBroadcaster for CountingBroadcaster {
    async fn broadcast_new_task(&self, task: &DelegateTask) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.task_ids.lock().unwrap().push(task.task_id.clone());
    }
}

/// Store whose every call fails, counting the calls it saw.
#[derive(Default)]
pub struct FailingPersistence {
    calls: AtomicUsize,
}

impl FailingPersistence {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self, operation: &str) -> Result<T, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CoreError::DatabaseError {
            operation: operation.to_string(),
            details: "connection refused (os error 111)".to_string(),
        })
    }
}

#[async_trait]
impl Persistence for FailingPersistence {
    async fn insert_task(&self, _task: &DelegateTask) -> Result<(), CoreError> {
        self.fail("insert_task")
    }

    async fn get_task(&self, _: &str, _: &str) -> Result<Option<DelegateTask>, CoreError> {
        self.fail("get_task")
    }

    async fn queue_parked_task(
        &self,
        _: &str,
        _: &str,
        _: &[String],
        _: Option<&str>,
        _: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.fail("queue_parked_task")
    }

    async fn assign_task(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.fail("assign_task")
    }

    async fn finish_task(&self, _: &str, _: &str, _: &TaskOutcome) -> Result<bool, CoreError> {
        self.fail("finish_task")
    }

    async fn list_queued_tasks(&self, _: &str, _: i64, _: i64) -> Result<Vec<DelegateTask>, CoreError> {
        self.fail("list_queued_tasks")
    }

    async fn count_started_tasks_by_delegate(
        &self,
        _: &str,
    ) -> Result<BTreeMap<String, i64>, CoreError> {
        self.fail("count_started_tasks_by_delegate")
    }

    async fn list_expired_tasks(
        &self,
        _: DateTime<Utc>,
        _: i64,
    ) -> Result<Vec<DelegateTask>, CoreError> {
        self.fail("list_expired_tasks")
    }

    async fn list_tasks_of_lost_delegates(
        &self,
        _: DateTime<Utc>,
        _: i64,
    ) -> Result<Vec<DelegateTask>, CoreError> {
        self.fail("list_tasks_of_lost_delegates")
    }

    async fn list_aborted_tasks_for_delegate(
        &self,
        _: &str,
        _: &str,
        _: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError> {
        self.fail("list_aborted_tasks_for_delegate")
    }

    async fn insert_progress(&self, _: &ProgressRecord) -> Result<(), CoreError> {
        self.fail("insert_progress")
    }

    async fn list_progress(&self, _: &str, _: &str) -> Result<Vec<ProgressRecord>, CoreError> {
        self.fail("list_progress")
    }

    async fn insert_callback(&self, _: &CallbackRegistration) -> Result<(), CoreError> {
        self.fail("insert_callback")
    }

    async fn get_callback(&self, _: &str) -> Result<Option<CallbackRegistration>, CoreError> {
        self.fail("get_callback")
    }

    async fn upsert_delegate(&self, _: &DelegateRecord) -> Result<(), CoreError> {
        self.fail("upsert_delegate")
    }

    async fn get_delegate(&self, _: &str, _: &str) -> Result<Option<DelegateRecord>, CoreError> {
        self.fail("get_delegate")
    }

    async fn touch_delegate(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<bool, CoreError> {
        self.fail("touch_delegate")
    }

    async fn update_scoping_rules(
        &self,
        _: &str,
        _: &str,
        _: &ScopingRules,
    ) -> Result<bool, CoreError> {
        self.fail("update_scoping_rules")
    }

    async fn list_live_delegates(
        &self,
        _: &str,
        _: DateTime<Utc>,
    ) -> Result<Vec<DelegateRecord>, CoreError> {
        self.fail("list_live_delegates")
    }

    async fn insert_perpetual_task(&self, _: &PerpetualTask) -> Result<(), CoreError> {
        self.fail("insert_perpetual_task")
    }

    async fn get_perpetual_task(&self, _: &str, _: &str) -> Result<Option<PerpetualTask>, CoreError> {
        self.fail("get_perpetual_task")
    }

    async fn find_perpetual_task(
        &self,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<Option<PerpetualTask>, CoreError> {
        self.fail("find_perpetual_task")
    }

    async fn update_perpetual_task_context(
        &self,
        _: &str,
        _: &str,
        _: &PerpetualTaskContext,
        _: &str,
        _: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.fail("update_perpetual_task_context")
    }

    async fn delete_perpetual_task(&self, _: &str, _: &str) -> Result<bool, CoreError> {
        self.fail("delete_perpetual_task")
    }

    async fn set_perpetual_task_paused(&self, _: &str, _: &str, _: bool) -> Result<bool, CoreError> {
        self.fail("set_perpetual_task_paused")
    }

    async fn reassign_perpetual_task(
        &self,
        _: &str,
        _: &str,
        _: Option<&str>,
        _: Option<&str>,
        _: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.fail("reassign_perpetual_task")
    }

    async fn list_perpetual_tasks(&self, _: &str) -> Result<Vec<PerpetualTask>, CoreError> {
        self.fail("list_perpetual_tasks")
    }

    async fn list_perpetual_tasks_for_delegate(
        &self,
        _: &str,
        _: &str,
    ) -> Result<Vec<PerpetualTask>, CoreError> {
        self.fail("list_perpetual_tasks_for_delegate")
    }

    async fn record_perpetual_task_heartbeat(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.fail("record_perpetual_task_heartbeat")
    }

    async fn list_perpetual_task_accounts(&self) -> Result<Vec<String>, CoreError> {
        self.fail("list_perpetual_task_accounts")
    }

    async fn health_check_db(&self) -> Result<(), CoreError> {
        self.fail("health_check_db")
    }
}
