// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence tests. Run with `TEST_DATABASE_URL` pointing at a
//! scratch database; skipped otherwise.

mod common;

use std::time::Duration;

use common::{Engine, ctx, test_dispatcher_config};
use taskgate_core::persistence;
use taskgate_core::perpetual::{NewPerpetualTask, PerpetualTaskSchedule};
use taskgate_core::task::{ExecutionStage, NewTask, TaskStatus};
use uuid::Uuid;

async fn engine(url: &str) -> Engine {
    let persistence = persistence::connect(url, 5).await.expect("connect to postgres");
    persistence.health_check_db().await.expect("postgres health check");
    Engine::new(persistence, test_dispatcher_config())
}

/// Tests share one database; each run gets its own account.
fn unique_account() -> String {
    format!("acct-{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_postgres_task_lifecycle() {
    let url = skip_if_no_db!();
    let engine = engine(&url).await;
    let acct = ctx(&unique_account());
    engine.delegate(&acct, "d1", &["linux"]).await;
    engine.delegate(&acct, "d2", &["linux"]).await;

    let submitted = engine
        .dispatcher
        .submit(&acct, NewTask::new("HTTP", b"{}".to_vec()))
        .await
        .unwrap();
    assert_eq!(submitted.stage, ExecutionStage::Queueing);

    let polled = engine
        .dispatcher
        .poll_tasks(&acct, "d1", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].task_id, submitted.task_id);

    let acquired = engine
        .dispatcher
        .acquire_task(&acct, "d1", &submitted.task_id)
        .await
        .unwrap();
    assert!(acquired.is_some());
    assert!(
        engine
            .dispatcher
            .acquire_task(&acct, "d2", &submitted.task_id)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        engine.dispatcher.task_progress(&acct, &submitted.task_id).await.unwrap(),
        ExecutionStage::Executing
    );

    assert!(
        engine
            .dispatcher
            .report_result(&acct, "d1", &submitted.task_id, TaskStatus::Success, Some(b"ok".to_vec()), None)
            .await
            .unwrap()
    );
    let record = engine
        .dispatcher
        .get_task(&acct, &submitted.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Success);
    assert_eq!(record.result.as_deref(), Some(&b"ok"[..]));

    // Another account cannot see the task.
    let other = ctx(&unique_account());
    assert_eq!(
        engine.dispatcher.task_progress(&other, &submitted.task_id).await.unwrap(),
        ExecutionStage::TypeUnspecified
    );
}

#[tokio::test]
async fn test_postgres_perpetual_task_assignment() {
    let url = skip_if_no_db!();
    let engine = engine(&url).await;
    let account_id = unique_account();
    let acct = ctx(&account_id);
    engine.delegate(&acct, "d1", &[]).await;

    let new_task = || NewPerpetualTask {
        task_type: "K8S_WATCH".to_string(),
        client_context: Some([("clusterId".to_string(), "c1".to_string())].into_iter().collect()),
        execution_bundle: None,
        schedule: PerpetualTaskSchedule {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        },
        allow_stale_task_id: false,
        description: String::new(),
    };
    let id = engine.scheduler.create_task(&acct, new_task()).await.unwrap();
    assert_eq!(engine.scheduler.create_task(&acct, new_task()).await.unwrap(), id);

    let summary = engine.scheduler.rebalance_account(&account_id, 2).await.unwrap();
    assert_eq!(summary.applied, 1);

    let assigned = engine.scheduler.list_assigned_tasks(&acct, "d1").await.unwrap();
    assert_eq!(assigned.len(), 1);
    assert!(engine.scheduler.heartbeat(&acct, &id, "d1").await.unwrap());
    assert!(!engine.scheduler.heartbeat(&acct, &id, "d2").await.unwrap());

    assert!(engine.scheduler.delete_task(&acct, &id).await.unwrap());
    assert!(!engine.scheduler.delete_task(&acct, &id).await.unwrap());
}
