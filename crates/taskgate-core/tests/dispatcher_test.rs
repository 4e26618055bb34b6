// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task lifecycle tests against an in-memory SQLite store.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{Engine, ctx, memory_persistence, test_dispatcher_config};
use futures::future::join_all;
use taskgate_core::capability::ScopingRules;
use taskgate_core::dispatcher::DispatcherConfig;
use taskgate_core::error::CoreError;
use taskgate_core::reaper::{TaskReaper, TaskReaperConfig};
use taskgate_core::task::{ExecutionStage, NewTask, TaskMode, TaskSelector, TaskStatus};

fn http_task() -> NewTask {
    NewTask::new("HTTP", br#"{"url":"https://example.com"}"#.to_vec())
}

#[tokio::test]
async fn test_parked_task_is_never_queued_or_broadcast() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;

    let submitted = engine
        .dispatcher
        .submit(
            &acct,
            NewTask {
                parked: true,
                ..http_task()
            },
        )
        .await
        .unwrap();

    assert_eq!(submitted.stage, ExecutionStage::Parked);
    let task = engine.dispatcher.get_task(&acct, &submitted.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Parked);
    assert!(task.delegate_id.is_none());
    assert!(task.eligible_delegate_ids.is_empty());
    assert_eq!(engine.broadcasts.count(), 0);

    // Parked tasks are invisible to delegates.
    let polled = engine
        .dispatcher
        .poll_tasks(&acct, "d1", 10, Duration::ZERO)
        .await
        .unwrap();
    assert!(polled.is_empty());
    assert!(
        engine
            .dispatcher
            .acquire_task(&acct, "d1", &submitted.task_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_queue_parked_task_releases_it() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;

    let submitted = engine
        .dispatcher
        .submit(
            &acct,
            NewTask {
                parked: true,
                ..http_task()
            },
        )
        .await
        .unwrap();

    assert!(engine.dispatcher.queue_parked_task(&acct, &submitted.task_id).await.unwrap());
    // Second release is a no-op.
    assert!(!engine.dispatcher.queue_parked_task(&acct, &submitted.task_id).await.unwrap());
    assert!(!engine.dispatcher.queue_parked_task(&acct, "missing").await.unwrap());

    let task = engine.dispatcher.get_task(&acct, &submitted.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.eligible_delegate_ids, vec!["d1".to_string()]);
    assert!(task.expires_at.is_some());
    assert_eq!(engine.broadcasts.task_ids(), vec![submitted.task_id]);
}

#[tokio::test]
async fn test_sync_submission_records_abstractions_and_broadcasts_once() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");

    let setup: BTreeMap<String, String> = [("appId", "A"), ("envId", "E")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let submitted = engine
        .dispatcher
        .submit(
            &acct,
            NewTask {
                mode: TaskMode::Sync,
                setup_abstractions: setup.clone(),
                ..http_task()
            },
        )
        .await
        .unwrap();

    // Nobody picked it up within the bounded wait.
    assert_eq!(submitted.stage, ExecutionStage::Queueing);
    let task = engine.dispatcher.get_task(&acct, &submitted.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.mode, TaskMode::Sync);
    assert_eq!(task.setup_abstractions, setup);
    assert_eq!(engine.broadcasts.count(), 1);
}

#[tokio::test]
async fn test_sync_submission_returns_once_result_is_reported() {
    let engine = Arc::new(Engine::new(
        memory_persistence().await,
        DispatcherConfig {
            sync_wait: Duration::from_secs(10),
            ..test_dispatcher_config()
        },
    ));
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;

    let submitter = {
        let engine = engine.clone();
        let acct = acct.clone();
        tokio::spawn(async move {
            engine
                .dispatcher
                .submit(
                    &acct,
                    NewTask {
                        mode: TaskMode::Sync,
                        ..http_task()
                    },
                )
                .await
        })
    };

    let polled = engine
        .dispatcher
        .poll_tasks(&acct, "d1", 10, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(polled.len(), 1);
    let task_id = polled[0].task_id.clone();

    let acquired = engine.dispatcher.acquire_task(&acct, "d1", &task_id).await.unwrap().unwrap();
    assert_eq!(acquired.status, TaskStatus::Started);
    assert!(
        engine
            .dispatcher
            .report_result(&acct, "d1", &task_id, TaskStatus::Success, Some(b"ok".to_vec()), None)
            .await
            .unwrap()
    );

    let submitted = submitter.await.unwrap().unwrap();
    assert_eq!(submitted.task_id, task_id);
    assert_eq!(submitted.stage, ExecutionStage::Finished);

    let task = engine.dispatcher.get_task(&acct, &task_id).await.unwrap().unwrap();
    assert_eq!(task.result.as_deref(), Some(&b"ok"[..]));
}

#[tokio::test]
async fn test_same_parameters_in_two_accounts_are_independent() {
    let engine = Engine::in_memory().await;
    let a = ctx("acct-a");
    let b = ctx("acct-b");

    let ta = engine.dispatcher.submit(&a, http_task()).await.unwrap();
    let tb = engine.dispatcher.submit(&b, http_task()).await.unwrap();
    assert_ne!(ta.task_id, tb.task_id);

    // Accounts do not see each other's tasks.
    let cross = engine.dispatcher.cancel(&b, &ta.task_id).await.unwrap();
    assert_eq!(cross.stage, ExecutionStage::TypeUnspecified);
    assert!(!cross.aborted);

    let cancelled = engine.dispatcher.cancel(&a, &ta.task_id).await.unwrap();
    assert_eq!(cancelled.stage, ExecutionStage::Queueing);
    assert!(cancelled.aborted);

    assert_eq!(
        engine.dispatcher.task_progress(&a, &ta.task_id).await.unwrap(),
        ExecutionStage::Aborted
    );
    assert_eq!(
        engine.dispatcher.task_progress(&b, &tb.task_id).await.unwrap(),
        ExecutionStage::Queueing
    );
    assert!(engine.dispatcher.cancel(&b, &tb.task_id).await.unwrap().aborted);
}

#[tokio::test]
async fn test_unknown_task_reports_type_unspecified() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");

    let outcome = engine.dispatcher.cancel(&acct, "no-such-task").await.unwrap();
    assert_eq!(outcome.stage, ExecutionStage::TypeUnspecified);
    assert!(!outcome.aborted);
    assert_eq!(
        engine.dispatcher.task_progress(&acct, "no-such-task").await.unwrap(),
        ExecutionStage::TypeUnspecified
    );
}

#[tokio::test]
async fn test_cancel_started_task_reports_executing() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;

    let submitted = engine.dispatcher.submit(&acct, http_task()).await.unwrap();
    engine
        .dispatcher
        .acquire_task(&acct, "d1", &submitted.task_id)
        .await
        .unwrap()
        .unwrap();

    let outcome = engine.dispatcher.cancel(&acct, &submitted.task_id).await.unwrap();
    assert_eq!(outcome.stage, ExecutionStage::Executing);
    assert!(outcome.aborted);

    // The delegate learns about it cooperatively.
    let aborted = engine.dispatcher.list_aborted_tasks(&acct, "d1").await.unwrap();
    assert_eq!(aborted, vec![submitted.task_id.clone()]);

    // A late result does not resurrect the task.
    assert!(
        !engine
            .dispatcher
            .report_result(&acct, "d1", &submitted.task_id, TaskStatus::Success, None, None)
            .await
            .unwrap()
    );
    assert_eq!(
        engine.dispatcher.task_progress(&acct, &submitted.task_id).await.unwrap(),
        ExecutionStage::Aborted
    );
}

#[tokio::test]
async fn test_terminal_status_never_changes() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;

    let submitted = engine.dispatcher.submit(&acct, http_task()).await.unwrap();
    let task_id = submitted.task_id;
    engine.dispatcher.acquire_task(&acct, "d1", &task_id).await.unwrap().unwrap();
    assert!(
        engine
            .dispatcher
            .report_result(&acct, "d1", &task_id, TaskStatus::Error, None, Some("boom".into()))
            .await
            .unwrap()
    );

    let cancel = engine.dispatcher.cancel(&acct, &task_id).await.unwrap();
    assert_eq!(cancel.stage, ExecutionStage::Failed);
    assert!(!cancel.aborted);
    assert!(
        !engine
            .dispatcher
            .report_result(&acct, "d1", &task_id, TaskStatus::Success, None, None)
            .await
            .unwrap()
    );

    let task = engine.dispatcher.get_task(&acct, &task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_acquire_is_exclusive() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;
    engine.delegate(&acct, "d2", &[]).await;

    let submitted = engine.dispatcher.submit(&acct, http_task()).await.unwrap();
    let task_id = submitted.task_id;

    let first = engine.dispatcher.acquire_task(&acct, "d1", &task_id).await.unwrap();
    assert_eq!(first.unwrap().delegate_id.as_deref(), Some("d1"));

    assert!(engine.dispatcher.acquire_task(&acct, "d2", &task_id).await.unwrap().is_none());
    // A retry by the winner returns the same assignment.
    let retry = engine.dispatcher.acquire_task(&acct, "d1", &task_id).await.unwrap();
    assert_eq!(retry.unwrap().status, TaskStatus::Started);

    // Only the owner may report.
    let err = engine
        .dispatcher
        .report_result(&acct, "d2", &task_id, TaskStatus::Success, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTaskState { .. }));
}

#[tokio::test]
async fn test_concurrent_acquire_has_one_winner() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    let delegates = ["d1", "d2", "d3", "d4"];
    for id in delegates {
        engine.delegate(&acct, id, &[]).await;
    }
    let submitted = engine.dispatcher.submit(&acct, http_task()).await.unwrap();

    let attempts = delegates.map(|id| {
        let dispatcher = engine.dispatcher.clone();
        let acct = acct.clone();
        let task_id = submitted.task_id.clone();
        async move { dispatcher.acquire_task(&acct, id, &task_id).await }
    });
    let winners: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .filter_map(|r| r.unwrap())
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].status, TaskStatus::Started);
}

#[tokio::test]
async fn test_acquire_requires_registered_delegate() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    let submitted = engine.dispatcher.submit(&acct, http_task()).await.unwrap();

    let err = engine
        .dispatcher
        .acquire_task(&acct, "ghost", &submitted.task_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DelegateNotFound { .. }));
}

#[tokio::test]
async fn test_selectors_restrict_pickup() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &["linux"]).await;
    engine.delegate(&acct, "d2", &["linux", "gpu"]).await;

    let submitted = engine
        .dispatcher
        .submit(
            &acct,
            NewTask {
                selectors: vec![TaskSelector {
                    selector: "gpu".to_string(),
                    origin: None,
                }],
                ..http_task()
            },
        )
        .await
        .unwrap();

    let task = engine.dispatcher.get_task(&acct, &submitted.task_id).await.unwrap().unwrap();
    assert_eq!(task.eligible_delegate_ids, vec!["d2".to_string()]);
    assert_eq!(task.preferred_delegate_id.as_deref(), Some("d2"));

    let d1 = engine.dispatcher.poll_tasks(&acct, "d1", 10, Duration::ZERO).await.unwrap();
    assert!(d1.is_empty());
    assert!(engine.dispatcher.acquire_task(&acct, "d1", &submitted.task_id).await.unwrap().is_none());

    let d2 = engine.dispatcher.poll_tasks(&acct, "d2", 10, Duration::ZERO).await.unwrap();
    assert_eq!(d2.len(), 1);
}

#[tokio::test]
async fn test_poll_finds_eligible_task_behind_a_full_page() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d-gpu", &["gpu"]).await;
    engine.delegate(&acct, "d-plain", &[]).await;

    for _ in 0..500 {
        engine
            .dispatcher
            .submit(
                &acct,
                NewTask {
                    selectors: vec![TaskSelector {
                        selector: "gpu".to_string(),
                        origin: None,
                    }],
                    ..http_task()
                },
            )
            .await
            .unwrap();
    }
    let plain = engine.dispatcher.submit(&acct, http_task()).await.unwrap();

    let polled = engine.dispatcher.poll_tasks(&acct, "d-plain", 10, Duration::ZERO).await.unwrap();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].task_id, plain.task_id);

    let gpu = engine.dispatcher.poll_tasks(&acct, "d-gpu", 10, Duration::ZERO).await.unwrap();
    assert_eq!(gpu.len(), 10);
}

#[tokio::test]
async fn test_preferred_delegate_is_least_loaded() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;
    engine.delegate(&acct, "d2", &[]).await;

    // Ties go to the lower id.
    let first = engine.dispatcher.submit(&acct, http_task()).await.unwrap();
    let task = engine.dispatcher.get_task(&acct, &first.task_id).await.unwrap().unwrap();
    assert_eq!(task.preferred_delegate_id.as_deref(), Some("d1"));

    engine.dispatcher.acquire_task(&acct, "d1", &first.task_id).await.unwrap().unwrap();

    let second = engine.dispatcher.submit(&acct, http_task()).await.unwrap();
    let task = engine.dispatcher.get_task(&acct, &second.task_id).await.unwrap().unwrap();
    assert_eq!(task.preferred_delegate_id.as_deref(), Some("d2"));
}

#[tokio::test]
async fn test_preferred_delegate_window_blocks_others() {
    let engine = Engine::new(
        memory_persistence().await,
        DispatcherConfig {
            broadcast_grace: Duration::from_secs(60),
            ..test_dispatcher_config()
        },
    );
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;
    engine.delegate(&acct, "d2", &[]).await;

    let submitted = engine.dispatcher.submit(&acct, http_task()).await.unwrap();
    assert!(engine.dispatcher.acquire_task(&acct, "d2", &submitted.task_id).await.unwrap().is_none());
    assert!(engine.dispatcher.acquire_task(&acct, "d1", &submitted.task_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_scoping_rules_restrict_pickup() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;

    let rules: ScopingRules = [("envId".to_string(), vec!["prod".to_string()])].into_iter().collect();
    engine.delegates.update_scoping_rules(&acct, "d1", rules).await.unwrap();

    let dev = engine
        .dispatcher
        .submit(
            &acct,
            NewTask {
                setup_abstractions: [("envId".to_string(), "dev".to_string())].into_iter().collect(),
                ..http_task()
            },
        )
        .await
        .unwrap();
    let prod = engine
        .dispatcher
        .submit(
            &acct,
            NewTask {
                setup_abstractions: [("envId".to_string(), "prod".to_string())].into_iter().collect(),
                ..http_task()
            },
        )
        .await
        .unwrap();

    let polled = engine.dispatcher.poll_tasks(&acct, "d1", 10, Duration::ZERO).await.unwrap();
    let ids: Vec<_> = polled.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, vec![prod.task_id.as_str()]);
    assert!(engine.dispatcher.acquire_task(&acct, "d1", &dev.task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_callback_token_rejected() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");

    let err = engine
        .dispatcher
        .submit(
            &acct,
            NewTask {
                callback_token: Some("not-registered".to_string()),
                ..http_task()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidRequest { .. }));
    assert_eq!(engine.broadcasts.count(), 0);
}

#[tokio::test]
async fn test_submit_validation() {
    let engine = Engine::in_memory().await;
    let acct = ctx("acct-1");

    let missing_type = engine.dispatcher.submit(&acct, NewTask::new("", b"p".to_vec())).await;
    assert!(matches!(missing_type, Err(CoreError::InvalidRequest { .. })));

    let missing_params = engine.dispatcher.submit(&acct, NewTask::new("HTTP", Vec::new())).await;
    assert!(matches!(missing_params, Err(CoreError::InvalidRequest { .. })));
}

#[tokio::test]
async fn test_reaper_expires_overdue_tasks() {
    let engine = Arc::new(Engine::in_memory().await);
    let acct = ctx("acct-1");

    let submitted = engine
        .dispatcher
        .submit(
            &acct,
            NewTask {
                timeout: Duration::from_millis(1),
                ..http_task()
            },
        )
        .await
        .unwrap();
    let fresh = engine.dispatcher.submit(&acct, http_task()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reaper = TaskReaper::new(engine.dispatcher.clone(), TaskReaperConfig::default());
    let (expired, failed) = reaper.sweep().await.unwrap();
    assert_eq!((expired, failed), (1, 0));

    let task = engine.dispatcher.get_task(&acct, &submitted.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Expired);
    assert!(task.error_message.unwrap().contains("expired"));
    assert_eq!(
        engine.dispatcher.task_progress(&acct, &fresh.task_id).await.unwrap(),
        ExecutionStage::Queueing
    );

    // Nothing left on the next pass.
    assert_eq!(reaper.sweep().await.unwrap(), (0, 0));
}

#[tokio::test]
async fn test_reaper_keeps_tasks_with_huge_timeouts() {
    let engine = Arc::new(Engine::in_memory().await);
    let acct = ctx("acct-1");

    let mut ids = Vec::new();
    for timeout in [
        Duration::from_secs(10_000 * 366 * 24 * 60 * 60),
        Duration::from_millis(u64::MAX),
    ] {
        let submitted = engine
            .dispatcher
            .submit(&acct, NewTask { timeout, ..http_task() })
            .await
            .unwrap();
        ids.push(submitted.task_id);
    }

    let reaper = TaskReaper::new(engine.dispatcher.clone(), TaskReaperConfig::default());
    assert_eq!(reaper.sweep().await.unwrap(), (0, 0));

    for id in &ids {
        let task = engine.dispatcher.get_task(&acct, id).await.unwrap().unwrap();
        assert_ne!(task.status, TaskStatus::Expired);
        assert_eq!(
            engine.dispatcher.task_progress(&acct, id).await.unwrap(),
            ExecutionStage::Queueing
        );
    }
}

#[tokio::test]
async fn test_reaper_fails_tasks_of_lost_delegates() {
    let engine = Arc::new(Engine::new(
        memory_persistence().await,
        DispatcherConfig {
            delegate_heartbeat_timeout: Duration::from_millis(100),
            ..test_dispatcher_config()
        },
    ));
    let acct = ctx("acct-1");
    engine.delegate(&acct, "d1", &[]).await;

    let submitted = engine.dispatcher.submit(&acct, http_task()).await.unwrap();
    engine.dispatcher.acquire_task(&acct, "d1", &submitted.task_id).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let failed = engine.dispatcher.fail_tasks_of_lost_delegates(100).await.unwrap();
    assert_eq!(failed, 1);

    let task = engine.dispatcher.get_task(&acct, &submitted.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("Delegate [d1] disconnected"));
}

#[tokio::test]
async fn test_reaper_stops_on_shutdown() {
    let engine = Arc::new(Engine::in_memory().await);
    let reaper = TaskReaper::new(
        engine.dispatcher.clone(),
        TaskReaperConfig {
            poll_interval: Duration::from_millis(10),
            ..TaskReaperConfig::default()
        },
    );
    let shutdown = reaper.shutdown_handle();
    let handle = tokio::spawn(async move { reaper.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("reaper stops")
        .unwrap();
}
