use chrono::{Duration, Utc};
use std::sync::atomic::Ordering;

use fragment_watcher::commands::{Command, CommandResponse};
use fragment_watcher::models::TaskStatus;
use fragment_watcher::storage::TaskStore;

use super::*;

#[tokio::test]
async fn test_due_task_detects_change_and_notifies() {
    let host = FakeHost::new();
    host.set_page("https://example.com/news", "Rates cut");

    let mut task = create_test_task("https://example.com/news", Some("Rates held"));
    task.last_checked_at = Some(Utc::now() - Duration::minutes(16));
    let task_id = task.id.clone();
    let t = create_test_watcher(get_test_config(), host, vec![task]).await;

    let before = Utc::now();
    let report = t.watcher.scheduler().run_tick().await.unwrap();
    assert_eq!(report.admitted, 1);
    assert_eq!(report.changed, 1);

    let stored = t.store.load_tasks().await.unwrap();
    assert_eq!(stored[0].status, TaskStatus::Changed);
    assert_eq!(stored[0].current_content.as_deref(), Some("Rates cut"));
    assert!(stored[0].last_changed_at.unwrap() >= before);

    let changes = t.notifier.changes.lock().unwrap().clone();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].task_id, task_id);
    assert_eq!(changes[0].previous_content.as_deref(), Some("Rates held"));
    assert_eq!(changes[0].current_content, "Rates cut");
    assert_eq!(*t.notifier.badges.lock().unwrap(), vec![1]);

    // Sandbox was created on demand for the first check
    assert_eq!(t.host.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_checked_task_is_not_due_again_until_interval_passes() {
    let host = FakeHost::new();
    host.set_page("https://example.com/news", "Same");
    let task = create_test_task("https://example.com/news", Some("Same"));
    let t = create_test_watcher(get_test_config(), host, vec![task]).await;

    let first = t.watcher.scheduler().run_tick().await.unwrap();
    assert_eq!(first.succeeded, 1);

    let second = t.watcher.scheduler().run_tick().await.unwrap();
    assert_eq!(second.due, 0);

    let later = Utc::now() + Duration::minutes(15);
    let third = t.watcher.scheduler().run_tick_at(later).await.unwrap();
    assert_eq!(third.due, 1);
    assert_eq!(t.host.extractions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unchanged_content_preserves_change_time() {
    let host = FakeHost::new();
    host.set_page("https://example.com/news", "Same");
    let changed_at = Utc::now() - Duration::days(1);
    let mut task = create_test_task("https://example.com/news", Some("Same"));
    task.status = TaskStatus::Changed;
    task.last_changed_at = Some(changed_at);
    let t = create_test_watcher(get_test_config(), host, vec![task]).await;

    t.watcher.scheduler().run_tick().await.unwrap();

    let stored = t.store.load_tasks().await.unwrap();
    assert_eq!(stored[0].status, TaskStatus::Changed);
    assert_eq!(stored[0].last_changed_at, Some(changed_at));
    assert!(t.notifier.changes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_element_marks_task_failing_after_threshold() {
    let host = FakeHost::new();
    let task = create_test_task("https://example.com/gone", Some("Old"));
    let task_id = task.id.clone();
    let mut config = get_test_config();
    config.scheduler.task_error_threshold = 3;
    let t = create_test_watcher(config, host, vec![task]).await;

    for expected in 1..=3u32 {
        let response = t
            .watcher
            .execute(Command::CheckNow {
                task_id: task_id.clone(),
            })
            .await
            .unwrap();
        let CommandResponse::CheckResult(result) = response else {
            panic!("unexpected response");
        };
        assert!(!result.is_success());

        let stored = t.store.load_tasks().await.unwrap();
        assert_eq!(stored[0].consecutive_errors, expected);
    }

    let stored = t.store.load_tasks().await.unwrap();
    assert_eq!(stored[0].status, TaskStatus::Error);
    assert!(stored[0].last_error.as_deref().unwrap().contains("#headline"));

    // A missing element is a page problem, not a sandbox problem
    assert!(t.watcher.reliability().is_healthy());
    assert_eq!(t.watcher.reliability().state().consecutive_errors, 0);

    // Still attempted at its normal interval, and heals on success
    t.host.set_page("https://example.com/gone", "Back");
    let report = t
        .watcher
        .scheduler()
        .run_tick_at(Utc::now() + Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);
    let stored = t.store.load_tasks().await.unwrap();
    assert_eq!(stored[0].status, TaskStatus::Changed);
    assert_eq!(stored[0].consecutive_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_task_removed_during_check_stays_removed() {
    let host = FakeHost::new();
    host.set_page("https://example.com/slow", "New");
    host.set_extract_delay(std::time::Duration::from_secs(2));
    let task = create_test_task("https://example.com/slow", Some("Old"));
    let task_id = task.id.clone();
    let t = create_test_watcher(get_test_config(), host, vec![task]).await;

    let scheduler = t.watcher.scheduler().clone();
    let tick = tokio::spawn(async move { scheduler.run_tick().await });

    let queue = t.watcher.queue().clone();
    let id = task_id.clone();
    assert!(wait_for_condition(move || queue.stats().current_task.as_deref() == Some(id.as_str()), std::time::Duration::from_secs(1)).await);
    assert!(t.watcher.scheduler().remove_task(&task_id).await.unwrap());

    let report = tick.await.unwrap().unwrap();
    assert_eq!(report.admitted, 1);
    assert_eq!(report.succeeded + report.failed, 0);
    assert!(t.store.load_tasks().await.unwrap().is_empty());
    assert!(t.notifier.changes.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_tick_is_skipped() {
    let host = FakeHost::new();
    host.set_page("https://example.com/slow", "Value");
    host.set_extract_delay(std::time::Duration::from_secs(5));
    let task = create_test_task("https://example.com/slow", None);
    let t = create_test_watcher(get_test_config(), host, vec![task]).await;

    let scheduler = t.watcher.scheduler().clone();
    let first = tokio::spawn(async move { scheduler.run_tick().await });
    let queue = t.watcher.queue().clone();
    assert!(wait_for_condition(move || queue.stats().processing, std::time::Duration::from_secs(1)).await);

    let second = t.watcher.scheduler().run_tick().await.unwrap();
    assert!(second.skipped);

    let first = first.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.succeeded, 1);
    assert_eq!(t.watcher.scheduler().stats().ticks_skipped, 1);
}

#[tokio::test]
async fn test_success_on_final_retry_clears_task_errors() {
    let mut config = get_test_config();
    config.queue.default_max_retries = 3;

    let host = FakeHost::new();
    host.set_page("https://example.com/news", "Back online");
    host.fail_next_extractions(2);

    let mut task = create_test_task("https://example.com/news", Some("Back online"));
    task.consecutive_errors = 2;
    task.last_error = Some("Element not found: #headline".to_string());
    let task_id = task.id.clone();
    let t = create_test_watcher(config, host, vec![task]).await;

    let result = t.watcher.scheduler().check_now(&task_id).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.attempts, 3);

    let stored = t.store.load_tasks().await.unwrap();
    assert_eq!(stored[0].consecutive_errors, 0);
    assert_eq!(stored[0].status, TaskStatus::Active);
    assert!(stored[0].last_error.is_none());
    assert_eq!(t.host.extractions.load(Ordering::SeqCst), 3);
}
