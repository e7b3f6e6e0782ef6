use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fragment_watcher::config::AppConfig;
use fragment_watcher::element_checker::ElementChecker;
use fragment_watcher::reliability::ReliabilityManager;
use fragment_watcher::resource_manager::ResourceManager;
use fragment_watcher::task_queue::TaskQueue;
use fragment_watcher::AppError;
use tokio_test::{assert_err, assert_ok};

use super::*;

fn create_test_queue(config: &AppConfig, host: Arc<FakeHost>) -> Arc<TaskQueue> {
    let resources = Arc::new(ResourceManager::new(host, config.resource.clone()));
    let reliability = ReliabilityManager::new(resources, config.reliability.clone());
    let checker = Arc::new(ElementChecker::new(reliability, config.checker.clone()));
    TaskQueue::new(checker, config.queue.clone())
}

#[tokio::test]
async fn test_full_queue_rejects_next_task() {
    let config = get_test_config();
    let queue = create_test_queue(&config, FakeHost::new());

    let mut handles = Vec::new();
    for i in 0..50 {
        let task = create_test_task(&format!("https://example.com/{}", i), None);
        handles.push(queue.add_task(task, 0).unwrap());
    }

    let extra = create_test_task("https://example.com/51", None);
    let err = queue.add_task(extra, 0).unwrap_err();
    assert!(matches!(err, AppError::QueueFull { capacity: 50 }));
    assert_eq!(queue.len(), 50);
    assert_eq!(queue.stats().counters.rejected, 1);
}

#[tokio::test]
async fn test_task_is_queued_at_most_once() {
    let config = get_test_config();
    let queue = create_test_queue(&config, FakeHost::new());
    let task = create_test_task("https://example.com/a", None);

    let _handle = assert_ok!(queue.add_task(task.clone(), 0));
    let err = assert_err!(queue.add_task(task.clone(), 0));

    assert!(matches!(err, AppError::DuplicateTask { ref task_id } if *task_id == task.id));
    assert_eq!(queue.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_item_times_out_without_being_checked() {
    let mut config = get_test_config();
    config.queue.processing_timeout_secs = 600;
    config.checker.extraction_timeout_ms = 600_000;

    let host = FakeHost::new();
    host.set_page("https://example.com/slow", "Slow");
    host.set_page("https://example.com/fast", "Fast");
    host.set_extract_delay(Duration::from_secs(400));

    let queue = create_test_queue(&config, host.clone());
    queue.start();

    let slow = queue
        .add_task(create_test_task("https://example.com/slow", None), 0)
        .unwrap();
    let fast_task = create_test_task("https://example.com/fast", None);
    let fast = queue.add_task(fast_task.clone(), 0).unwrap();

    let err = fast.wait().await.unwrap_err();
    assert!(matches!(err, AppError::QueueTimeout { ref task_id, .. } if *task_id == fast_task.id));

    let result = slow.wait().await.unwrap();
    assert_eq!(result.content(), Some("Slow"));
    assert_eq!(host.extractions.load(Ordering::SeqCst), 1);
    assert_eq!(queue.stats().counters.expired, 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let mut config = get_test_config();
    config.queue.default_max_retries = 2;
    let host = FakeHost::new();
    let queue = create_test_queue(&config, host.clone());
    queue.start();

    let handle = queue
        .add_task(create_test_task("https://example.com/missing", None), 2)
        .unwrap();
    let err = handle.wait().await.unwrap_err();

    assert!(err.is_element_not_found());
    assert_eq!(host.extractions.load(Ordering::SeqCst), 3);
    let stats = queue.stats();
    assert_eq!(stats.counters.retried, 2);
    assert_eq!(stats.counters.failed, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_shutdown_rejects_pending_tasks() {
    let config = get_test_config();
    let queue = create_test_queue(&config, FakeHost::new());

    let handle = queue
        .add_task(create_test_task("https://example.com/a", None), 0)
        .unwrap();
    queue.shutdown().await;

    assert!(matches!(handle.wait().await, Err(AppError::QueueClosed)));
    assert!(matches!(
        queue.add_task(create_test_task("https://example.com/b", None), 0),
        Err(AppError::QueueClosed)
    ));
}
