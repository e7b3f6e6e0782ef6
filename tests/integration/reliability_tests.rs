use std::sync::atomic::Ordering;
use std::time::Duration;

use fragment_watcher::AppError;

use super::*;

#[tokio::test(start_paused = true)]
async fn test_unresponsive_sandbox_is_recovered() {
    let host = FakeHost::with_sandbox();
    let test = create_test_watcher(get_test_config(), host.clone(), vec![]).await;
    let reliability = test.watcher.reliability().clone();

    host.fail_next_pings(5);
    for _ in 0..5 {
        assert!(!reliability.health_check().await);
    }

    let settled = wait_for_condition(
        || {
            let state = reliability.state();
            !state.recovering && state.total_recoveries == 1
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(settled, "recovery did not complete");

    let state = reliability.state();
    assert_eq!(state.consecutive_errors, 0);
    assert!(state.is_healthy);
    assert!(!state.recovery_exhausted);
    assert!(host.destroys.load(Ordering::SeqCst) >= 1);
    assert!(host.creates.load(Ordering::SeqCst) >= 1);
    assert!(host.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_failures_below_threshold_do_not_recover() {
    let host = FakeHost::with_sandbox();
    let test = create_test_watcher(get_test_config(), host.clone(), vec![]).await;
    let reliability = test.watcher.reliability().clone();

    host.fail_next_pings(4);
    for _ in 0..4 {
        reliability.health_check().await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let state = reliability.state();
    assert_eq!(state.consecutive_errors, 4);
    assert_eq!(state.total_recoveries, 0);
    assert_eq!(host.destroys.load(Ordering::SeqCst), 0);

    assert!(reliability.health_check().await);
    assert_eq!(reliability.state().consecutive_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_recovery_fails_fast_until_reset() {
    let host = FakeHost::with_sandbox();
    host.set_page("https://example.com/news", "Headline");
    let test = create_test_watcher(get_test_config(), host.clone(), vec![]).await;
    let reliability = test.watcher.reliability().clone();

    host.fail_next_creates(3);
    let err = reliability.recover().await.unwrap_err();
    assert!(matches!(err, AppError::RecoveryExhausted { attempts: 3 }));
    assert!(reliability.state().recovery_exhausted);

    let extractions = host.extractions.load(Ordering::SeqCst);
    let err = test
        .watcher
        .check_once("https://example.com/news", "#headline")
        .await
        .unwrap_err();
    assert!(err.is_recovery_exhausted());
    assert_eq!(host.extractions.load(Ordering::SeqCst), extractions);

    reliability.reset();
    let content = test
        .watcher
        .check_once("https://example.com/news", "#headline")
        .await
        .unwrap();
    assert_eq!(content, "Headline");
    assert!(!reliability.state().recovery_exhausted);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_recover_calls_share_one_cycle() {
    let host = FakeHost::with_sandbox();
    let test = create_test_watcher(get_test_config(), host.clone(), vec![]).await;
    let reliability = test.watcher.reliability().clone();

    let (first, second) = tokio::join!(reliability.recover(), reliability.recover());
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(reliability.state().total_recoveries, 1);
    assert_eq!(host.destroys.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_extraction_is_cancelled() {
    let mut config = get_test_config();
    config.checker.extraction_timeout_ms = 100;
    config.checker.reliability_attempts = 1;

    let host = FakeHost::with_sandbox();
    host.set_page("https://example.com/slow", "Slow");
    host.set_extract_delay(Duration::from_secs(10));
    let test = create_test_watcher(config, host.clone(), vec![]).await;

    let err = test
        .watcher
        .check_once("https://example.com/slow", "#headline")
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), AppError::Timeout { .. }));
    assert_eq!(host.cancelled.lock().unwrap().len(), 1);
    assert_eq!(test.watcher.reliability().state().consecutive_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_report_recent_errors() {
    let host = FakeHost::with_sandbox();
    let test = create_test_watcher(get_test_config(), host.clone(), vec![]).await;

    host.fail_next_pings(1);
    test.watcher.reliability().health_check().await;

    let diagnostics = test.watcher.diagnostics().await;
    assert!(diagnostics.reliability.exists);
    assert!(diagnostics.reliability.responsive);
    assert_eq!(diagnostics.reliability.consecutive_errors, 1);
    assert_eq!(diagnostics.reliability.recent_errors.len(), 1);
    assert!(diagnostics.reliability.recent_errors[0].message.contains("unresponsive"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_ping_during_extraction_keeps_sandbox_healthy() {
    let mut config = get_test_config();
    config.checker.extraction_timeout_ms = 60_000;

    let host = FakeHost::with_sandbox();
    host.set_page("https://example.com/slow", "Slow");
    host.set_extract_delay(Duration::from_secs(10));
    let test = create_test_watcher(config, host.clone(), vec![]).await;
    let reliability = test.watcher.reliability().clone();

    let watcher = test.watcher.clone();
    let check = tokio::spawn(async move {
        watcher.check_once("https://example.com/slow", "#headline").await
    });
    assert!(
        wait_for_condition(|| host.extractions.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await
    );

    host.fail_next_pings(1);
    assert!(!reliability.health_check().await);

    let state = reliability.state();
    assert!(state.is_healthy);
    assert_eq!(state.consecutive_errors, 1);
    assert!(!state.recovering);

    assert_eq!(check.await.unwrap().unwrap(), "Slow");
    assert_eq!(host.destroys.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_closed_sandbox_is_recreated_on_next_check() {
    let mut config = get_test_config();
    config.reliability.idle_timeout_secs = 60;
    config.reliability.health_check_interval_secs = 30;

    let host = FakeHost::new();
    host.set_page("https://example.com/news", "Headline");
    let test = create_test_watcher(config, host.clone(), vec![]).await;
    let reliability = test.watcher.reliability().clone();

    test.watcher.check_once("https://example.com/news", "#headline").await.unwrap();
    assert_eq!(host.creates.load(Ordering::SeqCst), 1);

    reliability.start();
    let closed = wait_for_condition(|| reliability.state().idle_closed, Duration::from_secs(120)).await;
    reliability.stop();
    assert!(closed, "idle sandbox was not closed");
    assert!(!host.is_alive());
    assert_eq!(reliability.state().consecutive_errors, 0);

    let content = test
        .watcher
        .check_once("https://example.com/news", "#headline")
        .await
        .unwrap();
    assert_eq!(content, "Headline");
    assert_eq!(host.creates.load(Ordering::SeqCst), 2);
    assert!(!reliability.state().idle_closed);
    assert!(host.is_alive());
}
