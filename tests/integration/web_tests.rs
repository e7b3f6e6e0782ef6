use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use tower::ServiceExt;

use fragment_watcher::models::TaskStatus;
use fragment_watcher::storage::TaskStore;
use fragment_watcher::web::{create_router, AppState};

use super::*;

fn app(test: &TestWatcher) -> axum::Router {
    create_router(AppState {
        watcher: test.watcher.clone(),
    })
}

fn post(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_check_route_persists_detected_change() {
    let host = FakeHost::new();
    host.set_page("https://example.com/news", "Rates cut");
    let task = create_test_task("https://example.com/news", Some("Rates held"));
    let task_id = task.id.clone();
    let test = create_test_watcher(get_test_config(), host, vec![task]).await;

    let response = app(&test)
        .oneshot(post(&format!("/api/v1/tasks/{}/check", task_id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["type"], "check_result");
    assert_eq!(json["data"]["data"]["outcome"]["content"], "Rates cut");

    let stored = test.store.load_tasks().await.unwrap();
    assert_eq!(stored[0].status, TaskStatus::Changed);
    assert_eq!(stored[0].current_content.as_deref(), Some("Rates cut"));
    assert_eq!(test.notifier.changes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_acknowledge_route_clears_changed_status() {
    let host = FakeHost::new();
    host.set_page("https://example.com/news", "Rates cut");
    let task = create_test_task("https://example.com/news", Some("Rates held"));
    let task_id = task.id.clone();
    let test = create_test_watcher(get_test_config(), host, vec![task]).await;
    test.watcher.scheduler().check_now(&task_id).await.unwrap();

    let response = app(&test)
        .oneshot(post(&format!("/api/v1/tasks/{}/acknowledge", task_id)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["type"], "task");
    assert_eq!(json["data"]["data"]["status"], "active");
    assert_eq!(test.notifier.badges.lock().unwrap().last(), Some(&0));
}

#[tokio::test]
async fn test_removed_task_is_gone() {
    let task = create_test_task("https://example.com/news", None);
    let task_id = task.id.clone();
    let test = create_test_watcher(get_test_config(), FakeHost::new(), vec![task]).await;

    let response = app(&test)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/tasks/{}", task_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["data"]["removed"], true);

    let response = app(&test)
        .oneshot(post(&format!("/api/v1/tasks/{}/check", task_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(test.store.load_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_tick_command_checks_due_tasks() {
    let host = FakeHost::new();
    host.set_page("https://example.com/a", "A");
    host.set_page("https://example.com/b", "B");
    let tasks = vec![
        create_test_task("https://example.com/a", None),
        create_test_task("https://example.com/b", None),
    ];
    let test = create_test_watcher(get_test_config(), host, tasks).await;

    let response = app(&test)
        .oneshot(post_json("/api/v1/commands", serde_json::json!({ "type": "run_tick" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["type"], "tick");
    assert_eq!(json["data"]["data"]["due"], 2);
    assert_eq!(json["data"]["data"]["succeeded"], 2);
    assert_eq!(json["data"]["data"]["changed"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_recover_and_reset_routes() {
    let host = FakeHost::with_sandbox();
    let test = create_test_watcher(get_test_config(), host.clone(), vec![]).await;

    let response = app(&test).oneshot(post("/api/v1/reliability/recover")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["type"], "recovered");
    assert_eq!(test.watcher.reliability().state().total_recoveries, 1);

    host.fail_next_creates(3);
    let response = app(&test).oneshot(post("/api/v1/reliability/recover")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"]["code"], "RECOVERY_EXHAUSTED");

    let response = app(&test).oneshot(post("/api/v1/reliability/reset")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!test.watcher.reliability().state().recovery_exhausted);
}
