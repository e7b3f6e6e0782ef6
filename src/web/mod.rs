use axum::{
    extract::State,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::config::ServerConfig;
use crate::runtime::Watcher;
use crate::Result;

pub mod handlers;
pub mod responses;

pub use responses::{ApiError, ApiResponse, HttpError};

#[derive(Clone)]
pub struct AppState {
    pub watcher: Arc<Watcher>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/diagnostics", get(handlers::get_diagnostics))
        .route("/queue", get(handlers::get_queue_stats))
        .route("/commands", post(handlers::execute_command))
        .route("/tasks/:id", delete(handlers::remove_task))
        .route("/tasks/:id/check", post(handlers::check_task_now))
        .route("/tasks/:id/acknowledge", post(handlers::acknowledge_task))
        .route("/reliability/recover", post(handlers::recover))
        .route("/reliability/reset", post(handlers::reset_reliability))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let healthy = state.watcher.reliability().is_healthy();
    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
        "service": "fragment-watcher",
        "queue_length": state.watcher.queue().len(),
    }))
}

pub async fn serve<F>(config: &ServerConfig, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;

    tracing::info!("Diagnostics server listening on {}:{}", config.host, config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
