use axum::{
    extract::{Path, State},
    response::Json,
};

use super::{ApiResponse, AppState, HttpError};
use crate::commands::{Command, CommandResponse};

type CommandResult = Result<Json<ApiResponse<CommandResponse>>, HttpError>;

async fn run(state: &AppState, command: Command) -> CommandResult {
    let response = state.watcher.execute(command).await?;
    Ok(Json(ApiResponse::success(response)))
}

fn require_id(id: &str) -> Result<String, HttpError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(HttpError::bad_request("Task ID is required"));
    }
    Ok(id.to_string())
}

pub async fn get_diagnostics(State(state): State<AppState>) -> CommandResult {
    run(&state, Command::GetDiagnostics).await
}

pub async fn get_queue_stats(State(state): State<AppState>) -> CommandResult {
    run(&state, Command::GetQueueStats).await
}

pub async fn execute_command(State(state): State<AppState>, Json(command): Json<Command>) -> CommandResult {
    tracing::info!(command = command.name(), "Command received over HTTP");
    run(&state, command).await
}

pub async fn check_task_now(State(state): State<AppState>, Path(id): Path<String>) -> CommandResult {
    let task_id = require_id(&id)?;
    run(&state, Command::CheckNow { task_id }).await
}

pub async fn acknowledge_task(State(state): State<AppState>, Path(id): Path<String>) -> CommandResult {
    let task_id = require_id(&id)?;
    run(&state, Command::Acknowledge { task_id }).await
}

pub async fn remove_task(State(state): State<AppState>, Path(id): Path<String>) -> CommandResult {
    let task_id = require_id(&id)?;
    run(&state, Command::RemoveTask { task_id }).await
}

pub async fn recover(State(state): State<AppState>) -> CommandResult {
    run(&state, Command::Recover).await
}

pub async fn reset_reliability(State(state): State<AppState>) -> CommandResult {
    run(&state, Command::ResetReliability).await
}
