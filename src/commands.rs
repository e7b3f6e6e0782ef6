//! Closed set of operator commands accepted by a running watcher.

use serde::{Deserialize, Serialize};

use crate::models::{CheckResult, Task};
use crate::runtime::{SystemDiagnostics, Watcher};
use crate::scheduler::TickReport;
use crate::task_queue::QueueStats;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    CheckNow { task_id: String },
    RunTick,
    RemoveTask { task_id: String },
    Acknowledge { task_id: String },
    GetDiagnostics,
    GetQueueStats,
    HealthCheck,
    Recover,
    ResetReliability,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CheckNow { .. } => "check_now",
            Command::RunTick => "run_tick",
            Command::RemoveTask { .. } => "remove_task",
            Command::Acknowledge { .. } => "acknowledge",
            Command::GetDiagnostics => "get_diagnostics",
            Command::GetQueueStats => "get_queue_stats",
            Command::HealthCheck => "health_check",
            Command::Recover => "recover",
            Command::ResetReliability => "reset_reliability",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CommandResponse {
    CheckResult(CheckResult),
    Tick(TickReport),
    Removed { task_id: String, removed: bool },
    Task(Task),
    Diagnostics(Box<SystemDiagnostics>),
    QueueStats(QueueStats),
    Health { healthy: bool },
    Recovered,
    Reset,
}

pub async fn dispatch(watcher: &Watcher, command: Command) -> Result<CommandResponse> {
    tracing::debug!(command = command.name(), "Dispatching command");

    let response = match command {
        Command::CheckNow { task_id } => {
            CommandResponse::CheckResult(watcher.scheduler().check_now(&task_id).await?)
        }
        Command::RunTick => CommandResponse::Tick(watcher.scheduler().run_tick().await?),
        Command::RemoveTask { task_id } => {
            let removed = watcher.scheduler().remove_task(&task_id).await?;
            CommandResponse::Removed { task_id, removed }
        }
        Command::Acknowledge { task_id } => {
            CommandResponse::Task(watcher.scheduler().acknowledge(&task_id).await?)
        }
        Command::GetDiagnostics => CommandResponse::Diagnostics(Box::new(watcher.diagnostics().await)),
        Command::GetQueueStats => CommandResponse::QueueStats(watcher.queue().stats()),
        Command::HealthCheck => CommandResponse::Health {
            healthy: watcher.reliability().health_check().await,
        },
        Command::Recover => {
            watcher.reliability().recover().await?;
            CommandResponse::Recovered
        }
        Command::ResetReliability => {
            watcher.reliability().reset();
            CommandResponse::Reset
        }
    };

    Ok(response)
}
