pub mod commands;
pub mod config;
pub mod element_checker;
pub mod host;
pub mod models;
pub mod plugins;
pub mod reliability;
pub mod resource_manager;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod task_queue;
pub mod utils;
pub mod web;

// Re-export commonly used types
pub use config::AppConfig;
pub use runtime::Watcher;
pub use utils::error::{AppError, Result};
