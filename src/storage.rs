//! Task persistence. The scheduler always reads and rewrites the full list.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tokio::sync::RwLock;

use crate::config::DatabaseConfig;
use crate::models::Task;
use crate::Result;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_tasks(&self) -> Result<Vec<Task>>;

    async fn save_tasks(&self, tasks: &[Task]) -> Result<()>;
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        ensure_parent_dir(&config.url)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// sqlite will not create missing directories for `mode=rwc`.
fn ensure_parent_dir(url: &str) -> Result<()> {
    let Some(path) = url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(':') {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn load_tasks(&self) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, url, selector, check_interval, status, last_checked_at, last_changed_at,
                   current_content, consecutive_errors, last_error, created_at
            FROM tasks
            ORDER BY position, created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    async fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tasks").execute(&mut *tx).await?;

        for (position, task) in tasks.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO tasks (id, url, selector, check_interval, status, last_checked_at,
                                   last_changed_at, current_content, consecutive_errors, last_error,
                                   created_at, position)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.id)
            .bind(&task.url)
            .bind(&task.selector)
            .bind(task.interval)
            .bind(task.status)
            .bind(task.last_checked_at)
            .bind(task.last_changed_at)
            .bind(&task.current_content)
            .bind(task.consecutive_errors)
            .bind(&task.last_error)
            .bind(task.created_at)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!("Saved {} tasks", tasks.len());
        Ok(())
    }
}

/// In-process store, used by tests and embedders without a database.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<Vec<Task>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.read().await.clone())
    }

    async fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        *self.tasks.write().await = tasks.to_vec();
        Ok(())
    }
}
