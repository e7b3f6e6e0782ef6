use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fragment_watcher::config::{LoggingConfig, MetricsConfig};
use fragment_watcher::host::ChromeHost;
use fragment_watcher::models::{CheckInterval, NewTask};
use fragment_watcher::plugins::NotificationHub;
use fragment_watcher::storage::SqliteTaskStore;
use fragment_watcher::web::{self, AppState};
use fragment_watcher::{AppConfig, Watcher};

/// Watch page fragments for changes on a schedule
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a configuration file (defaults to config/ plus WATCHER__ env vars)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler, queue, health monitor and diagnostics server
    Run,

    /// Check a selector once and print the extracted fragment
    Check {
        url: String,
        selector: String,
    },

    /// Add a watch task
    Add {
        url: String,
        selector: String,

        /// One of 5m, 15m, 30m, 1h, 6h, 12h, 24h
        #[arg(short, long, default_value = "1h")]
        interval: CheckInterval,
    },

    /// List stored watch tasks
    List,

    /// Print queue, reliability and scheduler diagnostics as JSON
    Diagnose,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env()?,
    };

    let _log_guard = init_tracing(&config.logging);
    init_metrics(&config.metrics)?;

    let store = SqliteTaskStore::connect(&config.database).await?;
    let hub = NotificationHub::from_config(&config.notifications).await?;
    let host = ChromeHost::new(config.browser.clone());
    let watcher = Arc::new(Watcher::new(config.clone(), Arc::new(host), Arc::new(store), hub));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(watcher).await?,
        Commands::Check { url, selector } => {
            let outcome = watcher.check_once(&url, &selector).await;
            watcher.shutdown().await;
            println!("{}", outcome?);
        }
        Commands::Add {
            url,
            selector,
            interval,
        } => {
            let task = watcher
                .scheduler()
                .add_task(NewTask {
                    url,
                    selector,
                    interval: Some(interval),
                    initial_content: None,
                })
                .await?;
            println!("{}", task.id);
        }
        Commands::List => {
            for task in watcher.scheduler().list_tasks().await? {
                let next_check = task
                    .next_check_at()
                    .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "due".to_string());
                println!(
                    "{}  {:<8} {:<4} {:<16} {}  {}",
                    task.id,
                    serde_json::to_value(task.status)?.as_str().unwrap_or_default(),
                    task.interval.as_str(),
                    next_check,
                    task.url,
                    task.selector
                );
            }
        }
        Commands::Diagnose => {
            let diagnostics = watcher.diagnostics().await;
            println!("{}", serde_json::to_string_pretty(&diagnostics)?);
        }
    }

    Ok(())
}

async fn run(watcher: Arc<Watcher>) -> Result<()> {
    info!("Starting Fragment Watcher...");
    watcher.start().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = if watcher.config().server.enabled {
        let server_config = watcher.config().server.clone();
        let state = AppState {
            watcher: Arc::clone(&watcher),
        };
        Some(tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = web::serve(&server_config, state, shutdown).await {
                tracing::error!("Diagnostics server failed: {}", e);
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let _ = shutdown_tx.send(());
    if let Some(server) = server {
        let _ = server.await;
    }
    watcher.shutdown().await;
    Ok(())
}

fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("fragment_watcher={},tower_http=info,warn", config.level))
    });
    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.port))
        .install()?;
    info!("Prometheus metrics exported on port {}", config.port);
    Ok(())
}
