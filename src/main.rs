mod clients;
mod config;
mod dispatch;
mod engine;
mod error;
mod models;
mod paths;
mod repository;
mod services;
#[cfg(test)]
mod testing;

use crate::config::Config;
use crate::dispatch::{Dispatcher, RequestKind, envelope};
use crate::engine::{Collaborators, Engine, EngineSettings};
use crate::repository::{ExecutionRepository, establish_connection};
use std::future::Future;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn run_node<F>(shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wave_node=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting wave_node with config: {:?}", config);

    if let Some(path) = config.database_url.strip_prefix("sqlite:") {
        let path = std::path::Path::new(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Establish database connection
    let db_pool = establish_connection(&config.database_url).await?;
    tracing::info!("Database connected: {}", config.database_url);

    let execution_repo = ExecutionRepository::new(db_pool);
    let collaborators = Collaborators::http(&config)?;
    let engine = Engine::new(execution_repo, collaborators, EngineSettings::from(&config));

    let requests = tokio::spawn(serve_requests(Dispatcher::new(engine.clone())));
    engine.poller.run(shutdown).await;
    requests.abort();

    Ok(())
}

/// Answers one JSON request per stdin line with one JSON envelope on stdout.
async fn serve_requests(dispatcher: Dispatcher) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::error!("Failed to read request: {}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let result = match RequestKind::from_line(&line) {
            Ok(request) => dispatcher.handle(request).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            tracing::warn!(code = err.code(), "Request failed: {}", err);
        }

        let response = format!("{}\n", envelope(result));
        if let Err(err) = stdout.write_all(response.as_bytes()).await {
            tracing::error!("Failed to write response: {}", err);
            break;
        }
        let _ = stdout.flush().await;
    }

    tracing::debug!("Request input closed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_node(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
    })
    .await
}
