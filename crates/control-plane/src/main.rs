// Graduation API server
// Decision: One process hosts the HTTP API, the background runner and the retry scanner
// Decision: Postgres when configured, otherwise the in-memory store (single process, not durable)

use std::sync::Arc;

use anyhow::{Context, Result};
use graduation_control_plane::config::{ServerConfig, StoreKind};
use graduation_control_plane::{build_router, provisioners, seed};
use graduation_durable::{
    BackgroundRunner, InMemoryWorkflowStore, Orchestrator, PostgresWorkflowStore, RetryScanner,
    StepExecutor, WorkflowRunner, WorkflowStore,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "graduation_control_plane=debug,graduation_durable=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("graduation-control-plane starting...");

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    let store: Arc<dyn WorkflowStore> = match config.store {
        StoreKind::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL environment variable required")?;
            let pool = sqlx::PgPool::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Connected to database");
            Arc::new(PostgresWorkflowStore::new(pool))
        }
        StoreKind::InMemory => {
            tracing::warn!("Using in-memory store; workflows are lost on restart");
            Arc::new(InMemoryWorkflowStore::new())
        }
    };

    if let Some(path) = &config.subjects_file {
        seed::load_subjects(store.as_ref(), path).await?;
    }

    let provisioners = provisioners::build(&config)?;
    let executor = Arc::new(
        StepExecutor::new(store.clone(), provisioners).with_retry_policy(config.retry_policy()),
    );
    let runner = Arc::new(BackgroundRunner::start(executor, config.runner_config()));

    let orchestrator = Arc::new(
        Orchestrator::new(store.clone(), runner.clone()).with_retry_window(config.retry_window),
    );

    let shutdown = CancellationToken::new();
    let scanner = Arc::new(RetryScanner::new(
        store.clone(),
        runner.clone(),
        config.scanner_config(),
    ));
    let scanner_handle = scanner.start(shutdown.clone());

    let app = build_router(orchestrator, config.store);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down");
    shutdown.cancel();
    if let Err(e) = scanner_handle.await {
        tracing::error!("Retry scanner task failed: {}", e);
    }
    if let Err(e) = runner.shutdown().await {
        tracing::warn!("Runner shutdown incomplete: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
