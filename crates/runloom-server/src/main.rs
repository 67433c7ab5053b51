use std::sync::Arc;

use anyhow::Context;
use runloom_engine::{Engine, EngineConfig, NodeRegistry, PostgresWorkflowStore};
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

use runloom_server::{app, config::ServerConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let pool = PgPool::connect(&config.database_url)
        .await
        .context("failed to connect to PostgreSQL")?;
    let store = Arc::new(PostgresWorkflowStore::new(pool));
    store.migrate().await.context("schema migration failed")?;

    // Node implementations are registered by the embedding deployment;
    // remote workers bring their own and only use the claim protocol here.
    let registry = Arc::new(NodeRegistry::new());
    let engine = Engine::new(store, registry, EngineConfig::default());

    let state = AppState {
        engine,
        api_token: config.api_token.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "runloom server listening");

    axum::serve(listener, app(state)).await?;
    Ok(())
}
