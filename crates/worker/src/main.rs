use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use cadence_infra::EngineConfig;
use cadence_infra::jobs::{JobEngine, PostgresJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cadence_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid DATABASE_MAX_CONNECTIONS: {value}"))?,
        Err(_) => 5,
    };

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PostgresJobStore::new(pool));
    store.ensure_schema().await.context("failed to prepare job schema")?;

    let registry = cadence_worker::builtin_registry()?;
    tracing::info!(job_types = ?registry.job_types(), "executors registered");

    let handle = JobEngine::new(store, registry, config)?.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    handle.shutdown().await;
    Ok(())
}
