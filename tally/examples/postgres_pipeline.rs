//! Pipeline backed by PostgreSQL.
//!
//! Requires `DATABASE_URL`. Run with:
//! `cargo run -p tally --example postgres_pipeline --features postgres`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tally::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct EchoProvider;

#[async_trait]
impl ProviderClient for EchoProvider {
    async fn call(&self, job: &JobRecord) -> Result<serde_json::Value, ProviderError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(serde_json::json!({"echo": job.payload}))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL")?;
    let config = PipelineConfig::from_env()?;

    let store = PostgresStore::connect(&PersistenceConfig::new(database_url)).await?;
    store.migrate().await?;
    let broker = PostgresBroker::new(store.pool().clone(), config.visibility_timeout());

    let runtime = PipelineRuntimeBuilder::new(config)
        .with_broker(Arc::new(broker))
        .with_store(Arc::new(store))
        .with_provider(Arc::new(EchoProvider))
        .build()?;
    runtime.start().await?;

    let service = runtime.service();
    let job_id = service
        .submit_job("pg-order-1", "echo", serde_json::json!({"sku": "SKU-42"}))
        .await?;
    println!("Submitted job {job_id}");

    let view = loop {
        let view = service.get_job(job_id).await?;
        if view.status.is_terminal() {
            break view;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    println!("Job {} finished as {} after {} attempt(s)", view.id, view.status, view.attempts);

    runtime.shutdown().await?;
    Ok(())
}
