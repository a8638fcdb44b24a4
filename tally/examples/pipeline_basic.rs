//! Basic pipeline example with the in-memory broker and store.
//!
//! Submits a batch of jobs against a toy provider that fails now and then,
//! waits for every job to settle and prints a report over the batch.
//!
//! For a PostgreSQL-backed setup, see `postgres_pipeline.rs`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tally::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Provider that rejects every seventh call permanently and every third
/// retryably.
#[derive(Default)]
struct ToyProvider {
    calls: AtomicU32,
}

#[async_trait]
impl ProviderClient for ToyProvider {
    async fn call(&self, job: &JobRecord) -> Result<serde_json::Value, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(Duration::from_millis(20 + u64::from(n % 5) * 10)).await;

        if n % 7 == 0 {
            return Err(ProviderError::permanent(format!("rejected {}", job.payload)));
        }
        if n % 3 == 0 {
            return Err(ProviderError::retryable("upstream busy"));
        }
        Ok(serde_json::json!({"confirmation": format!("CONF-{n:04}")}))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = PipelineConfig::from_env()?;
    config.retry.backoff_base_ms = config.retry.backoff_base_ms.min(100);
    config.retry.backoff_cap_ms = config.retry.backoff_cap_ms.max(config.retry.backoff_base_ms);
    config.worker = config.worker.with_parallelism(4);

    let runtime = PipelineRuntimeBuilder::new(config.clone())
        .with_broker(Arc::new(InMemoryBroker::new(config.visibility_timeout())))
        .with_store(Arc::new(InMemoryStore::new()))
        .with_provider(Arc::new(ToyProvider::default()))
        .build()?;
    runtime.start().await?;

    let started = Utc::now();
    let service = runtime.service();
    let mut job_ids = Vec::new();
    for order in 0..4 {
        for line in 0..5 {
            let job_id = service
                .submit_job(
                    format!("order-{order}"),
                    if line % 2 == 0 { "acme" } else { "globex" },
                    serde_json::json!({"line": line}),
                )
                .await?;
            job_ids.push(job_id);
        }
    }
    println!("Submitted {} jobs", job_ids.len());

    loop {
        let mut open = 0;
        for job_id in &job_ids {
            if !service.get_job(*job_id).await?.status.is_terminal() {
                open += 1;
            }
        }
        if open == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for order in 0..4 {
        let order_id = OrderId::new(format!("order-{order}"));
        println!("{order_id}: {:?}", service.order_status(&order_id).await?);
    }

    let window = ReportWindow::new(started, Utc::now() + chrono::Duration::seconds(1))?;
    let report = runtime.aggregator().run(window).await?;
    println!("\nReport for {}", report.window);
    for (name, value) in &report.metrics {
        println!("  {name:<32} {value:>10.3}");
    }

    runtime.shutdown().await?;
    Ok(())
}
