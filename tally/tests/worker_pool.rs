//! The worker pool under concurrency: duplicate deliveries, store outages
//! during execution, and many jobs across many workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tally::{
    Broker, InMemoryBroker, JobId, JobRecord, JobStatus, PipelineConfig, PipelineRuntime,
    PipelineRuntimeBuilder, ProviderClient, ProviderError, Store, TaskKind, TaskTarget,
    WorkerConfig,
};
use tally_testkit::{FlakyStore, MockProvider, SlowProvider, count_outcomes, drain};
use tokio::time::timeout;

const IDLE: Duration = Duration::from_millis(300);

fn config(workers: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.max_attempts = 3;
    config.retry.backoff_base_ms = 10;
    config.retry.backoff_cap_ms = 100;
    config.provider_call_timeout_ms = 2_000;
    config.visibility_timeout_ms = 5_000;
    config.worker = WorkerConfig::new("pool-test")
        .with_parallelism(workers)
        .with_poll_wait(10);
    config
}

fn runtime<S, P>(config: PipelineConfig, store: S, provider: P) -> PipelineRuntime<InMemoryBroker, S>
where
    S: Store + 'static,
    P: ProviderClient + 'static,
{
    PipelineRuntimeBuilder::new(config.clone())
        .with_broker(Arc::new(InMemoryBroker::new(config.visibility_timeout())))
        .with_store(Arc::new(store))
        .with_provider(Arc::new(provider))
        .build()
        .expect("runtime should build")
}

/// Poll until every job in `ids` is terminal. Failed reads count as not
/// settled yet, so injected store failures don't end the wait.
async fn wait_for_terminal<S: Store + 'static>(
    runtime: &PipelineRuntime<InMemoryBroker, S>,
    ids: &[JobId],
) {
    let service = runtime.service();
    timeout(Duration::from_secs(15), async {
        loop {
            let mut settled = 0;
            for id in ids {
                if matches!(service.get_job(*id).await, Ok(job) if job.status.is_terminal()) {
                    settled += 1;
                }
            }
            if settled == ids.len() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("jobs did not settle in time");
}

#[tokio::test]
async fn duplicate_deliveries_across_workers_call_provider_once() {
    let provider = SlowProvider::new(Duration::from_millis(150));
    let runtime = runtime(config(8), tally::InMemoryStore::new(), provider.clone());
    let broker = runtime.broker();

    let job_id = runtime
        .service()
        .submit_job("order-dup", "acme", serde_json::json!({"sku": "A"}))
        .await
        .unwrap();
    for _ in 0..7 {
        broker
            .enqueue(TaskKind::EXECUTE_JOB, TaskTarget::JobId(job_id), None)
            .await
            .unwrap();
    }
    assert_eq!(broker.depth().await.unwrap(), 8);

    runtime.spawn_worker_pool(8).await;
    wait_for_terminal(&runtime, &[job_id]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.shutdown().await.unwrap();

    assert_eq!(provider.call_count(), 1);
    let job = runtime.service().get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn store_outage_during_execution_is_retried_until_success() {
    let store = FlakyStore::new();
    let provider = MockProvider::new();
    let runtime = runtime(config(1), store.clone(), provider.clone());

    let job_id = runtime
        .service()
        .submit_job("order-outage", "acme", serde_json::json!({}))
        .await
        .unwrap();

    store.fail_next(1);
    let outcomes = drain(&runtime, IDLE).await.unwrap();
    assert_eq!(outcomes.first().map(|o| o.label()), Some("retry"));
    assert_eq!(count_outcomes(&outcomes, "retry"), 1);
    assert_eq!(count_outcomes(&outcomes, "ack"), 1);
    assert_eq!(store.failed_calls(), 1);

    let job = runtime.service().get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 1);
    provider.assert_call_count_eq(1);
}

#[tokio::test]
async fn store_outage_through_the_pool_still_settles_the_job() {
    let store = FlakyStore::new();
    let provider = MockProvider::new();
    let runtime = runtime(config(2), store.clone(), provider.clone());

    let job_id = runtime
        .service()
        .submit_job("order-outage", "acme", serde_json::json!({}))
        .await
        .unwrap();
    store.fail_next(2);

    runtime.spawn_worker_pool(2).await;
    wait_for_terminal(&runtime, &[job_id]).await;
    runtime.shutdown().await.unwrap();

    assert_eq!(store.failed_calls(), 2);
    assert_eq!(
        runtime.service().get_job(job_id).await.unwrap().status,
        JobStatus::Succeeded
    );
    provider.assert_call_count_eq(1);
}

/// Outcome is a function of the job's payload and attempt number:
/// `n % 5 == 0` fails permanently, `n % 3 == 0` fails once then succeeds,
/// anything else succeeds at once.
#[derive(Default)]
struct PayloadDriven {
    calls: AtomicUsize,
}

#[async_trait]
impl ProviderClient for PayloadDriven {
    async fn call(&self, job: &JobRecord) -> Result<serde_json::Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let n = job.payload["n"].as_u64().unwrap_or_default();
        if n % 5 == 0 {
            Err(ProviderError::permanent(format!("job {n} rejected")))
        } else if n % 3 == 0 && job.attempts == 1 {
            Err(ProviderError::retryable(format!("job {n} busy")))
        } else {
            Ok(serde_json::json!({"n": n}))
        }
    }
}

#[tokio::test]
async fn stress_sixty_jobs_with_eight_workers() {
    const JOBS: u64 = 60;
    let provider = Arc::new(PayloadDriven::default());
    let config = config(8);
    let max_attempts = config.retry.max_attempts;
    let runtime = PipelineRuntimeBuilder::new(config.clone())
        .with_broker(Arc::new(InMemoryBroker::new(config.visibility_timeout())))
        .with_store(Arc::new(tally::InMemoryStore::new()))
        .with_provider(provider.clone())
        .build()
        .expect("runtime should build");

    runtime.spawn_worker_pool(8).await;
    let service = runtime.service();
    let mut ids = Vec::new();
    for n in 1..=JOBS {
        let id = service
            .submit_job(format!("order-{}", n % 7), "acme", serde_json::json!({"n": n}))
            .await
            .unwrap();
        ids.push((n, id));
    }

    let job_ids: Vec<JobId> = ids.iter().map(|(_, id)| *id).collect();
    wait_for_terminal(&runtime, &job_ids).await;
    runtime.shutdown().await.unwrap();

    let mut total_attempts = 0;
    for (n, id) in &ids {
        let job = service.get_job(*id).await.unwrap();
        assert!(job.attempts >= 1 && job.attempts <= max_attempts, "job {n}");
        total_attempts += job.attempts as usize;

        let (status, attempts) = if n % 5 == 0 {
            (JobStatus::Failed, 1)
        } else if n % 3 == 0 {
            (JobStatus::Succeeded, 2)
        } else {
            (JobStatus::Succeeded, 1)
        };
        assert_eq!(job.status, status, "job {n}");
        assert_eq!(job.attempts, attempts, "job {n}");
    }

    // One provider call per recorded attempt: no attempt ran twice.
    assert_eq!(provider.calls.load(Ordering::SeqCst), total_attempts);
}
