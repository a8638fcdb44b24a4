//! PostgreSQL store and broker tests.
//!
//! Run with `DATABASE_URL` pointing at a scratch database:
//! `cargo test -p tally --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::time::Duration;

use chrono::Utc;
use tally::{
    Broker, CasOutcome, JobStatus, JobStore, PersistenceConfig, PostgresBroker, PostgresStore,
    ReportStore, RetryPolicy, TaskKind, TaskTarget, TransitionGuard, state,
};
use tally_testkit::{JobFixture, window_hours};

async fn store() -> PostgresStore {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PostgresStore::connect(&PersistenceConfig::new(url))
        .await
        .expect("connect");
    store.migrate().await.expect("migrate");
    store
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn guarded_write_applies_once() {
    let store = store().await;
    let job = JobFixture::new().order(format!("pg-{}", unique_suffix())).pending();
    store.insert_job(&job).await.unwrap();

    let running = state::start(&job, Utc::now()).unwrap();
    let guard = TransitionGuard::of(&job);
    assert_eq!(
        store.compare_and_swap(&guard, &running).await.unwrap(),
        CasOutcome::Applied
    );

    match store.compare_and_swap(&guard, &running).await.unwrap() {
        CasOutcome::Stale { current: Some(current) } => {
            assert_eq!(current.status, JobStatus::Running);
            assert_eq!(current.attempts, 1);
        }
        other => panic!("expected stale outcome, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn exhausted_job_is_failed_in_storage() {
    let store = store().await;
    let policy = RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
    };
    let job = JobFixture::new().max_attempts(1).pending();
    store.insert_job(&job).await.unwrap();

    let running = state::start(&job, Utc::now()).unwrap();
    store
        .compare_and_swap(&TransitionGuard::of(&job), &running)
        .await
        .unwrap();
    let failed = state::fail_attempt(
        &running,
        &tally::ProviderError::retryable("upstream 503"),
        &policy,
        Utc::now(),
    )
    .unwrap();
    store
        .compare_and_swap(&TransitionGuard::of(&running), &failed)
        .await
        .unwrap();

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 1);
    assert!(stored.last_error.unwrap().contains("upstream 503"));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn reports_round_trip_through_json() {
    let store = store().await;
    let window = window_hours(Utc::now() - chrono::Duration::days(400), 1);
    let jobs = vec![JobFixture::new().succeeded(120), JobFixture::new().failed(30)];
    let (metrics, count) = tally::compute_metrics(&jobs, &Default::default());
    let report = tally::Report::new(window, metrics, count, Utc::now());
    store.insert_report(&report).await.unwrap();

    let listed = store.list_reports(window.start(), window.end()).await.unwrap();
    let found = listed.iter().find(|r| r.id == report.id).expect("report listed");
    assert_eq!(found.metric("success_rate"), Some(0.5));
    assert_eq!(found.source_job_count, 2);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn broker_redelivers_after_visibility_timeout() {
    let store = store().await;
    let broker = PostgresBroker::new(store.pool().clone(), Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(20));
    let job = JobFixture::new().pending();

    let task_id = broker
        .enqueue(TaskKind::EXECUTE_JOB, TaskTarget::JobId(job.id), None)
        .await
        .unwrap();

    let first = wait_for(&broker, task_id, "pg-w1").await;
    assert_eq!(first.envelope.attempt, 1);

    // Never acked; becomes visible again.
    let second = wait_for(&broker, task_id, "pg-w2").await;
    assert_eq!(second.envelope.attempt, 2);
    broker.ack(task_id).await.unwrap();
}

async fn wait_for(
    broker: &PostgresBroker,
    task_id: tally::TaskId,
    worker: &str,
) -> tally::Delivery {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Some(delivery) = broker.dequeue(worker, Duration::from_millis(500)).await.unwrap() {
            if delivery.task_id() == task_id {
                return delivery;
            }
            // Leftover task from an earlier run.
            broker.ack(delivery.task_id()).await.unwrap();
        }
    }
    panic!("task {task_id} was not delivered");
}

fn unique_suffix() -> String {
    Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string()
}
