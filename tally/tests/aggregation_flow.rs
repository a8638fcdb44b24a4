//! Aggregation from task to persisted report.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tally::{
    Broker, InMemoryBroker, JobEventPayload, JobStore, PipelineConfig, PipelineError,
    PipelineRuntime, PipelineRuntimeBuilder, TaskKind, TaskTarget, closed_window,
};
use tally_testkit::{FlakyStore, JobFixture, MockProvider, count_outcomes, drain, epoch, window_hours};

const IDLE: Duration = Duration::from_millis(300);

fn runtime(store: FlakyStore) -> PipelineRuntime<InMemoryBroker, FlakyStore> {
    let mut config = PipelineConfig::default();
    config.retry.backoff_base_ms = 10;
    config.retry.backoff_cap_ms = 100;
    config.aggregation_window_hours = 1;
    PipelineRuntimeBuilder::new(config.clone())
        .with_broker(Arc::new(InMemoryBroker::new(config.visibility_timeout())))
        .with_store(Arc::new(store))
        .with_provider(Arc::new(MockProvider::new()))
        .build()
        .expect("runtime should build")
}

async fn seed(runtime: &PipelineRuntime<InMemoryBroker, FlakyStore>, fixture: &JobFixture) {
    for i in 0..8 {
        let job = fixture.clone().provider("acme").succeeded(100 + i * 10);
        runtime.store().insert_job(&job).await.unwrap();
    }
    for _ in 0..2 {
        let job = fixture.clone().provider("globex").failed(50);
        runtime.store().insert_job(&job).await.unwrap();
    }
}

#[tokio::test]
async fn eighty_twenty_window_reports_eighty_percent_success() {
    let runtime = runtime(FlakyStore::new());
    let window = window_hours(epoch(), 24);
    seed(&runtime, &JobFixture::new().created_at(epoch() + ChronoDuration::hours(2))).await;

    runtime
        .broker()
        .enqueue(TaskKind::AGGREGATE_WINDOW, TaskTarget::WindowSpec(window), None)
        .await
        .unwrap();
    drain(&runtime, IDLE).await.unwrap();

    let reports = runtime
        .service()
        .list_reports(window.start(), window.end())
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.window, window);
    assert_eq!(report.source_job_count, 10);
    assert_eq!(report.metric("count"), Some(10.0));
    assert!((report.metric("success_rate").unwrap() - 0.8).abs() < 1e-9);
    assert!((report.metric("failure_rate").unwrap() - 0.2).abs() < 1e-9);
    assert_eq!(report.metric("provider.acme.count"), Some(8.0));
    assert_eq!(report.metric("provider.globex.failed"), Some(2.0));
    assert_eq!(report.metric("duration_count"), Some(8.0));
}

#[tokio::test]
async fn empty_window_still_produces_a_report() {
    let runtime = runtime(FlakyStore::new());
    let window = window_hours(epoch(), 1);

    let report = runtime.aggregator().run(window).await.unwrap();
    assert_eq!(report.source_job_count, 0);
    assert_eq!(report.metric("count"), Some(0.0));
    assert_eq!(report.metric("success_rate"), Some(0.0));
    assert_eq!(report.metric("duration_p50_ms"), Some(0.0));
}

#[tokio::test]
async fn jobs_outside_the_window_are_ignored() {
    let runtime = runtime(FlakyStore::new());
    let window = window_hours(epoch(), 1);
    seed(&runtime, &JobFixture::new().created_at(epoch() + ChronoDuration::hours(3))).await;
    let inside = JobFixture::new()
        .created_at(epoch() + ChronoDuration::minutes(5))
        .succeeded(200);
    runtime.store().insert_job(&inside).await.unwrap();

    let report = runtime.aggregator().run(window).await.unwrap();
    assert_eq!(report.source_job_count, 1);
    assert_eq!(report.metric("success_rate"), Some(1.0));
    assert_eq!(report.metric("avg_duration_ms"), Some(200.0));
}

#[tokio::test]
async fn store_outage_during_aggregation_is_retried() {
    let store = FlakyStore::new();
    let runtime = runtime(store.clone());
    let window = window_hours(epoch(), 24);
    seed(&runtime, &JobFixture::new().created_at(epoch() + ChronoDuration::hours(1))).await;

    store.fail_next(1);
    runtime
        .broker()
        .enqueue(TaskKind::AGGREGATE_WINDOW, TaskTarget::WindowSpec(window), None)
        .await
        .unwrap();
    let outcomes = drain(&runtime, IDLE).await.unwrap();

    assert_eq!(store.failed_calls(), 1);
    assert_eq!(count_outcomes(&outcomes, "retry"), 1);
    assert_eq!(count_outcomes(&outcomes, "ack"), 1);
    assert_eq!(store.inner().report_count(), 1);
}

#[tokio::test]
async fn persistent_store_outage_drops_the_task_after_max_attempts() {
    let store = FlakyStore::new();
    let runtime = runtime(store.clone());
    let window = window_hours(epoch(), 24);

    store.fail_next(100);
    runtime
        .broker()
        .enqueue(TaskKind::AGGREGATE_WINDOW, TaskTarget::WindowSpec(window), None)
        .await
        .unwrap();
    let outcomes = drain(&runtime, IDLE).await.unwrap();

    assert_eq!(count_outcomes(&outcomes, "retry"), 2);
    assert_eq!(count_outcomes(&outcomes, "drop"), 1);
    assert_eq!(store.inner().report_count(), 0);
    assert_eq!(runtime.broker().depth().await.unwrap(), 0);
}

#[tokio::test]
async fn beat_enqueues_the_closed_window_once() {
    let runtime = runtime(FlakyStore::new());
    let mut events = runtime.events().subscribe_jobs();
    let now = Utc::now();
    let expected = closed_window(now, 1);
    seed(
        &runtime,
        &JobFixture::new().created_at(expected.start() + ChronoDuration::minutes(10)),
    )
    .await;

    let beat = runtime.beat();
    assert!(beat.tick(now).await.unwrap().is_some());
    assert!(beat.tick(now).await.unwrap().is_none());
    drain(&runtime, IDLE).await.unwrap();

    let reports = runtime
        .service()
        .list_reports(expected.start(), expected.end())
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].source_job_count, 10);

    let mut generated = 0;
    while let Ok(event) = events.try_recv() {
        if let JobEventPayload::ReportGenerated { window, .. } = event.payload {
            assert_eq!(window, expected);
            generated += 1;
        }
    }
    assert_eq!(generated, 1);
}

#[tokio::test]
async fn reversed_report_range_is_rejected() {
    let runtime = runtime(FlakyStore::new());
    let err = runtime
        .service()
        .list_reports(epoch(), epoch() - ChronoDuration::hours(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidWindow { .. }));
}
