use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;

use crate::aggregator::{AggregationPolicy, StatAggregator};
use crate::beat::Beat;
use crate::broker::{Broker, Delivery};
use crate::config::PipelineConfig;
use crate::events::JobEventPublisher;
use crate::registry::{TaskOutcome, TaskRegistry};
use crate::service::JobService;
use crate::store::Store;
use crate::telemetry;

use super::reaper::Reaper;
use super::worker::WorkerConfig;

/// Cancelled once by [`PipelineRuntime::shutdown`]. Workers, the beat and the
/// reaper check it between deliveries and ticks, never in the middle of one.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver one task to its handler and settle it with the broker.
///
/// `Retry` becomes a delayed nack; `Ack` and `Drop` both remove the task.
pub async fn process_delivery<B: Broker + ?Sized>(
    broker: &B,
    registry: &TaskRegistry,
    delivery: Delivery,
) -> TaskOutcome {
    let task_id = delivery.task_id();
    let kind = delivery.envelope.task_kind.clone();
    let outcome = telemetry::instrument_dispatch(
        task_id.to_string(),
        kind.as_str(),
        delivery.envelope.attempt,
        registry.dispatch(&delivery),
    )
    .await;
    telemetry::record_task_outcome(kind.as_str(), outcome.label());

    let settled = match &outcome {
        TaskOutcome::Ack => broker.ack(task_id).await,
        TaskOutcome::Retry { delay, reason } => {
            tracing::debug!(
                task_id = %task_id,
                task_kind = %kind,
                delay_ms = delay.num_milliseconds(),
                "task returned to queue: {reason}"
            );
            broker.nack(task_id, *delay).await
        }
        TaskOutcome::Drop { reason } => {
            tracing::error!(
                task_id = %task_id,
                task_kind = %kind,
                attempt = delivery.envelope.attempt,
                "task dropped: {reason}"
            );
            broker.ack(task_id).await
        }
    };
    if let Err(err) = settled {
        tracing::warn!("settling task {task_id} failed: {err}");
    }
    outcome
}

/// Owns the broker, store and handlers, and runs the background loops: the
/// worker pool, the beat and the reaper.
pub struct PipelineRuntime<B, S>
where
    B: Broker + 'static,
    S: Store + 'static,
{
    config: PipelineConfig,
    broker: Arc<B>,
    store: Arc<S>,
    registry: Arc<TaskRegistry>,
    events: Arc<dyn JobEventPublisher + 'static>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<B, S> fmt::Debug for PipelineRuntime<B, S>
where
    B: Broker + 'static,
    S: Store + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .ok();
        f.debug_struct("PipelineRuntime")
            .field("config", &self.config)
            .field("broker_type", &type_name::<B>())
            .field("store_type", &type_name::<S>())
            .field("registry", &self.registry)
            .field("shutdown_requested", &self.shutdown_token.is_cancelled())
            .field("worker_count", &worker_count)
            .finish()
    }
}

impl<B, S> PipelineRuntime<B, S>
where
    B: Broker + 'static,
    S: Store + 'static,
{
    /// Create a runtime from explicit parts. Prefer
    /// [`PipelineRuntimeBuilder`](super::PipelineRuntimeBuilder), which also
    /// registers the built-in handlers.
    pub fn new(
        config: PipelineConfig,
        broker: Arc<B>,
        store: Arc<S>,
        registry: TaskRegistry,
        events: Arc<dyn JobEventPublisher + 'static>,
    ) -> Self {
        Self {
            config,
            broker,
            store,
            registry: Arc::new(registry),
            events,
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn broker(&self) -> Arc<B> {
        Arc::clone(&self.broker)
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn events(&self) -> Arc<dyn JobEventPublisher> {
        Arc::clone(&self.events)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Submission and query API over this runtime's broker and store.
    pub fn service(&self) -> JobService<B, S> {
        JobService::new(self.broker(), self.store(), self.events(), &self.config)
    }

    pub fn reaper(&self) -> Reaper<B, S> {
        Reaper::new(self.broker(), self.store(), self.events(), &self.config)
    }

    pub fn beat(&self) -> Beat<B> {
        Beat::new(self.broker(), self.config.aggregation_window_hours)
    }

    /// Aggregator with this runtime's store and settings, for on-demand
    /// reports.
    pub fn aggregator(&self) -> StatAggregator<S> {
        StatAggregator::new(
            self.store(),
            self.events(),
            AggregationPolicy::from(&self.config),
            self.config.store_timeout(),
        )
    }

    /// Start the worker pool, the beat and the reaper.
    pub async fn start(&self) -> anyhow::Result<()> {
        tracing::info!(
            parallelism = self.config.worker.parallelism,
            "starting pipeline runtime"
        );
        self.spawn_worker_pool(self.config.worker.parallelism).await;
        self.spawn_beat().await;
        self.spawn_reaper().await;
        Ok(())
    }

    /// Stop the background loops and wait for in-flight deliveries.
    ///
    /// Workers stop dequeuing once the token is cancelled. A delivery a worker
    /// already holds is processed and settled before that worker exits. Loops
    /// still busy after `worker.drainTimeoutMs` are aborted; their tasks stay
    /// unacked and reappear after the visibility timeout.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.shutdown_token.cancel();

        let handles = std::mem::take(&mut *self.worker_handles.lock().await);
        let drain_timeout = Duration::from_millis(self.config.worker.drain_timeout_ms);
        tracing::info!(
            loops = handles.len(),
            drain_timeout_ms = self.config.worker.drain_timeout_ms,
            "draining pipeline runtime"
        );

        let deadline = tokio::time::Instant::now() + drain_timeout;
        let mut aborted = 0usize;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("background loop ended abnormally: {err}"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            tracing::warn!(aborted, "drain timeout elapsed; busy loops were aborted");
        }
        tracing::info!("pipeline runtime stopped");
        Ok(())
    }

    /// Dequeue and process at most one task. Returns `None` if nothing became
    /// available within `wait`.
    pub async fn process_next(
        &self,
        worker_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<TaskOutcome>> {
        match self.broker.dequeue(worker_id, wait).await? {
            Some(delivery) => Ok(Some(
                process_delivery(&*self.broker, &self.registry, delivery).await,
            )),
            None => Ok(None),
        }
    }

    /// Spawn `parallelism` workers pulling from the broker.
    pub async fn spawn_worker_pool(&self, parallelism: usize) {
        let worker_config = self.config.worker.clone();

        for i in 0..parallelism {
            let worker_id = worker_config.worker_id(i);
            let broker = self.broker();
            let registry = self.registry();
            let shutdown = self.shutdown_token.clone();
            let config = worker_config.clone();

            let handle = tokio::spawn(async move {
                Self::worker_loop(worker_id, broker, registry, shutdown, config)
                    .await;
            });

            let mut handles = self.worker_handles.lock().await;
            handles.push(handle);
        }
    }

    /// Spawn the beat, which enqueues each closed aggregation window.
    pub async fn spawn_beat(&self) {
        let beat = self.beat();
        let period = self.config.beat_interval();
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Beat shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = beat.tick(Utc::now()).await {
                            tracing::warn!("beat tick error: {err}");
                        }
                    }
                }
            }
        });
        self.worker_handles.lock().await.push(handle);
    }

    /// Spawn the reaper, which recovers abandoned and orphaned jobs.
    pub async fn spawn_reaper(&self) {
        let reaper = self.reaper();
        let interval = self.config.reaper_interval();
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Reaper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = reaper.sweep(Utc::now()).await {
                            tracing::warn!("reaper sweep error: {err}");
                        }
                    }
                }
            }
        });
        self.worker_handles.lock().await.push(handle);
    }

    async fn worker_loop(
        worker_id: String,
        broker: Arc<B>,
        registry: Arc<TaskRegistry>,
        shutdown: ShutdownToken,
        config: WorkerConfig,
    ) {
        let poll_wait = Duration::from_millis(config.poll_wait_ms);
        let error_backoff = Duration::from_millis(config.error_backoff_ms);

        let mut settled = 0u64;
        loop {
            // Cancellation only interrupts the wait for work. A delivery
            // taken off the broker is always settled.
            let dequeued = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                dequeued = broker.dequeue(&worker_id, poll_wait) => dequeued,
            };

            match dequeued {
                Ok(Some(delivery)) => {
                    process_delivery(&*broker, &registry, delivery).await;
                    settled += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("worker {worker_id} dequeue error: {err}");
                    tokio::time::sleep(error_backoff).await;
                }
            }
        }
        tracing::info!(worker_id = %worker_id, settled, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, TaskKind, TaskTarget};
    use crate::events::InProcEventBus;
    use crate::job::JobId;
    use crate::registry::TaskHandler;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, _delivery: &Delivery) -> TaskOutcome {
            // First delivery asks for a retry; later ones succeed
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                TaskOutcome::retry(chrono::Duration::zero(), "first try")
            } else {
                TaskOutcome::Ack
            }
        }
    }

    /// Acks after `work`, flagging when it starts and when it finishes.
    struct Busy {
        work: Duration,
        started: Notify,
        finished: AtomicBool,
    }

    impl Busy {
        fn new(work: Duration) -> Self {
            Self {
                work,
                started: Notify::new(),
                finished: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TaskHandler for Busy {
        async fn handle(&self, _delivery: &Delivery) -> TaskOutcome {
            self.started.notify_one();
            tokio::time::sleep(self.work).await;
            self.finished.store(true, Ordering::SeqCst);
            TaskOutcome::Ack
        }
    }

    fn build_runtime(
        handler: Arc<dyn TaskHandler>,
        worker: WorkerConfig,
    ) -> PipelineRuntime<InMemoryBroker, InMemoryStore> {
        let mut config = PipelineConfig::default();
        config.worker = worker;
        PipelineRuntime::new(
            config,
            Arc::new(InMemoryBroker::new(Duration::from_secs(30))),
            Arc::new(InMemoryStore::new()),
            TaskRegistry::new().with(TaskKind::EXECUTE_JOB, handler),
            Arc::new(InProcEventBus::default()),
        )
    }

    fn test_workers() -> WorkerConfig {
        WorkerConfig::new("test").with_poll_wait(10)
    }

    async fn enqueue_one(broker: &InMemoryBroker) {
        broker
            .enqueue(TaskKind::EXECUTE_JOB, TaskTarget::JobId(JobId::new()), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_delivery() {
        let handler = Arc::new(Busy::new(Duration::from_millis(200)));
        let runtime = build_runtime(handler.clone(), test_workers());
        let broker = runtime.broker();
        runtime.spawn_worker_pool(1).await;
        enqueue_one(&broker).await;

        timeout(Duration::from_secs(5), handler.started.notified())
            .await
            .expect("worker never picked up the task");
        assert!(!handler.finished.load(Ordering::SeqCst));

        timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("shutdown timed out")
            .unwrap();

        // The delivery was finished and acked before shutdown returned.
        assert!(handler.finished.load(Ordering::SeqCst));
        assert_eq!(broker.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_workers_stop_dequeuing_after_shutdown() {
        let handler = Arc::new(Counting::default());
        let runtime = build_runtime(handler.clone(), test_workers());
        let broker = runtime.broker();
        runtime.spawn_worker_pool(3).await;

        runtime.shutdown().await.unwrap();
        assert!(runtime.shutdown_token().is_cancelled());

        enqueue_one(&broker).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_timeout_abandons_stuck_delivery() {
        let handler = Arc::new(Busy::new(Duration::from_secs(60)));
        let runtime = build_runtime(handler.clone(), test_workers().with_drain_timeout(50));
        let broker = runtime.broker();
        runtime.spawn_worker_pool(1).await;
        enqueue_one(&broker).await;

        timeout(Duration::from_secs(5), handler.started.notified())
            .await
            .expect("worker never picked up the task");
        timeout(Duration::from_secs(2), runtime.shutdown())
            .await
            .expect("shutdown ignored the drain timeout")
            .unwrap();

        // Never settled, so the task stays with the broker for redelivery.
        assert!(!handler.finished.load(Ordering::SeqCst));
        let snapshot = broker.snapshot().await.unwrap();
        assert_eq!(snapshot.total(), 1);
        assert_eq!(
            snapshot
                .kinds
                .get(TaskKind::EXECUTE_JOB.as_str())
                .map(|entry| entry.in_flight_count),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_process_next_settles_with_broker() {
        let handler = Arc::new(Counting::default());
        let runtime = build_runtime(handler.clone(), test_workers());
        enqueue_one(&runtime.broker()).await;

        let first = runtime.process_next("w0", Duration::ZERO).await.unwrap();
        assert_eq!(first.map(|o| o.label()), Some("retry"));
        assert_eq!(runtime.broker().depth().await.unwrap(), 1);

        let second = runtime
            .process_next("w0", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(second, Some(TaskOutcome::Ack));
        assert_eq!(runtime.broker().depth().await.unwrap(), 0);
        assert!(
            runtime
                .process_next("w0", Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_unknown_kind_is_removed() {
        let runtime = build_runtime(Arc::new(Counting::default()), test_workers());
        runtime
            .broker()
            .enqueue(TaskKind::new("mystery"), TaskTarget::JobId(JobId::new()), None)
            .await
            .unwrap();

        let outcome = runtime.process_next("w0", Duration::ZERO).await.unwrap();
        assert_eq!(outcome.map(|o| o.label()), Some("drop"));
        assert_eq!(runtime.broker().depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_pool_drains_and_shuts_down() {
        let handler = Arc::new(Counting::default());
        let runtime = build_runtime(handler.clone(), test_workers());
        let broker = runtime.broker();
        enqueue_one(&broker).await;

        runtime.spawn_worker_pool(2).await;

        timeout(Duration::from_secs(5), async {
            while broker.depth().await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker pool did not drain the queue");

        timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("shutdown timed out")
            .unwrap();
        assert!(runtime.shutdown_token().is_cancelled());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}
