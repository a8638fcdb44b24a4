use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobId, JobRecord, JobType, OrderId, ProviderId};
use crate::report::{Report, ReportId, ReportWindow};

/// Metadata envelope attached to every pipeline event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    /// Order id for job events, window for report events.
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        entity_id: impl Into<String>,
        correlation_id: Option<Uuid>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            entity_id: entity_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Pipeline event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    /// Event about `job`. The idempotency key is unique per job version, so
    /// a redelivered task that re-publishes produces the same key.
    pub fn for_job(job: &JobRecord, payload: JobEventPayload) -> Self {
        let key = format!("{}-{}-v{}", payload.name(), job.id, job.version);
        Self {
            meta: EventMeta::new(job.order_id.as_str(), None, key),
            payload,
        }
    }

    pub fn report_generated(report: &Report) -> Self {
        Self {
            meta: EventMeta::new(
                report.window.to_string(),
                None,
                format!("report-{}", report.id),
            ),
            payload: JobEventPayload::ReportGenerated {
                report_id: report.id,
                window: report.window,
                source_job_count: report.source_job_count,
            },
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.payload.job_id()
    }
}

/// Event payload emitted for job lifecycle transitions and reports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job was accepted and its first task enqueued.
    Submitted {
        job_id: JobId,
        order_id: OrderId,
        provider_id: ProviderId,
        job_type: JobType,
    },
    /// An attempt began.
    Started { job_id: JobId, attempt: u32 },
    /// Provider returned a result.
    Succeeded { job_id: JobId, attempts: u32 },
    /// Attempt failed and another is scheduled.
    RetryScheduled {
        job_id: JobId,
        attempt: u32,
        delay_ms: i64,
        error: String,
    },
    /// Job failed for good.
    Failed {
        job_id: JobId,
        attempts: u32,
        error: String,
    },
    Cancelled { job_id: JobId },
    /// A worker stopped reporting on a running attempt.
    Abandoned { job_id: JobId, attempt: u32 },
    /// A report was persisted.
    ReportGenerated {
        report_id: ReportId,
        window: ReportWindow,
        source_job_count: u64,
    },
}

impl JobEventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "submitted",
            Self::Started { .. } => "started",
            Self::Succeeded { .. } => "succeeded",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Abandoned { .. } => "abandoned",
            Self::ReportGenerated { .. } => "report_generated",
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Submitted { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Succeeded { job_id, .. }
            | Self::RetryScheduled { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id }
            | Self::Abandoned { job_id, .. } => Some(*job_id),
            Self::ReportGenerated { .. } => None,
        }
    }
}

/// Trait for publishing pipeline events.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published.
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;

    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for slow subscribers. A subscriber that falls
/// more than `capacity` events behind receives `RecvError::Lagged`; with no
/// subscribers, events are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering up to `capacity` events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event to all subscribers. Non-blocking.
    pub fn publish_job(&self, event: JobEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe_job_events(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.publish_job(event)
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.subscribe_job_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn started(job_id: JobId) -> JobEvent {
        JobEvent {
            meta: EventMeta::new("order-1", None, format!("started-{job_id}")),
            payload: JobEventPayload::Started { job_id, attempt: 1 },
        }
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);

        let mut rx1 = bus.subscribe_jobs();
        let mut rx2 = bus.subscribe_jobs();

        for _ in 0..5 {
            bus.publish(started(JobId::new())).await.unwrap();
        }

        for _ in 0..5 {
            assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
            assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe_jobs();

        for _ in 0..5 {
            bus.publish_job(started(JobId::new())).unwrap();
        }

        let result = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("recv should not hang");
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::default();
        assert!(bus.publish(started(JobId::new())).await.is_ok());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_bus_debug_format() {
        let bus = InProcEventBus::new(100);
        let _rx1 = bus.subscribe_jobs();
        let _rx2 = bus.subscribe_jobs();

        let debug_str = format!("{:?}", bus);
        assert!(debug_str.contains("InProcEventBus"));
        assert!(debug_str.contains("subscribers: 2"));
        assert!(debug_str.contains("capacity: 100"));
    }

    #[test]
    fn test_job_event_idempotency_key_tracks_version() {
        let mut job = JobRecord::new(
            "order-9".into(),
            "acme".into(),
            JobType::Shipping,
            serde_json::Value::Null,
            3,
            Utc::now(),
        );
        job.version = 4;
        let event = JobEvent::for_job(
            &job,
            JobEventPayload::Cancelled { job_id: job.id },
        );
        assert_eq!(event.meta.entity_id, "order-9");
        assert_eq!(
            event.meta.idempotency_key,
            format!("cancelled-{}-v4", job.id)
        );
        assert_eq!(event.job_id(), Some(job.id));
    }

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let job_id = JobId::new();
        let value = serde_json::to_value(JobEventPayload::Failed {
            job_id,
            attempts: 3,
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "failed");
        assert_eq!(value["attempts"], 3);
    }
}
