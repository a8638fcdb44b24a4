use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobId;
use crate::report::ReportWindow;

/// Process-local broker backed by a mutex-guarded map.
pub mod memory;

#[cfg(feature = "postgres")]
/// PostgreSQL broker using `SKIP LOCKED` dequeue.
pub mod postgres;

pub use memory::InMemoryBroker;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBroker;

/// Name under which a task handler is registered.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(Cow<'static, str>);

impl TaskKind {
    /// Run one attempt of a job against its provider.
    pub const EXECUTE_JOB: TaskKind = TaskKind(Cow::Borrowed("execute_job"));
    /// Compute and persist the report for one window.
    pub const AGGREGATE_WINDOW: TaskKind =
        TaskKind(Cow::Borrowed("aggregate_window"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a task operates on.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskTarget {
    JobId(JobId),
    WindowSpec(ReportWindow),
}

impl TaskTarget {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            TaskTarget::JobId(id) => Some(*id),
            TaskTarget::WindowSpec(_) => None,
        }
    }

    pub fn window(&self) -> Option<ReportWindow> {
        match self {
            TaskTarget::WindowSpec(window) => Some(*window),
            TaskTarget::JobId(_) => None,
        }
    }
}

impl fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskTarget::JobId(id) => write!(f, "job {id}"),
            TaskTarget::WindowSpec(window) => write!(f, "window {window}"),
        }
    }
}

/// Wire envelope carried by the broker.
///
/// `attempt` counts deliveries of this task, starting at 1 on the first
/// dequeue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub task_id: TaskId,
    pub task_kind: TaskKind,
    #[serde(flatten)]
    pub target: TaskTarget,
    pub attempt: u32,
    pub not_before: Option<DateTime<Utc>>,
}

impl TaskEnvelope {
    pub fn new(
        task_kind: TaskKind,
        target: TaskTarget,
        not_before: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            task_kind,
            target,
            attempt: 0,
            not_before,
        }
    }
}

/// A task handed to a worker. Invisible to other workers until
/// `visible_until`, after which it is redelivered unless acked.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub envelope: TaskEnvelope,
    pub worker_id: String,
    pub visible_until: DateTime<Utc>,
}

impl Delivery {
    pub fn task_id(&self) -> TaskId {
        self.envelope.task_id
    }
}

/// At-least-once task channel between submitters and workers.
///
/// Delivery is FIFO-best-effort within a kind with no ordering across kinds.
/// Consumers must be idempotent: any task may be delivered more than once.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a task. It becomes visible at `not_before`, or immediately.
    async fn enqueue(
        &self,
        kind: TaskKind,
        target: TaskTarget,
        not_before: Option<DateTime<Utc>>,
    ) -> anyhow::Result<TaskId>;

    /// Take the next visible task, waiting up to `wait` for one to appear.
    async fn dequeue(
        &self,
        worker_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<Delivery>>;

    /// Remove a delivered task for good. Acking an unknown task is a no-op.
    async fn ack(&self, task_id: TaskId) -> anyhow::Result<()>;

    /// Return a delivered task to the queue, visible again after `delay`.
    async fn nack(
        &self,
        task_id: TaskId,
        delay: chrono::Duration,
    ) -> anyhow::Result<()>;

    /// Count tasks by kind and state.
    async fn snapshot(&self) -> anyhow::Result<BrokerSnapshot>;

    /// Whether an unacked task of `kind` for `target` exists, queued or in
    /// flight.
    async fn has_task(&self, kind: &TaskKind, target: &TaskTarget) -> anyhow::Result<bool>;

    /// Total number of tasks not yet acked.
    async fn depth(&self) -> anyhow::Result<usize> {
        Ok(self.snapshot().await?.total())
    }
}

/// Snapshot of broker state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Per-kind entry statistics.
    pub kinds: HashMap<String, BrokerSnapshotEntry>,
}

impl BrokerSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            kinds: HashMap::new(),
        }
    }

    pub fn entry_mut(&mut self, kind: &str) -> &mut BrokerSnapshotEntry {
        self.kinds.entry(kind.to_string()).or_default()
    }

    pub fn total(&self) -> usize {
        self.kinds.values().map(|entry| entry.total_count).sum()
    }
}

/// Statistics for a single task kind.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BrokerSnapshotEntry {
    /// Tasks visible now.
    pub ready_count: usize,
    /// Tasks waiting for `not_before` or a nack delay.
    pub delayed_count: usize,
    /// Tasks delivered and not yet acked.
    pub in_flight_count: usize,
    /// Total number of tasks of this kind.
    pub total_count: usize,
}
