use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::{
    Broker, BrokerSnapshot, Delivery, TaskEnvelope, TaskId, TaskKind, TaskTarget,
};

/// Upper bound on a single wait inside `dequeue`, so delayed tasks and
/// expired deliveries are noticed without an explicit wake-up.
const IDLE_TICK: Duration = Duration::from_millis(25);

#[derive(Clone, Debug)]
enum EntryState {
    Ready,
    InFlight {
        worker_id: String,
        visible_until: DateTime<Utc>,
    },
}

#[derive(Clone, Debug)]
struct Entry {
    envelope: TaskEnvelope,
    seq: u64,
    available_at: DateTime<Utc>,
    state: EntryState,
}

impl Entry {
    fn visible_at(&self) -> DateTime<Utc> {
        match &self.state {
            EntryState::Ready => self.available_at,
            EntryState::InFlight { visible_until, .. } => *visible_until,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<TaskId, Entry>,
    next_seq: u64,
}

/// In-memory broker with visibility-timeout redelivery.
///
/// Cloning shares the same queue.
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    visibility_timeout: chrono::Duration,
}

impl InMemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
            visibility_timeout: chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    pub fn visibility_timeout(&self) -> chrono::Duration {
        self.visibility_timeout
    }

    /// Envelopes of every task not yet acked, in delivery order.
    pub fn pending_envelopes(&self) -> Vec<TaskEnvelope> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner.entries.values().collect();
        entries.sort_by_key(|entry| (entry.visible_at(), entry.seq));
        entries.into_iter().map(|e| e.envelope.clone()).collect()
    }

    fn try_take(&self, worker_id: &str, now: DateTime<Utc>) -> Option<Delivery> {
        let mut inner = self.inner.lock();
        let task_id = inner
            .entries
            .values()
            .filter(|entry| entry.visible_at() <= now)
            .min_by_key(|entry| (entry.visible_at(), entry.seq))
            .map(|entry| entry.envelope.task_id)?;

        let entry = inner.entries.get_mut(&task_id)?;
        if let EntryState::InFlight { worker_id: prev, .. } = &entry.state {
            trace!(task_id = %task_id, previous_worker = %prev, "visibility timeout expired, redelivering");
        }
        let visible_until = now + self.visibility_timeout;
        entry.envelope.attempt += 1;
        entry.state = EntryState::InFlight {
            worker_id: worker_id.to_string(),
            visible_until,
        };

        Some(Delivery {
            envelope: entry.envelope.clone(),
            worker_id: worker_id.to_string(),
            visible_until,
        })
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(
        &self,
        kind: TaskKind,
        target: TaskTarget,
        not_before: Option<DateTime<Utc>>,
    ) -> anyhow::Result<TaskId> {
        let envelope = TaskEnvelope::new(kind, target, not_before);
        let task_id = envelope.task_id;
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.insert(
                task_id,
                Entry {
                    available_at: not_before.unwrap_or_else(Utc::now),
                    envelope,
                    seq,
                    state: EntryState::Ready,
                },
            );
        }
        self.notify.notify_waiters();
        Ok(task_id)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(worker_id, Utc::now()) {
                return Ok(Some(delivery));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(IDLE_TICK);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    async fn ack(&self, task_id: TaskId) -> anyhow::Result<()> {
        self.inner.lock().entries.remove(&task_id);
        Ok(())
    }

    async fn nack(
        &self,
        task_id: TaskId,
        delay: chrono::Duration,
    ) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get_mut(&task_id) {
                let available_at = Utc::now() + delay.max(chrono::Duration::zero());
                entry.available_at = available_at;
                entry.envelope.not_before = Some(available_at);
                entry.state = EntryState::Ready;
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn has_task(&self, kind: &TaskKind, target: &TaskTarget) -> anyhow::Result<bool> {
        Ok(self
            .inner
            .lock()
            .entries
            .values()
            .any(|entry| &entry.envelope.task_kind == kind && &entry.envelope.target == target))
    }

    async fn snapshot(&self) -> anyhow::Result<BrokerSnapshot> {
        let now = Utc::now();
        let mut snapshot = BrokerSnapshot::new(now);
        let inner = self.inner.lock();
        for entry in inner.entries.values() {
            let stats = snapshot.entry_mut(entry.envelope.task_kind.as_str());
            stats.total_count += 1;
            match &entry.state {
                EntryState::InFlight { visible_until, .. }
                    if *visible_until > now =>
                {
                    stats.in_flight_count += 1
                }
                _ if entry.visible_at() > now => stats.delayed_count += 1,
                _ => stats.ready_count += 1,
            }
        }
        Ok(snapshot)
    }
}
