use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, trace};

use super::{
    Broker, BrokerSnapshot, Delivery, TaskEnvelope, TaskId, TaskKind, TaskTarget,
};

/// How often `dequeue` polls while waiting for a visible task.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// PostgreSQL-backed broker.
///
/// Tasks live in `tally_tasks` (created by
/// [`PostgresStore::migrate`](crate::store::PostgresStore::migrate)). A
/// dequeue claims the oldest visible row with `FOR UPDATE SKIP LOCKED` and
/// pushes its `available_at` out by the visibility timeout; a row that is
/// neither acked nor nacked by then becomes visible again.
#[derive(Clone, Debug)]
pub struct PostgresBroker {
    pool: PgPool,
    visibility_timeout: chrono::Duration,
    poll_interval: Duration,
}

impl PostgresBroker {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout: chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_take(&self, worker_id: &str) -> anyhow::Result<Option<Delivery>> {
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM tally_tasks
                WHERE available_at <= NOW()
                ORDER BY available_at, seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tally_tasks t
            SET attempt = t.attempt + 1,
                worker_id = $1,
                available_at = NOW() + ($2::bigint) * INTERVAL '1 millisecond'
            FROM next
            WHERE t.id = next.id
            RETURNING t.id, t.task_kind, t.target, t.attempt, t.not_before,
                      t.available_at
            "#,
        )
        .bind(worker_id)
        .bind(self.visibility_timeout.num_milliseconds())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let delivery = Self::delivery_from_row(&row, worker_id)?;
        trace!(
            task_id = %delivery.task_id(),
            attempt = delivery.envelope.attempt,
            "claimed task"
        );
        Ok(Some(delivery))
    }

    fn delivery_from_row(row: &PgRow, worker_id: &str) -> anyhow::Result<Delivery> {
        let target: TaskTarget = serde_json::from_value(row.try_get("target")?)?;
        let attempt: i32 = row.try_get("attempt")?;
        let visible_until: DateTime<Utc> = row.try_get("available_at")?;

        Ok(Delivery {
            envelope: TaskEnvelope {
                task_id: TaskId(row.try_get("id")?),
                task_kind: TaskKind::new(row.try_get::<String, _>("task_kind")?),
                target,
                attempt: u32::try_from(attempt)?,
                not_before: row.try_get("not_before")?,
            },
            worker_id: worker_id.to_string(),
            visible_until,
        })
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    async fn enqueue(
        &self,
        kind: TaskKind,
        target: TaskTarget,
        not_before: Option<DateTime<Utc>>,
    ) -> anyhow::Result<TaskId> {
        let envelope = TaskEnvelope::new(kind, target, not_before);
        sqlx::query(
            r#"
            INSERT INTO tally_tasks (id, task_kind, target, attempt, not_before, available_at)
            VALUES ($1, $2, $3, 0, $4, COALESCE($4, NOW()))
            "#,
        )
        .bind(envelope.task_id.0)
        .bind(envelope.task_kind.as_str())
        .bind(serde_json::to_value(&envelope.target)?)
        .bind(envelope.not_before)
        .execute(&self.pool)
        .await?;

        debug!(
            task_id = %envelope.task_id,
            task_kind = %envelope.task_kind,
            "enqueued task"
        );
        Ok(envelope.task_id)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_take(worker_id).await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    async fn ack(&self, task_id: TaskId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM tally_tasks WHERE id = $1")
            .bind(task_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        task_id: TaskId,
        delay: chrono::Duration,
    ) -> anyhow::Result<()> {
        let delay_ms = delay.num_milliseconds().max(0);
        sqlx::query(
            r#"
            UPDATE tally_tasks
            SET worker_id = NULL,
                available_at = NOW() + ($2::bigint) * INTERVAL '1 millisecond',
                not_before = NOW() + ($2::bigint) * INTERVAL '1 millisecond'
            WHERE id = $1
            "#,
        )
        .bind(task_id.0)
        .bind(delay_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_task(&self, kind: &TaskKind, target: &TaskTarget) -> anyhow::Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM tally_tasks WHERE task_kind = $1 AND target = $2)",
        )
        .bind(kind.as_str())
        .bind(serde_json::to_value(target)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn snapshot(&self) -> anyhow::Result<BrokerSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT task_kind,
                   COUNT(*) FILTER (WHERE available_at <= NOW()) AS ready_count,
                   COUNT(*) FILTER (WHERE available_at > NOW() AND worker_id IS NULL) AS delayed_count,
                   COUNT(*) FILTER (WHERE available_at > NOW() AND worker_id IS NOT NULL) AS in_flight_count,
                   COUNT(*) AS total_count
            FROM tally_tasks
            GROUP BY task_kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = BrokerSnapshot::new(Utc::now());
        for row in rows {
            let kind: String = row.try_get("task_kind")?;
            let entry = snapshot.entry_mut(&kind);
            entry.ready_count = usize::try_from(row.try_get::<i64, _>("ready_count")?)?;
            entry.delayed_count = usize::try_from(row.try_get::<i64, _>("delayed_count")?)?;
            entry.in_flight_count =
                usize::try_from(row.try_get::<i64, _>("in_flight_count")?)?;
            entry.total_count = usize::try_from(row.try_get::<i64, _>("total_count")?)?;
        }
        Ok(snapshot)
    }
}
