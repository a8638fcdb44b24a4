use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to the customer order a job belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OrderId(String);

/// Reference to the service provider a job is executed against.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct ProviderId(String);

macro_rules! string_ref {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_ref!(OrderId);
string_ref!(ProviderId);

/// Category of work a job performs for its order.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Validation,
    #[default]
    Processing,
    Shipping,
    Reporting,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Validation => "validation",
            JobType::Processing => "processing",
            JobType::Shipping => "shipping",
            JobType::Reporting => "reporting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "validation" => Some(JobType::Validation),
            "processing" => Some(JobType::Processing),
            "shipping" => Some(JobType::Shipping),
            "reporting" => Some(JobType::Reporting),
            _ => None,
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job.
///
/// `Succeeded`, `Failed` and `Cancelled` are terminal. `Retrying` waits out
/// its backoff and then returns to `Pending`.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Retrying,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        JobStatus::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a dispatcher may still pick this job up.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Pending)
                | (Retrying, Cancelled)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one job. The store owns it; everything else works on
/// copies and writes back through compare-and-swap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub order_id: OrderId,
    pub provider_id: ProviderId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub cancel_requested: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    pub fn new(
        order_id: OrderId,
        provider_id: ProviderId,
        job_type: JobType,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            order_id,
            provider_id,
            job_type,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            cancel_requested: false,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
            last_error: None,
            result: None,
        }
    }

    /// Wall-clock duration of the last attempt in whole milliseconds.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) if end >= start => {
                Some((end - start).num_milliseconds())
            }
            _ => None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Aggregate status of an order derived from its jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn rollup(statuses: &[JobStatus]) -> Self {
        if statuses.is_empty() {
            return OrderStatus::Pending;
        }
        if statuses.contains(&JobStatus::Failed) {
            return OrderStatus::Failed;
        }
        if statuses.iter().all(|s| *s == JobStatus::Succeeded) {
            return OrderStatus::Completed;
        }
        if statuses.iter().all(JobStatus::is_terminal) {
            return OrderStatus::Cancelled;
        }
        if statuses.iter().any(|s| *s != JobStatus::Pending) {
            return OrderStatus::Processing;
        }
        OrderStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for from in JobStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn retrying_only_returns_to_pending_or_cancels() {
        let exits: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(|s| JobStatus::Retrying.can_transition_to(*s))
            .collect();
        assert_eq!(exits, vec![JobStatus::Pending, JobStatus::Cancelled]);
    }

    #[test]
    fn status_string_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn duration_requires_both_timestamps() {
        let now = Utc::now();
        let mut job = JobRecord::new(
            "order-1".into(),
            "acme".into(),
            JobType::Processing,
            serde_json::Value::Null,
            3,
            now,
        );
        assert_eq!(job.duration_ms(), None);

        job.started_at = Some(now);
        job.finished_at = Some(now + chrono::Duration::milliseconds(1500));
        assert_eq!(job.duration_ms(), Some(1500));
    }

    #[test]
    fn order_rollup() {
        use JobStatus::*;
        assert_eq!(OrderStatus::rollup(&[]), OrderStatus::Pending);
        assert_eq!(OrderStatus::rollup(&[Pending, Pending]), OrderStatus::Pending);
        assert_eq!(
            OrderStatus::rollup(&[Succeeded, Running]),
            OrderStatus::Processing
        );
        assert_eq!(
            OrderStatus::rollup(&[Succeeded, Succeeded]),
            OrderStatus::Completed
        );
        assert_eq!(OrderStatus::rollup(&[Succeeded, Failed]), OrderStatus::Failed);
        assert_eq!(
            OrderStatus::rollup(&[Succeeded, Cancelled]),
            OrderStatus::Cancelled
        );
    }
}
