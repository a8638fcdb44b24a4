use chrono::{DateTime, Duration, TimeZone, Utc};
use tally::{JobRecord, JobStatus, JobType, ReportWindow};

/// Fixed instant tests can build windows around.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// `[start, start + hours)`.
pub fn window_hours(start: DateTime<Utc>, hours: i64) -> ReportWindow {
    ReportWindow::new(start, start + Duration::hours(hours))
        .expect("fixture window must have positive length")
}

/// Builder for job records in a chosen state.
#[derive(Clone, Debug)]
pub struct JobFixture {
    order_id: String,
    provider_id: String,
    job_type: JobType,
    payload: serde_json::Value,
    max_attempts: u32,
    created_at: DateTime<Utc>,
}

impl Default for JobFixture {
    fn default() -> Self {
        Self {
            order_id: "order-1".to_string(),
            provider_id: "acme".to_string(),
            job_type: JobType::Processing,
            payload: serde_json::json!({"sku": "SKU-1", "qty": 1}),
            max_attempts: 3,
            created_at: epoch(),
        }
    }
}

impl JobFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = order_id.into();
        self
    }

    pub fn provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = job_type;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// A freshly submitted job.
    pub fn pending(&self) -> JobRecord {
        JobRecord::new(
            self.order_id.as_str().into(),
            self.provider_id.as_str().into(),
            self.job_type,
            self.payload.clone(),
            self.max_attempts,
            self.created_at,
        )
    }

    /// A job whose only attempt started at `created_at` and ended in `status`
    /// after `duration_ms`.
    pub fn finished(&self, status: JobStatus, duration_ms: i64) -> JobRecord {
        let mut job = self.pending();
        let finished_at = self.created_at + Duration::milliseconds(duration_ms);
        job.status = status;
        job.attempts = 1;
        job.version = 2;
        job.started_at = Some(self.created_at);
        job.finished_at = status.is_terminal().then_some(finished_at);
        job.updated_at = finished_at;
        match status {
            JobStatus::Succeeded => job.result = Some(serde_json::json!({"ok": true})),
            JobStatus::Failed => job.last_error = Some("provider rejected request".into()),
            _ => {}
        }
        job
    }

    pub fn succeeded(&self, duration_ms: i64) -> JobRecord {
        self.finished(JobStatus::Succeeded, duration_ms)
    }

    pub fn failed(&self, duration_ms: i64) -> JobRecord {
        self.finished(JobStatus::Failed, duration_ms)
    }

    /// A job that started at `started_at` and never reported back.
    pub fn running_since(&self, started_at: DateTime<Utc>) -> JobRecord {
        let mut job = self.pending();
        job.status = JobStatus::Running;
        job.attempts = 1;
        job.version = 1;
        job.started_at = Some(started_at);
        job.updated_at = started_at;
        job
    }
}
