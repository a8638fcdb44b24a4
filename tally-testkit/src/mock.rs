use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tally::{JobId, JobRecord, ProviderClient, ProviderError};

/// A provider whose replies are scripted ahead of time.
///
/// Scripted replies are consumed in order; once the script runs out every
/// call gets the fallback reply (success by default).
#[derive(Clone)]
pub struct MockProvider {
    calls: Arc<Mutex<Vec<CallRecord>>>,
    script: Arc<Mutex<VecDeque<Result<serde_json::Value, ProviderError>>>>,
    fallback: Arc<Mutex<Result<serde_json::Value, ProviderError>>>,
}

#[derive(Clone, Debug)]
pub struct CallRecord {
    pub job_id: JobId,
    pub provider_id: String,
    pub attempt: u32,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(Ok(serde_json::json!({"ok": true})))),
        }
    }

    /// Every call fails permanently with `message`.
    pub fn always_permanent(message: &str) -> Self {
        let provider = Self::new();
        provider.set_fallback(Err(ProviderError::permanent(message)));
        provider
    }

    /// Fail retryably `failures` times, then succeed.
    pub fn flaky(failures: usize) -> Self {
        let provider = Self::new();
        for n in 0..failures {
            provider.push(Err(ProviderError::retryable(format!(
                "upstream unavailable ({})",
                n + 1
            ))));
        }
        provider
    }

    pub fn push(&self, reply: Result<serde_json::Value, ProviderError>) {
        self.script.lock().push_back(reply);
    }

    pub fn set_fallback(&self, reply: Result<serde_json::Value, ProviderError>) {
        *self.fallback.lock() = reply;
    }

    pub fn record(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.calls.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} provider calls, got {}",
            expected, actual
        );
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn call(&self, job: &JobRecord) -> Result<serde_json::Value, ProviderError> {
        self.calls.lock().push(CallRecord {
            job_id: job.id,
            provider_id: job.provider_id.as_str().to_string(),
            attempt: job.attempts,
        });
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

/// A provider that takes `delay` to answer every call successfully.
#[derive(Clone, Debug)]
pub struct SlowProvider {
    delay: Duration,
    calls: Arc<Mutex<usize>>,
}

impl SlowProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl ProviderClient for SlowProvider {
    async fn call(&self, _job: &JobRecord) -> Result<serde_json::Value, ProviderError> {
        *self.calls.lock() += 1;
        tokio::time::sleep(self.delay).await;
        Ok(serde_json::json!({"ok": true, "slow": true}))
    }
}
