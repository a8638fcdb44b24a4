use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::job::JobRecord;
use crate::telemetry;

/// Client for the external service a job is executed against.
///
/// Calls may be slow and may fail. Implementations classify failures as
/// [`ProviderError::Retryable`] or [`ProviderError::Permanent`].
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn call(&self, job: &JobRecord) -> Result<serde_json::Value, ProviderError>;
}

#[async_trait]
impl<P: ProviderClient + ?Sized> ProviderClient for Arc<P> {
    async fn call(&self, job: &JobRecord) -> Result<serde_json::Value, ProviderError> {
        (**self).call(job).await
    }
}

/// Call `provider` with an upper bound on how long it may take.
///
/// Running past `limit` is reported as a retryable failure; the call itself is
/// dropped.
pub async fn call_with_timeout<P: ProviderClient + ?Sized>(
    provider: &P,
    job: &JobRecord,
    limit: Duration,
) -> Result<serde_json::Value, ProviderError> {
    let timing = telemetry::record_call_start(job.id.to_string());
    let result = match tokio::time::timeout(limit, provider.call(job)).await {
        Ok(result) => result,
        Err(_) => {
            telemetry::record_call_end(timing, job.provider_id.as_str(), "timeout");
            return Err(ProviderError::Retryable(format!(
                "provider call timed out after {}ms",
                limit.as_millis()
            )));
        }
    };

    let outcome = match &result {
        Ok(_) => "success",
        Err(ProviderError::Retryable(_)) => "retryable",
        Err(ProviderError::Permanent(_)) => "permanent",
    };
    telemetry::record_call_end(timing, job.provider_id.as_str(), outcome);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use chrono::Utc;

    struct Sleepy(Duration);

    #[async_trait]
    impl ProviderClient for Sleepy {
        async fn call(
            &self,
            _job: &JobRecord,
        ) -> Result<serde_json::Value, ProviderError> {
            tokio::time::sleep(self.0).await;
            Ok(serde_json::json!({"ok": true}))
        }
    }

    fn job() -> JobRecord {
        JobRecord::new(
            "order-1".into(),
            "acme".into(),
            JobType::Processing,
            serde_json::Value::Null,
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn timeout_is_retryable() {
        let err = call_with_timeout(
            &Sleepy(Duration::from_secs(5)),
            &job(),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let value = call_with_timeout(
            &Arc::new(Sleepy(Duration::ZERO)),
            &job(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(value["ok"], true);
    }
}
