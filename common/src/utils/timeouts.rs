use std::{future::IntoFuture, time::Duration};

use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::warn;

use crate::{error::AppError, utils::config::AppConfig};

/// Classes of outbound calls, each carrying its own deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Metadata,
    Blob,
    IndexCreation,
    Ingestion,
    Generation,
    Dispatch,
}

impl CallClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallClass::Metadata => "metadata",
            CallClass::Blob => "blob",
            CallClass::IndexCreation => "index_creation",
            CallClass::Ingestion => "ingestion",
            CallClass::Generation => "generation",
            CallClass::Dispatch => "dispatch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub metadata: Duration,
    pub blob: Duration,
    pub index_creation: Duration,
    pub ingestion: Duration,
    pub generation: Duration,
    pub dispatch: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(30),
            blob: Duration::from_secs(120),
            index_creation: Duration::from_secs(300),
            ingestion: Duration::from_secs(60),
            generation: Duration::from_secs(300),
            dispatch: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            metadata: Duration::from_secs(cfg.metadata_timeout_secs),
            blob: Duration::from_secs(cfg.blob_timeout_secs),
            index_creation: Duration::from_secs(cfg.index_creation_timeout_secs),
            ingestion: Duration::from_secs(cfg.ingestion_timeout_secs),
            generation: Duration::from_secs(cfg.generation_timeout_secs),
            dispatch: Duration::from_secs(cfg.dispatch_timeout_secs),
        }
    }

    pub fn for_class(&self, class: CallClass) -> Duration {
        match class {
            CallClass::Metadata => self.metadata,
            CallClass::Blob => self.blob,
            CallClass::IndexCreation => self.index_creation,
            CallClass::Ingestion => self.ingestion,
            CallClass::Generation => self.generation,
            CallClass::Dispatch => self.dispatch,
        }
    }

    pub async fn run<F, T, E>(
        &self,
        class: CallClass,
        operation: &str,
        call: F,
    ) -> Result<T, AppError>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        bounded(self.for_class(class), class, operation, call).await
    }
}

/// Runs `call` under `limit`. Expiry surfaces as [`AppError::Timeout`] and is
/// never retried here.
pub async fn bounded<F, T, E>(
    limit: Duration,
    class: CallClass,
    operation: &str,
    call: F,
) -> Result<T, AppError>
where
    F: IntoFuture<Output = Result<T, E>>,
    E: Into<AppError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            warn!(
                operation,
                call_class = class.as_str(),
                timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                "outbound call timed out"
            );
            Err(AppError::Timeout {
                operation: operation.to_string(),
                after: limit,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_attempts: cfg.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
        }
    }

    /// Delays to wait between attempts: base, 2x base, 4x base, ... with jitter.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = u64::try_from(self.base_delay.as_millis() / 2)
            .unwrap_or(u64::MAX)
            .max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// Repeats `action` while it fails with a retryable error, up to the policy's
/// attempt budget.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut action: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    RetryIf::spawn(policy.delays(), &mut action, |err: &AppError| {
        let retry = err.is_retryable();
        if retry {
            warn!(operation, error = %err, "transient failure; retrying");
        }
        retry
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn bounded_call_reports_timeout() {
        let result: Result<(), AppError> = bounded(
            Duration::from_millis(10),
            CallClass::IndexCreation,
            "create_vector_index",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), AppError>(())
            },
        )
        .await;

        match result {
            Err(AppError::Timeout { operation, after }) => {
                assert_eq!(operation, "create_vector_index");
                assert_eq!(after, Duration::from_millis(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bounded_call_passes_through_result() {
        let timeouts = TimeoutConfig::default();
        let value = timeouts
            .run(CallClass::Metadata, "lookup", async { Ok::<_, AppError>(7) })
            .await
            .expect("value");
        assert_eq!(value, 7);
    }

    #[test]
    fn delays_respect_attempt_budget() {
        assert_eq!(fast_policy(3).delays().count(), 2);
        assert_eq!(fast_policy(1).delays().count(), 0);
        assert!(fast_policy(4)
            .delays()
            .all(|delay| delay <= Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(&fast_policy(3), "flaky", || {
            let counter = Arc::clone(&counter);
            async move {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                if seen < 2 {
                    Err(AppError::ProviderTransient("throttled".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.expect("eventual success"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), AppError> = with_retry(&fast_policy(5), "rejected", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Provider("bad request".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::Provider(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_stop_when_budget_is_spent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), AppError> = with_retry(&fast_policy(2), "down", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AppError::ProviderTransient("503".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::ProviderTransient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
