// Timeout and retry wrapper shared by every remote call in the core

mod policy;

pub use policy::RetryPolicy;

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_retry::RetryIf;
use tracing::{debug, error, warn};

use crate::errors::{SyncError, SyncResult};
use crate::observability::SyncMetrics;

/// Races remote calls against a timer and retries transient failures.
///
/// Each `execute` call is independent; the executor holds no per-call state
/// and can be shared freely between tasks.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    default_policy: RetryPolicy,
    metrics: Arc<SyncMetrics>,
}

impl RequestExecutor {
    pub fn new(default_policy: RetryPolicy, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            default_policy,
            metrics,
        }
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Run `op` under `policy`.
    pub async fn execute<F, Fut, T, E>(&self, op: F, policy: &RetryPolicy) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<SyncError>,
    {
        self.execute_named("remote_call", op, policy).await
    }

    /// Run `op` under the executor's default policy
    pub async fn execute_default<F, Fut, T, E>(&self, operation: &str, op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<SyncError>,
    {
        let policy = self.default_policy.clone();
        self.execute_named(operation, op, &policy).await
    }

    /// Run `op` under `policy`, labelling log lines with `operation`.
    ///
    /// A timed-out attempt is dropped, not aborted remotely: whatever the
    /// remote side eventually does with it is never observed here.
    pub async fn execute_named<F, Fut, T, E>(
        &self,
        operation: &str,
        mut op: F,
        policy: &RetryPolicy,
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<SyncError>,
    {
        let attempts = AtomicU32::new(0);
        let timeout = policy.timeout;
        let metrics = &self.metrics;

        let action = || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            metrics.record_request();
            if attempt > 1 {
                metrics.record_retry();
            }
            let call = op();
            async move {
                debug!(operation, attempt, "Starting remote call");
                match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(err.into()),
                    Err(_) => {
                        metrics.record_timeout();
                        Err(SyncError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                }
            }
        };

        let condition = |err: &SyncError| {
            let retryable = err.is_retryable();
            if retryable {
                warn!(operation, error = %err, "Remote call failed (retryable)");
            } else {
                error!(operation, error = %err, "Remote call failed (non-retryable)");
            }
            retryable
        };

        match RetryIf::spawn(policy.delays(), action, condition).await {
            Ok(value) => {
                debug!(
                    operation,
                    attempts = attempts.load(Ordering::SeqCst),
                    "Remote call succeeded"
                );
                Ok(value)
            }
            Err(err) => {
                let attempts = attempts.load(Ordering::SeqCst);
                if attempts > 1 && err.is_retryable() {
                    metrics.record_exhausted();
                    error!(operation, attempts, error = %err, "Retries exhausted");
                    Err(SyncError::ExhaustedRetries {
                        attempts,
                        source: Box::new(err),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }
}
