//! Resilient remote client
//!
//! Every outbound call goes through the same path:
//! breaker admission, throttle slot (with timeout), the call itself, outcome
//! recorded on the breaker, and optional backoff retry while the breaker
//! allows it.

use crate::breaker::CircuitBreaker;
use crate::retry::RetryPolicy;
use crate::throttle::{InflightDedup, Priority, RequestThrottle};
use ofs_model::{BreakerConfig, RemoteApi, RemoteError, RetryConfig, ThrottleConfig};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Remote API wrapped in breaker, throttle, dedup and retry
#[derive(Clone)]
pub struct ResilientClient {
    remote: Arc<dyn RemoteApi>,
    breaker: Arc<CircuitBreaker>,
    throttle: RequestThrottle,
    dedup: InflightDedup,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("breaker", &self.breaker.status())
            .field("running", &self.throttle.running())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        breaker: BreakerConfig,
        throttle: ThrottleConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            remote,
            breaker: Arc::new(CircuitBreaker::new(breaker)),
            throttle: RequestThrottle::new(throttle),
            dedup: InflightDedup::new(),
            retry: RetryPolicy::new(retry),
        }
    }

    /// Replace the retry policy
    #[inline]
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn throttle(&self) -> &RequestThrottle {
        &self.throttle
    }

    #[must_use]
    pub fn remote(&self) -> &Arc<dyn RemoteApi> {
        &self.remote
    }

    /// One attempt: breaker admission, throttled call, outcome recorded
    fn attempt<T, Fut>(
        &self,
        priority: Priority,
        call: Fut,
    ) -> impl Future<Output = Result<T, RemoteError>> + Send + 'static
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        let breaker = Arc::clone(&self.breaker);
        let throttle = self.throttle.clone();
        async move {
            breaker.try_acquire()?;
            let result = throttle.run(priority, call).await;
            breaker.record(&result);
            result
        }
    }

    /// Single attempt without retry
    ///
    /// Used for durable-queue dispatch, where the queue itself owns retries.
    pub async fn call_once<T, F, Fut>(&self, priority: Priority, f: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn RemoteApi>) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        self.attempt(priority, f(Arc::clone(&self.remote))).await
    }

    /// Call with backoff retry on transient failures
    pub async fn call<T, F, Fut>(&self, label: &str, priority: Priority, f: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn RemoteApi>) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        let mut retries = 0;
        loop {
            let result = self.attempt(priority, f(Arc::clone(&self.remote))).await;
            match result {
                Err(e) if self.retry.should_retry(&e, retries) && self.breaker.allows_retry() => {
                    let delay = self.retry.delay_for(retries);
                    debug!(label, retries, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                other => return other,
            }
        }
    }

    /// Like [`call`](Self::call), but identical in-flight `key`s share one
    /// execution per attempt
    pub async fn call_dedup<T, F, Fut>(
        &self,
        key: &str,
        priority: Priority,
        f: F,
    ) -> Result<T, RemoteError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Arc<dyn RemoteApi>) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        let mut retries = 0;
        loop {
            let attempt = self.attempt(priority, f(Arc::clone(&self.remote)));
            match self.dedup.run(key, attempt).await {
                Err(e) if self.retry.should_retry(&e, retries) && self.breaker.allows_retry() => {
                    let delay = self.retry.delay_for(retries);
                    debug!(key, retries, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                other => return other,
            }
        }
    }
}
