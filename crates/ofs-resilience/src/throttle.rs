//! Request throttle
//!
//! - At most `max_concurrent` calls run at once
//! - Waiting calls are served express lane first, then best-effort in FIFO order
//! - The best-effort queue is bounded; the express lane is not
//! - The per-call timeout covers time spent waiting for a slot
//! - Identical in-flight keys share one execution ([`InflightDedup`])
//!
//! Slots are handed from a finishing call directly to the next waiter, so a
//! newly arriving call can never overtake a queued one.

use crate::error::ThrottleError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use ofs_model::{RemoteError, ThrottleConfig};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Lane a call waits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    /// Durable-queue dispatch; served before any best-effort call
    Express,
    /// Reads and background refreshes
    #[default]
    BestEffort,
}

#[derive(Debug, Default)]
struct Slots {
    running: usize,
    express: VecDeque<oneshot::Sender<ThrottlePermit>>,
    best_effort: VecDeque<oneshot::Sender<ThrottlePermit>>,
}

/// One running call. Dropping it frees the slot for the next waiter.
#[derive(Debug)]
pub struct ThrottlePermit {
    slots: Arc<Mutex<Slots>>,
    armed: bool,
}

impl ThrottlePermit {
    fn new(slots: Arc<Mutex<Slots>>) -> Self {
        Self { slots, armed: true }
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.slots.lock();
        loop {
            let next = slots
                .express
                .pop_front()
                .or_else(|| slots.best_effort.pop_front());
            let Some(waiter) = next else {
                slots.running = slots.running.saturating_sub(1);
                return;
            };
            // the slot moves to the waiter; `running` is unchanged
            match waiter.send(Self::new(Arc::clone(&self.slots))) {
                Ok(()) => return,
                // waiter gave up; the returned permit must not release again
                Err(mut unused) => unused.armed = false,
            }
        }
    }
}

#[derive(Debug)]
struct ThrottleInner {
    config: ThrottleConfig,
    slots: Arc<Mutex<Slots>>,
}

/// Bounded-concurrency gate for outbound calls
#[derive(Debug, Clone)]
pub struct RequestThrottle {
    inner: Arc<ThrottleInner>,
}

impl RequestThrottle {
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                config,
                slots: Arc::new(Mutex::new(Slots::default())),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ThrottleConfig {
        &self.inner.config
    }

    /// Calls currently holding a slot
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.slots.lock().running
    }

    /// Calls currently waiting (both lanes, including abandoned waiters not
    /// yet pruned)
    #[must_use]
    pub fn waiting(&self) -> usize {
        let slots = self.inner.slots.lock();
        slots.express.len() + slots.best_effort.len()
    }

    /// Wait for a slot
    ///
    /// # Errors
    /// [`ThrottleError::QueueFull`] when a best-effort call finds the
    /// waiting queue at its bound.
    pub async fn acquire(&self, priority: Priority) -> Result<ThrottlePermit, ThrottleError> {
        let rx = {
            let mut slots = self.inner.slots.lock();
            if slots.running < self.inner.config.max_concurrent.max(1) {
                slots.running += 1;
                return Ok(ThrottlePermit::new(Arc::clone(&self.inner.slots)));
            }

            let (tx, rx) = oneshot::channel();
            match priority {
                Priority::Express => slots.express.push_back(tx),
                Priority::BestEffort => {
                    slots.best_effort.retain(|w| !w.is_closed());
                    let waiting = slots.best_effort.len();
                    if waiting >= self.inner.config.max_queue_len {
                        warn!(waiting, "throttle queue full, rejecting best-effort call");
                        return Err(ThrottleError::QueueFull { waiting });
                    }
                    slots.best_effort.push_back(tx);
                }
            }
            rx
        };
        rx.await.map_err(|_| ThrottleError::Closed)
    }

    /// Run one call under the throttle with the configured timeout
    ///
    /// The timeout starts before the slot is acquired. On expiry the call is
    /// dropped and a transient timeout is returned.
    pub async fn run<T, Fut>(&self, priority: Priority, call: Fut) -> Result<T, RemoteError>
    where
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let budget = self.inner.config.call_timeout();
        let guarded = async {
            match self.acquire(priority).await {
                Ok(_permit) => call.await,
                Err(e) => Err(RemoteError::from(e)),
            }
        };
        match tokio::time::timeout(budget, guarded).await {
            Ok(result) => result,
            Err(_) => {
                let ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
                debug!(timeout_ms = ms, ?priority, "call timed out");
                metrics::counter!("ofs_throttle_timeouts_total").increment(1);
                Err(RemoteError::timeout(ms))
            }
        }
    }
}

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, RemoteError>>>;

/// Coalesces identical in-flight calls
///
/// The first caller for a key starts the call; later callers with the same
/// key await the same result. The key is released when the call finishes.
#[derive(Clone, Default)]
pub struct InflightDedup {
    inflight: Arc<DashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for InflightDedup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightDedup")
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

impl InflightDedup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys with a call in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Run `call` unless an identical one is already in flight
    pub async fn run<T, Fut>(&self, key: &str, call: Fut) -> Result<T, RemoteError>
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        // keys are namespaced by result type so a joined call always downcasts
        let map_key = format!("{}#{key}", std::any::type_name::<T>());
        let shared: SharedCall<T> = match self.inflight.entry(map_key.clone()) {
            Entry::Occupied(mut existing) => {
                if let Ok(joined) = Arc::clone(existing.get()).downcast::<SharedCall<T>>() {
                    debug!(key, "joining in-flight call");
                    (*joined).clone()
                } else {
                    let fut = self.lead(map_key, call);
                    existing.insert(Arc::new(fut.clone()));
                    fut
                }
            }
            Entry::Vacant(slot) => {
                let fut = self.lead(map_key, call);
                slot.insert(Arc::new(fut.clone()));
                fut
            }
        };
        shared.await
    }

    fn lead<T, Fut>(&self, map_key: String, call: Fut) -> SharedCall<T>
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        let map = Arc::clone(&self.inflight);
        async move {
            let result = call.await;
            map.remove(&map_key);
            result
        }
        .boxed()
        .shared()
    }
}
