//! Bounded pool of automation contexts.
//!
//! Capacity is enforced by a semaphore; a [`Slot`] owns its permit, so a
//! slot that is dropped without [`SlotPool::release`] still frees capacity
//! (its context is discarded). Idle contexts are kept on a free list and
//! reused; unhealthy ones are closed and replaced lazily on a later
//! `acquire`.

use crate::automation::{AutomationBackend, PageContext};
use crate::error::PoolError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

/// Upper bound on closing one context. A context that does not close in
/// time is dropped instead.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

async fn teardown(context: Box<dyn PageContext>, id: usize) {
    if tokio::time::timeout(TEARDOWN_TIMEOUT, context.close()).await.is_err() {
        warn!(slot = id, timeout = ?TEARDOWN_TIMEOUT, "Automation slot did not close in time; dropped");
    }
}

/// A leased automation context. Borrowed by exactly one caller at a time.
pub struct Slot {
    context: Box<dyn PageContext>,
    _permit: OwnedSemaphorePermit,
    /// Launch sequence number, for logs.
    id: usize,
}

impl Slot {
    pub fn page(&self) -> &dyn PageContext {
        self.context.as_ref()
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

struct Idle {
    context: Box<dyn PageContext>,
    id: usize,
}

struct PoolInner {
    backend: Arc<dyn AutomationBackend>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Idle>>,
    capacity: usize,
    launch_timeout: Duration,
    launched: AtomicUsize,
}

/// Fixed-capacity pool handing out [`Slot`]s.
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

impl SlotPool {
    pub fn new(backend: Arc<dyn AutomationBackend>, capacity: usize, launch_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                backend,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::new()),
                capacity,
                launch_timeout,
                launched: AtomicUsize::new(0),
            }),
        }
    }

    /// Lease a slot, waiting at most `timeout` for one to become free.
    ///
    /// `PoolError::Timeout` is retryable. A context is launched only when
    /// the free list is empty.
    #[instrument(level = "info", skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn acquire(&self, timeout: Duration) -> Result<Slot, PoolError> {
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                warn!(capacity = self.inner.capacity, "No automation slot became free in time");
                return Err(PoolError::Timeout(timeout));
            }
        };

        let reused = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        if let Some(Idle { context, id }) = reused {
            debug!(slot = id, "Reusing idle automation slot");
            return Ok(Slot {
                context,
                _permit: permit,
                id,
            });
        }

        let launch_timeout = self.inner.launch_timeout;
        let context = match tokio::time::timeout(launch_timeout, self.inner.backend.launch()).await {
            Ok(Ok(context)) => context,
            Ok(Err(e)) => return Err(PoolError::Launch(e.to_string())),
            Err(_) => {
                return Err(PoolError::Launch(format!(
                    "launch did not finish within {launch_timeout:?}"
                )));
            }
        };
        let id = self.inner.launched.fetch_add(1, Ordering::SeqCst) + 1;
        info!(slot = id, "Launched automation slot");
        Ok(Slot {
            context,
            _permit: permit,
            id,
        })
    }

    /// Return a slot. Healthy contexts go back on the free list before the
    /// permit is released; unhealthy ones are torn down.
    pub async fn release(&self, slot: Slot, healthy: bool) {
        let Slot {
            context,
            _permit: permit,
            id,
        } = slot;
        if healthy && !self.inner.permits.is_closed() {
            self.inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Idle { context, id });
            drop(permit);
            debug!(slot = id, "Returned automation slot to the pool");
        } else {
            drop(permit);
            warn!(slot = id, healthy, "Tearing down automation slot");
            teardown(context, id).await;
        }
    }

    /// Close the pool: pending and future `acquire`s fail with
    /// `PoolError::Closed`, idle contexts are closed.
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        let idle: Vec<Idle> = std::mem::take(
            &mut *self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = idle.len();
        for Idle { context, id } in idle {
            teardown(context, id).await;
        }
        info!(closed = count, launched = self.launched(), "Automation slot pool shut down");
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots not currently leased.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Contexts waiting on the free list.
    pub fn idle(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Contexts launched over the pool's lifetime.
    pub fn launched(&self) -> usize {
        self.inner.launched.load(Ordering::SeqCst)
    }
}
