//! Concurrent fetch orchestrator.
//!
//! [`Orchestrator::fetch_all`] runs a batch of [`Target`]s against the
//! current session with bounded parallelism and randomized pacing between
//! dispatches. Results come back in input order.
//!
//! # Failure policy
//!
//! - A task failure is recorded in its slot and never aborts the batch.
//! - The first task rejected *by the current session* triggers one
//!   invalidate-and-reacquire cycle; tasks not yet dispatched then run on the
//!   fresh session. The rejected task itself is not retried.
//! - A task rejected while carrying an already-replaced session is requeued
//!   once, since the rejection says nothing about the fresh session.
//! - If the fresh session is rejected too, or re-acquisition fails, the
//!   remaining undispatched tasks are failed without touching upstream.

use crate::error::{AcquireError, TaskFailure};
use crate::models::{FetchResult, FetchTask, Session, Target, TaskKind};
use crate::session::SessionCache;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rand::{Rng, rng};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Performs one fetch with a session attached.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, task: &FetchTask) -> FetchResult;
}

/// Uniform random delay window applied between dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Pacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        Duration::from_millis(rng().random_range(lo..=hi))
    }
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub parallelism: usize,
    pub detail_pacing: Pacing,
    pub listing_pacing: Pacing,
    /// Bound on a single fetch.
    pub task_timeout: Duration,
}

impl FetchPolicy {
    fn pacing(&self, kind: TaskKind) -> Pacing {
        match kind {
            TaskKind::Listing => self.listing_pacing,
            TaskKind::Detail => self.detail_pacing,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    sessions: SessionCache,
    source: Arc<dyn PageSource>,
    policy: FetchPolicy,
}

impl Orchestrator {
    pub fn new(sessions: SessionCache, source: Arc<dyn PageSource>, policy: FetchPolicy) -> Self {
        Self {
            sessions,
            source,
            policy: FetchPolicy {
                parallelism: policy.parallelism.max(1),
                ..policy
            },
        }
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    /// Fetch one target; shorthand for a batch of one.
    pub async fn fetch_one(&self, target: Target) -> Result<FetchResult, AcquireError> {
        let mut results = self.fetch_all(vec![target]).await?;
        Ok(results
            .pop()
            .unwrap_or_else(|| Err(TaskFailure::SessionUnavailable("empty batch".to_string()))))
    }

    /// Run `targets` and return one result per target, in input order.
    ///
    /// Fails as a whole only when no session can be obtained up front.
    #[instrument(level = "info", skip_all, fields(tasks = targets.len()))]
    pub async fn fetch_all(&self, targets: Vec<Target>) -> Result<Vec<FetchResult>, AcquireError> {
        let total = targets.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let t0 = Instant::now();
        let mut session = self.sessions.get_valid().await?;

        let mut results: Vec<Option<FetchResult>> = vec![None; total];
        let mut queue: VecDeque<usize> = (0..total).collect();
        let mut requeued: HashSet<usize> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();
        let mut dispatched = 0usize;
        let mut reacquired = false;
        let mut halted: Option<TaskFailure> = None;

        loop {
            while halted.is_none() && in_flight.len() < self.policy.parallelism {
                let Some(idx) = queue.pop_front() else {
                    break;
                };
                let target = targets[idx].clone();
                if dispatched > 0 {
                    let delay = self.policy.pacing(target.kind).sample();
                    if !delay.is_zero() {
                        debug!(delay_ms = delay.as_millis() as u64, "Pacing before dispatch");
                        tokio::time::sleep(delay).await;
                    }
                }
                dispatched += 1;
                in_flight.push(self.dispatch(idx, target, Arc::clone(&session)));
            }

            let Some((idx, used, outcome)) = in_flight.next().await else {
                break;
            };

            match outcome {
                Err(TaskFailure::SessionRejected) if Arc::ptr_eq(&used, &session) => {
                    results[idx] = Some(Err(TaskFailure::SessionRejected));
                    if reacquired {
                        warn!(task = idx, "Fresh session rejected as well; halting batch");
                        self.sessions.invalidate_if_current(&session).await;
                        halted = Some(TaskFailure::SessionRejected);
                        continue;
                    }
                    reacquired = true;
                    warn!(task = idx, remaining = queue.len(), "Session rejected; re-acquiring");
                    self.sessions.invalidate_if_current(&session).await;
                    match self.sessions.get_valid().await {
                        Ok(fresh) => session = fresh,
                        Err(e) => {
                            warn!(error = %e, "Re-acquisition failed; halting batch");
                            halted = Some(TaskFailure::SessionUnavailable(e.to_string()));
                        }
                    }
                }
                Err(TaskFailure::SessionRejected) if requeued.insert(idx) => {
                    debug!(task = idx, "Rejected on a replaced session; requeueing");
                    queue.push_front(idx);
                }
                other => results[idx] = Some(other),
            }
        }

        if let Some(failure) = &halted {
            for idx in queue.drain(..) {
                results[idx] = Some(Err(failure.clone()));
            }
        }

        let results: Vec<FetchResult> = results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(TaskFailure::SessionUnavailable("task never dispatched".to_string())))
            })
            .collect();
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            tasks = total,
            failed,
            reacquired,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Fetch batch finished"
        );
        Ok(results)
    }

    /// Spawn one task. The fetch keeps running even if the batch future is
    /// dropped.
    fn dispatch(
        &self,
        idx: usize,
        target: Target,
        session: Arc<Session>,
    ) -> impl std::future::Future<Output = (usize, Arc<Session>, FetchResult)> + use<> {
        let source = Arc::clone(&self.source);
        let limit = self.policy.task_timeout;
        let task = FetchTask {
            target,
            session: Arc::clone(&session),
        };
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(limit, source.fetch(&task)).await {
                Ok(result) => result,
                Err(_) => Err(TaskFailure::Timeout(limit)),
            }
        });
        async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(TaskFailure::Transport(format!("fetch task aborted: {e}"))),
            };
            if let Err(e) = &outcome {
                debug!(task = idx, error = %e, "Fetch task failed");
            }
            (idx, session, outcome)
        }
    }
}
