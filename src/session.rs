//! Session cache with single-flight acquisition.
//!
//! The cache holds at most one [`Session`] (one logical identity per
//! process). Reads take a shared lock and clone an `Arc`. On a miss, every
//! concurrent caller joins the same acquisition, which runs on its own task
//! and so survives callers that stop waiting.
//!
//! # Acquisition
//!
//! 1. Lease an automation slot (pool timeouts are retried within a budget)
//! 2. Navigate to the entry page and run the challenge solver
//! 3. Capture the site's cookies plus the user agent that earned them
//! 4. Store in memory and in the durable mirror
//!
//! A solve failure is handed to every waiter and is not retried here.

use crate::cache::SingleFlight;
use crate::error::{AcquireError, PoolError};
use crate::mirror::SessionMirror;
use crate::models::{Cookie, Session};
use crate::pool::{Slot, SlotPool};
use crate::retry::Backoff;
use crate::solver::ChallengeSolver;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Knobs of the acquisition path.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Page loaded to trigger (and then pass) the challenge.
    pub entry_url: String,
    /// Only cookies for this domain (or its subdomains) are kept.
    pub cookie_domain: String,
    pub ttl: Duration,
    pub pool_timeout: Duration,
    pub navigation_timeout: Duration,
    /// Extra slot-lease attempts after a pool timeout.
    pub pool_retries: usize,
    pub backoff: Backoff,
}

struct Inner {
    current: RwLock<Option<Arc<Session>>>,
    flight: SingleFlight<(), Arc<Session>, AcquireError>,
    pool: SlotPool,
    solver: Arc<ChallengeSolver>,
    mirror: Option<SessionMirror>,
    policy: SessionPolicy,
    acquisitions: AtomicUsize,
}

/// Process-wide owner of the current session. Cheap to clone.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<Inner>,
}

fn domain_matches(cookie_domain: &str, site: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.');
    domain == site || domain.ends_with(&format!(".{site}"))
}

impl SessionCache {
    pub fn new(
        pool: SlotPool,
        solver: Arc<ChallengeSolver>,
        mirror: Option<SessionMirror>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                current: RwLock::new(None),
                flight: SingleFlight::new(),
                pool,
                solver,
                mirror,
                policy,
                acquisitions: AtomicUsize::new(0),
            }),
        }
    }

    /// Current session if it has not expired.
    pub fn peek(&self) -> Option<Arc<Session>> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|s| s.is_valid())
            .cloned()
    }

    /// A valid session, acquiring one if needed.
    pub async fn get_valid(&self) -> Result<Arc<Session>, AcquireError> {
        if let Some(session) = self.peek() {
            return Ok(session);
        }
        let this = self.clone();
        self.inner
            .flight
            .run((), move || async move { this.acquire().await })
            .await
    }

    /// [`get_valid`](Self::get_valid) bounded by a caller timeout. The
    /// acquisition itself keeps running when the caller gives up.
    pub async fn get_valid_within(&self, timeout: Duration) -> Result<Arc<Session>, AcquireError> {
        tokio::time::timeout(timeout, self.get_valid())
            .await
            .map_err(|_| AcquireError::Timeout(timeout))?
    }

    /// Drop the current session (memory and mirror).
    pub async fn invalidate(&self) {
        let dropped = self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if dropped.is_some() {
            info!("Session invalidated");
        }
        if let Some(mirror) = &self.inner.mirror {
            mirror.remove().await;
        }
    }

    /// Drop the current session only if it is still `rejected`. Returns
    /// `false` when another caller already replaced it.
    pub async fn invalidate_if_current(&self, rejected: &Arc<Session>) -> bool {
        let dropped = {
            let mut current = self
                .inner
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match current.as_ref() {
                Some(s) if Arc::ptr_eq(s, rejected) => current.take().is_some(),
                _ => false,
            }
        };
        if dropped {
            warn!("Session rejected upstream; invalidated");
            if let Some(mirror) = &self.inner.mirror {
                mirror.remove().await;
            }
        }
        dropped
    }

    /// Seed the cache from the durable mirror. Returns whether a session was
    /// restored.
    pub async fn restore_from_mirror(&self) -> bool {
        let Some(mirror) = &self.inner.mirror else {
            return false;
        };
        let Some(session) = mirror.load(self.inner.policy.ttl).await else {
            return false;
        };
        *self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(session));
        true
    }

    /// Completed acquisitions since start.
    pub fn acquisitions(&self) -> usize {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.inner.policy
    }

    #[instrument(level = "info", skip_all)]
    async fn acquire(&self) -> Result<Arc<Session>, AcquireError> {
        // A flight that finished just before this one started already
        // stored a session.
        if let Some(session) = self.peek() {
            return Ok(session);
        }

        let t0 = Instant::now();
        let slot = self.lease_slot().await?;
        let slot_id = slot.id();
        let outcome = self.solve_on(&slot).await;
        self.inner.pool.release(slot, outcome.is_ok()).await;

        let session = match outcome {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(
                    slot = slot_id,
                    elapsed_ms = t0.elapsed().as_millis() as u64,
                    error = %e,
                    "Session acquisition failed"
                );
                return Err(e);
            }
        };

        *self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
        let n = self.inner.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(mirror) = &self.inner.mirror {
            if let Err(e) = mirror.store(&session).await {
                warn!(error = %e, "Failed to mirror session; continuing with memory only");
            }
        }

        info!(
            slot = slot_id,
            acquisitions = n,
            cookies = session.cookies.len(),
            expires_at = %session.expires_at,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Session acquired"
        );
        Ok(session)
    }

    async fn lease_slot(&self) -> Result<Slot, AcquireError> {
        let policy = &self.inner.policy;
        let mut attempt = 0usize;
        loop {
            match self.inner.pool.acquire(policy.pool_timeout).await {
                Ok(slot) => return Ok(slot),
                Err(PoolError::Timeout(waited)) if attempt < policy.pool_retries => {
                    attempt += 1;
                    let delay = policy.backoff.delay_for(attempt);
                    warn!(
                        attempt,
                        max = policy.pool_retries,
                        waited_ms = waited.as_millis() as u64,
                        ?delay,
                        "Automation pool busy; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn solve_on(&self, slot: &Slot) -> Result<Session, AcquireError> {
        let policy = &self.inner.policy;
        let page = slot.page();

        page.goto(&policy.entry_url, policy.navigation_timeout)
            .await?;
        if let Some(proof) = self.inner.solver.clear(page).await? {
            info!(strategy = %proof.strategy, kind = ?proof.kind, "Challenge passed");
        }

        let cookies: Vec<Cookie> = page
            .cookies()
            .await?
            .into_iter()
            .filter(|c| domain_matches(&c.domain, &policy.cookie_domain))
            .collect();
        if cookies.is_empty() {
            warn!(domain = %policy.cookie_domain, "Challenge passed but no site cookies were set");
        }

        let mut headers = BTreeMap::new();
        if let Some(user_agent) = page.user_agent() {
            headers.insert("User-Agent".to_string(), user_agent);
        }

        Ok(Session::new(cookies, headers, Utc::now(), policy.ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CapabilityError, ErrorKind};
    use crate::models::ChallengeKind;
    use crate::testing::{CountingTokenSolver, FakeSite, session_cache};

    #[test]
    fn test_cookie_domain_filter() {
        assert!(domain_matches(".dergipark.org.tr", "dergipark.org.tr"));
        assert!(domain_matches("www.dergipark.org.tr", "dergipark.org.tr"));
        assert!(!domain_matches(".google.com", "dergipark.org.tr"));
        assert!(!domain_matches("notdergipark.org.tr", "dergipark.org.tr"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_cold_callers_share_one_solve() {
        let tokens = Arc::new(CountingTokenSolver::new("tok").with_delay(Duration::from_secs(4)));
        let (cache, _) = session_cache(FakeSite::gated(ChallengeKind::TokenChallenge), Some(tokens.clone()), None);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_valid().await }));
        }
        let sessions: Vec<Arc<Session>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(tokens.calls(), 1);
        assert_eq!(cache.acquisitions(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(sessions[0].cookies[0].name, "cf_clearance");
        // Cookies for other domains are dropped.
        assert!(sessions[0].cookies.iter().all(|c| c.domain.contains("dergipark")));
        assert_eq!(
            sessions[0].headers.get("User-Agent").map(String::as_str),
            Some("FakeAgent/1.0")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter_and_is_not_retried() {
        let tokens = Arc::new(
            CountingTokenSolver::failing(CapabilityError::Rejected("ERROR_CAPTCHA_UNSOLVABLE".into()))
                .with_delay(Duration::from_secs(1)),
        );
        let (cache, _) = session_cache(FakeSite::gated(ChallengeKind::TokenChallenge), Some(tokens.clone()), None);

        let (a, b) = tokio::join!(cache.get_valid(), cache.get_valid());
        assert_eq!(a.unwrap_err().kind(), ErrorKind::SolveFailed);
        assert_eq!(b.unwrap_err().kind(), ErrorKind::SolveFailed);
        assert_eq!(tokens.calls(), 1);
        assert!(cache.peek().is_none());

        // The next demand starts a fresh acquisition.
        let _ = cache.get_valid().await;
        assert_eq!(tokens.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_solver_is_capability_unavailable() {
        let (cache, _) = session_cache(FakeSite::gated(ChallengeKind::TokenChallenge), None, None);
        let err = cache.get_valid().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalCapabilityUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_rejection_does_not_drop_fresh_session() {
        let tokens = Arc::new(CountingTokenSolver::new("tok"));
        let (cache, _) = session_cache(FakeSite::gated(ChallengeKind::TokenChallenge), Some(tokens), None);

        let first = cache.get_valid().await.unwrap();
        assert!(cache.invalidate_if_current(&first).await);
        let second = cache.get_valid().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        assert!(!cache.invalidate_if_current(&first).await);
        assert!(Arc::ptr_eq(&cache.peek().unwrap(), &second));
        assert_eq!(cache.acquisitions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_timeout_leaves_acquisition_running() {
        let tokens = Arc::new(CountingTokenSolver::new("tok").with_delay(Duration::from_secs(30)));
        let (cache, _) = session_cache(FakeSite::gated(ChallengeKind::TokenChallenge), Some(tokens.clone()), None);

        let err = cache.get_valid_within(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AcquireError::Timeout(_)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(cache.peek().is_some());
        assert_eq!(tokens.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_timeout_is_retried_then_surfaces() {
        let tokens = Arc::new(CountingTokenSolver::new("tok"));
        let (cache, pool) = session_cache(FakeSite::gated(ChallengeKind::TokenChallenge), Some(tokens), None);
        let mut held = Vec::new();
        for _ in 0..pool.capacity() {
            held.push(pool.acquire(Duration::from_secs(1)).await.unwrap());
        }

        let err = cache.get_valid().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolTimeout);
    }

    #[tokio::test]
    async fn test_mirror_restores_without_solving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies_persistent.json");
        let tokens = Arc::new(CountingTokenSolver::new("tok"));

        let (cache, _) = session_cache(
            FakeSite::gated(ChallengeKind::TokenChallenge),
            Some(tokens.clone()),
            Some(path.clone()),
        );
        let original = cache.get_valid().await.unwrap();
        assert!(path.exists());

        let (restarted, _) = session_cache(
            FakeSite::gated(ChallengeKind::TokenChallenge),
            Some(tokens.clone()),
            Some(path.clone()),
        );
        assert!(restarted.restore_from_mirror().await);
        let restored = restarted.get_valid().await.unwrap();
        assert_eq!(*restored, *original);
        assert_eq!(tokens.calls(), 1);

        restarted.invalidate().await;
        assert!(!path.exists());
    }
}
