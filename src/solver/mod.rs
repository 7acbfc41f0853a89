//! Challenge detection and the solving strategy chain.
//!
//! A [`ChallengeSolver`] holds an ordered list of [`SolvingStrategy`]
//! implementations. [`ChallengeSolver::solve`] tries them in order, each
//! bounded by its own timeout, and stops at the first one that leaves the
//! page clear of the challenge. There is no retry loop here: the session
//! acquisition path decides whether to run the whole chain again.
//!
//! # Strategies
//!
//! | Strategy | Module | Needs |
//! |----------|--------|-------|
//! | `interactive` | [`interactive`] | an [`interactive::InteractiveSolver`] |
//! | `token` | [`token`] | a [`token::TokenSolver`] (e.g. [`capsolver::CapSolverClient`]) |
//!
//! Strategies that are not configured report `NotConfigured`. When *every*
//! strategy says so, the failure is [`SolveError::Unavailable`] rather than
//! [`SolveError::Exhausted`], so operators can tell a missing dependency
//! from an upstream defense change.

pub mod capsolver;
pub mod interactive;
pub mod token;

use crate::automation::PageContext;
use crate::error::{SolveError, StrategyError};
use crate::models::{ChallengeDescriptor, ChallengeKind, ProofToken};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

static SITE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-sitekey=["']([^"']+)["']"#).expect("static regex"));

/// Form marker rendered by the site's verification page.
const VERIFICATION_FORM: &str = "name=\"search_verification\"";

/// One way of beating a challenge.
#[async_trait]
pub trait SolvingStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Upper bound for a single [`attempt`](Self::attempt).
    fn timeout(&self) -> Duration;

    /// Try once. Returning `Ok` means the strategy did its part; the solver
    /// still re-checks the page before accepting the proof.
    async fn attempt(
        &self,
        page: &dyn PageContext,
        challenge: &ChallengeDescriptor,
    ) -> Result<ProofToken, StrategyError>;
}

/// Script run after a successful solve to expose the wanted content.
#[derive(Debug, Clone)]
pub struct PostSolveAction {
    /// Skip the action when the URL already contains this.
    pub url_marker: String,
    pub script: String,
    /// Wait after running the script.
    pub settle: Duration,
}

/// Inspect a loaded page for a challenge.
///
/// A page is gated when its URL carries `marker` or it renders the
/// verification form. The widget family decides the challenge kind.
pub fn detect(url: &str, html: &str, marker: &str) -> Option<ChallengeDescriptor> {
    let gated = url.contains(marker) || html.contains(VERIFICATION_FORM);
    if !gated {
        return None;
    }
    let kind = if html.contains("cf-turnstile") || html.contains("challenges.cloudflare.com") {
        ChallengeKind::TokenChallenge
    } else {
        ChallengeKind::InteractiveChallenge
    };
    let site_key = SITE_KEY
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    Some(ChallengeDescriptor {
        kind,
        site_key,
        page_url: url.to_string(),
    })
}

/// Script clicking the first element matching `selector`; yields `true` when
/// something was clicked.
pub fn submit_script(selector: &str) -> String {
    let selector = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(() => {{ const el = document.querySelector({selector}); \
         if (!el) return false; el.click(); return true; }})()"
    )
}

/// Script writing `token` into the hidden response field of `kind`; yields
/// `true` when the field exists.
pub fn inject_token_script(kind: ChallengeKind, token: &str) -> String {
    let field = kind.response_field();
    let selector = serde_json::to_string(&format!("[name=\"{field}\"], #{field}"))
        .unwrap_or_else(|_| "\"\"".to_string());
    let token = serde_json::to_string(token).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(() => {{ const fields = document.querySelectorAll({selector}); \
         if (fields.length === 0) return false; \
         fields.forEach(f => {{ f.value = {token}; }}); return true; }})()"
    )
}

/// Drives the strategy chain against one page.
pub struct ChallengeSolver {
    strategies: Vec<Arc<dyn SolvingStrategy>>,
    post_solve: Option<PostSolveAction>,
    marker: String,
}

impl ChallengeSolver {
    /// `marker` is the URL fragment identifying the challenge page.
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            strategies: Vec::new(),
            post_solve: None,
            marker: marker.into(),
        }
    }

    /// Append a strategy; strategies run in insertion order.
    pub fn with_strategy(mut self, strategy: Arc<dyn SolvingStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn with_post_solve(mut self, action: PostSolveAction) -> Self {
        self.post_solve = Some(action);
        self
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Detect a challenge on the page as it is now.
    pub async fn inspect(
        &self,
        page: &dyn PageContext,
    ) -> Result<Option<ChallengeDescriptor>, SolveError> {
        let url = page.current_url().await?;
        let html = page.content().await?;
        Ok(detect(&url, &html, &self.marker))
    }

    /// Re-run detection after a strategy reported success. A page that
    /// cannot be read counts against the strategy, not the chain.
    async fn verify_cleared(&self, page: &dyn PageContext) -> Result<(), StrategyError> {
        match self.inspect(page).await {
            Ok(None) => Ok(()),
            Ok(Some(_)) => Err(StrategyError::StillChallenged),
            Err(e) => Err(StrategyError::Failed(format!("re-check failed: {e}"))),
        }
    }

    /// Detect and, when gated, solve. `Ok(None)` means there was nothing to
    /// solve. The post-solve action runs in both cases.
    pub async fn clear(&self, page: &dyn PageContext) -> Result<Option<ProofToken>, SolveError> {
        match self.inspect(page).await? {
            Some(challenge) => self.solve(page, &challenge).await.map(Some),
            None => {
                info!("No challenge on page");
                self.run_post_solve(page).await;
                Ok(None)
            }
        }
    }

    /// Run the strategy chain against `challenge`.
    #[instrument(level = "info", skip_all, fields(kind = ?challenge.kind, url = %challenge.page_url))]
    pub async fn solve(
        &self,
        page: &dyn PageContext,
        challenge: &ChallengeDescriptor,
    ) -> Result<ProofToken, SolveError> {
        let mut attempts = Vec::with_capacity(self.strategies.len());
        let mut not_configured = 0usize;

        for strategy in &self.strategies {
            let name = strategy.name();
            let limit = strategy.timeout();
            let t0 = std::time::Instant::now();
            let outcome = match tokio::time::timeout(limit, strategy.attempt(page, challenge)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(StrategyError::Timeout(limit)),
            };

            let failure = match outcome {
                Ok(proof) => match self.verify_cleared(page).await {
                    Ok(()) => {
                        info!(
                            strategy = name,
                            elapsed_ms = t0.elapsed().as_millis() as u64,
                            "Challenge solved"
                        );
                        self.run_post_solve(page).await;
                        return Ok(proof);
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if matches!(failure, StrategyError::NotConfigured(_)) {
                not_configured += 1;
                info!(strategy = name, "Strategy not configured; skipping");
            } else {
                warn!(
                    strategy = name,
                    elapsed_ms = t0.elapsed().as_millis() as u64,
                    error = %failure,
                    "Strategy failed; falling back"
                );
            }
            attempts.push(format!("{name}: {failure}"));
        }

        if not_configured == self.strategies.len() {
            let reason = if attempts.is_empty() {
                "no solving strategy configured".to_string()
            } else {
                attempts.join("; ")
            };
            return Err(SolveError::Unavailable(reason));
        }
        Err(SolveError::Exhausted { attempts })
    }

    async fn run_post_solve(&self, page: &dyn PageContext) {
        let Some(action) = &self.post_solve else {
            return;
        };
        let url = match page.current_url().await {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Could not read URL before post-solve action");
                return;
            }
        };
        if url.contains(&action.url_marker) {
            return;
        }
        match page.evaluate(&action.script).await {
            Ok(serde_json::Value::Bool(true)) => {
                info!(%url, "Post-solve action applied");
                tokio::time::sleep(action.settle).await;
            }
            Ok(_) => warn!(%url, "Post-solve target not found on page"),
            Err(e) => warn!(%url, error = %e, "Post-solve action failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AutomationError;
    use crate::models::Cookie;
    use crate::testing::{FakePage, FakeSite, TURNSTILE_PAGE};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Page that stays on its URL and renders the verification form until a
    /// click clears it.
    struct FormPage {
        url: String,
        html: Mutex<String>,
        unreadable_once: AtomicBool,
    }

    impl FormPage {
        fn new() -> Self {
            Self {
                url: "https://dergipark.org.tr/tr/search?q=x&section=article".to_string(),
                html: Mutex::new(TURNSTILE_PAGE.to_string()),
                unreadable_once: AtomicBool::new(false),
            }
        }

        fn unreadable_once(self) -> Self {
            self.unreadable_once.store(true, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl PageContext for FormPage {
        async fn goto(&self, _url: &str, _timeout: Duration) -> Result<(), AutomationError> {
            Ok(())
        }

        async fn current_url(&self) -> Result<String, AutomationError> {
            Ok(self.url.clone())
        }

        async fn content(&self) -> Result<String, AutomationError> {
            if self.unreadable_once.swap(false, Ordering::SeqCst) {
                return Err(AutomationError::Script("target closed".into()));
            }
            Ok(self.html.lock().unwrap().clone())
        }

        async fn evaluate(&self, script: &str) -> Result<serde_json::Value, AutomationError> {
            if script.contains("click()") {
                *self.html.lock().unwrap() = "<html><body>Arama</body></html>".to_string();
            }
            Ok(serde_json::Value::Bool(true))
        }

        async fn cookies(&self) -> Result<Vec<Cookie>, AutomationError> {
            Ok(Vec::new())
        }

        fn user_agent(&self) -> Option<String> {
            None
        }

        async fn close(self: Box<Self>) {}
    }

    struct Scripted {
        name: &'static str,
        outcome: Result<(), StrategyError>,
        delay: Duration,
        clears: bool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, outcome: Result<(), StrategyError>, clears: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                delay: Duration::ZERO,
                clears,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SolvingStrategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn attempt(
            &self,
            page: &dyn PageContext,
            challenge: &ChallengeDescriptor,
        ) -> Result<ProofToken, StrategyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()?;
            if self.clears {
                page.evaluate(&submit_script("button[type=\"submit\"]")).await?;
            }
            Ok(ProofToken {
                kind: challenge.kind,
                strategy: self.name.to_string(),
                token: None,
            })
        }
    }

    fn challenge() -> ChallengeDescriptor {
        detect(
            "https://dergipark.org.tr/tr/search/verification?q=x",
            TURNSTILE_PAGE,
            "verification",
        )
        .unwrap()
    }

    async fn gated_page() -> FakePage {
        let page = FakePage::new(FakeSite::gated(ChallengeKind::TokenChallenge).auto_pass());
        page.goto("https://dergipark.org.tr/tr/search?q=x&section=article", Duration::from_secs(1))
            .await
            .unwrap();
        page
    }

    #[test]
    fn test_detect_token_challenge_with_site_key() {
        let found = challenge();
        assert_eq!(found.kind, ChallengeKind::TokenChallenge);
        assert_eq!(found.site_key.as_deref(), Some("0x4AAAAAAADnPIDROrmt1Wwj"));
    }

    #[test]
    fn test_detect_interactive_challenge() {
        let html = r#"<form name="search_verification"><div class="g-recaptcha" data-sitekey='6LcXYZ'></div></form>"#;
        let found = detect("https://dergipark.org.tr/tr/search?q=x", html, "verification").unwrap();
        assert_eq!(found.kind, ChallengeKind::InteractiveChallenge);
        assert_eq!(found.site_key.as_deref(), Some("6LcXYZ"));
    }

    #[test]
    fn test_plain_page_is_not_gated() {
        assert!(detect("https://dergipark.org.tr/tr/search?q=x", "<html></html>", "verification").is_none());
    }

    #[test]
    fn test_scripts_escape_arguments() {
        let script = inject_token_script(ChallengeKind::TokenChallenge, "a\"b");
        assert!(script.contains(r#"a\"b"#));
        assert!(script.contains("cf-turnstile-response"));
        let script = submit_script(r#"form[name="search_verification"] button"#);
        assert!(script.contains(r#"form[name=\"search_verification\"] button"#));
        assert!(script.contains("click()"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_after_first_strategy_fails() {
        let page = gated_page().await;
        let first = Scripted::new("interactive", Err(StrategyError::Failed("no luck".into())), false);
        let second = Scripted::new("token", Ok(()), true);
        let solver = ChallengeSolver::new("verification")
            .with_strategy(first.clone())
            .with_strategy(second.clone());

        let proof = solver.solve(&page, &challenge()).await.unwrap();
        assert_eq!(proof.strategy, "token");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_strategy_is_cut_off_by_its_timeout() {
        let page = gated_page().await;
        let slow = Arc::new(Scripted {
            name: "interactive",
            outcome: Ok(()),
            delay: Duration::from_secs(30),
            clears: true,
            calls: AtomicUsize::new(0),
        });
        let token = Scripted::new("token", Ok(()), true);
        let solver = ChallengeSolver::new("verification")
            .with_strategy(slow)
            .with_strategy(token);

        let proof = solver.solve(&page, &challenge()).await.unwrap();
        assert_eq!(proof.strategy, "token");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ok_without_clearing_page_counts_as_failure() {
        let page = gated_page().await;
        let liar = Scripted::new("token", Ok(()), false);
        let solver = ChallengeSolver::new("verification").with_strategy(liar);

        match solver.solve(&page, &challenge()).await {
            Err(SolveError::Exhausted { attempts }) => {
                assert_eq!(attempts.len(), 1);
                assert!(attempts[0].contains("still shows the challenge"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_form_still_rendered_after_ok_is_not_solved() {
        let page = FormPage::new();
        let liar = Scripted::new("interactive", Ok(()), false);
        let token = Scripted::new("token", Ok(()), true);
        let solver = ChallengeSolver::new("verification")
            .with_strategy(liar.clone())
            .with_strategy(token.clone());
        assert_eq!(solver.strategy_names(), ["interactive", "token"]);
        let found = solver.inspect(&page).await.unwrap().unwrap();
        assert_eq!(found.kind, ChallengeKind::TokenChallenge);

        let proof = solver.clear(&page).await.unwrap().unwrap();
        assert_eq!(proof.strategy, "token");
        assert_eq!(liar.calls.load(Ordering::SeqCst), 1);
        assert_eq!(token.calls.load(Ordering::SeqCst), 1);
        assert!(solver.inspect(&page).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_form_only_page_left_gated_is_exhausted() {
        let page = FormPage::new();
        let solver = ChallengeSolver::new("verification")
            .with_strategy(Scripted::new("token", Ok(()), false));

        match solver.clear(&page).await {
            Err(SolveError::Exhausted { attempts }) => {
                assert!(attempts[0].contains("still shows the challenge"), "{attempts:?}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_page_after_ok_moves_to_next_strategy() {
        let page = FormPage::new().unreadable_once();
        let challenge = detect(&page.url, TURNSTILE_PAGE, "verification").unwrap();
        let solver = ChallengeSolver::new("verification")
            .with_strategy(Scripted::new("interactive", Ok(()), false))
            .with_strategy(Scripted::new("token", Ok(()), true));

        let proof = solver.solve(&page, &challenge).await.unwrap();
        assert_eq!(proof.strategy, "token");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_not_configured_is_unavailable() {
        let page = gated_page().await;
        let solver = ChallengeSolver::new("verification")
            .with_strategy(Scripted::new(
                "interactive",
                Err(StrategyError::NotConfigured("interactive solver".into())),
                false,
            ))
            .with_strategy(Scripted::new(
                "token",
                Err(StrategyError::NotConfigured("CAPSOLVER_API_KEY".into())),
                false,
            ));

        assert!(matches!(
            solver.solve(&page, &challenge()).await,
            Err(SolveError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_solve_runs_once_after_success() {
        let page = FakePage::new(FakeSite::gated(ChallengeKind::TokenChallenge).auto_pass());
        page.goto("https://dergipark.org.tr/tr/search?q=x", Duration::from_secs(1))
            .await
            .unwrap();
        let solver = ChallengeSolver::new("verification")
            .with_strategy(Scripted::new("token", Ok(()), true))
            .with_post_solve(PostSolveAction {
                url_marker: "section=article".into(),
                script: submit_script(r#"a.search-section-link[href*="section=article"]"#),
                settle: Duration::from_secs(2),
            });

        solver.clear(&page).await.unwrap();
        let url = page.current_url().await.unwrap();
        assert!(url.contains("section=article"), "{url}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_on_open_page_returns_none() {
        let page = FakePage::new(FakeSite::open());
        page.goto("https://dergipark.org.tr/tr/search?q=x&section=article", Duration::from_secs(1))
            .await
            .unwrap();
        let solver = ChallengeSolver::new("verification");
        assert_eq!(solver.clear(&page).await.unwrap(), None);
    }
}
