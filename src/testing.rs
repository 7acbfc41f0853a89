//! In-process fakes and HTML fixtures shared by the unit tests.

use crate::automation::{AutomationBackend, PageContext};
use crate::convert::ArtifactSource;
use crate::error::{AutomationError, CapabilityError, ConvertError, TaskFailure};
use crate::extract::Extractor;
use crate::fetch::PageSource;
use crate::mirror::SessionMirror;
use crate::models::{ChallengeKind, Cookie, FetchResult, FetchTask, FetchedPage};
use crate::pool::SlotPool;
use crate::retry::Backoff;
use crate::scrapers::dergipark::{CHALLENGE_MARKER, SITE_BASE, VERIFICATION_SUBMIT};
use crate::session::{SessionCache, SessionPolicy};
use crate::solver::ChallengeSolver;
use crate::solver::token::{TokenSolver, TokenStrategy, TokenTiming};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TURNSTILE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="tr"><head><title>Doğrulama</title>
<script src="https://challenges.cloudflare.com/turnstile/v0/api.js" async defer></script>
</head><body>
<form name="search_verification" method="post" action="/tr/search/verification">
  <div class="cf-turnstile" data-sitekey="0x4AAAAAAADnPIDROrmt1Wwj"></div>
  <input type="hidden" name="cf-turnstile-response" value="">
  <button type="submit" class="btn btn-primary">Devam et</button>
</form>
</body></html>"#;

pub const RECAPTCHA_PAGE: &str = r#"<!DOCTYPE html>
<html lang="tr"><head><title>Doğrulama</title></head><body>
<form name="search_verification" method="post" action="/tr/search/verification">
  <div class="g-recaptcha" data-sitekey="6LcDergiParkTestKey"></div>
  <textarea name="g-recaptcha-response" style="display:none"></textarea>
  <button type="submit">Devam et</button>
</form>
</body></html>"#;

const PLAIN_PAGE: &str = "<html><head><title>DergiPark</title></head><body>Arama</body></html>";

pub const NO_RESULTS_PAGE: &str = r#"<html><body>
<div class="search-results"><p class="text-muted">Aradığınız kriterlere uygun sonuç bulunamadı.</p></div>
</body></html>"#;

pub const INDEXES_PAGE: &str = r#"<html><body>
<div class="j-index-listing">
  <h5 class="j-index-listing-index-title"> TR Dizin </h5>
  <h5 class="j-index-listing-index-title">DOAJ</h5>
</div>
</body></html>"#;

pub const ARTICLE_PAGE: &str = r#"<html><head>
<meta name="citation_title" content="Yapay Zeka ve Hukuk">
<meta name="DC.Creator.PersonalName" content="Ayşe Yılmaz">
<meta name="DC.Creator.PersonalName" content="Mehmet Demir">
<meta name="citation_journal_title" content="Hukuk Araştırmaları Dergisi">
<meta name="citation_publication_date" content="2024/03/15">
<meta name="citation_keywords" content="yapay zeka; hukuk; sorumluluk">
<meta name="citation_doi" content="10.1234/dp.5678">
<meta name="citation_issn" content="1234-5678">
<meta name="citation_abstract" content="Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler. Bu çalışma yapay zeka sistemlerinin hukuki sorumluluğunu inceler.">
<meta name="stats_trdizin_citation_count" content="7">
<meta name="citation_reference" content="Smith, J. (2020). Machine Learning and Liability. Law Review, 12(3), 45-67.">
<meta name="citation_reference" content="Kaya, A. (2019). Hukukta Otomasyon. Ankara: Seçkin.">
<meta name="citation_reference" content="  ">
<meta name="citation_pdf_url" content="/tr/download/article-file/4152368">
<meta name="DC.Source.URI" content="https://dergipark.org.tr/tr/pub/jrn1">
</head><body><h3 class="article-title">Yapay Zeka ve Hukuk</h3></body></html>"#;

/// A search page with `n` result cards linking to `/tr/pub/jrn1/article/<i>`.
pub fn listing_page(n: usize) -> String {
    let cards: String = (1..=n)
        .map(|i| {
            format!(
                r#"<div class="card article-card dp-card-outline">
  <div class="card-body"><h5 class="card-title"><a href="/tr/pub/jrn1/article/{i}">
    Makale {i}
  </a></h5></div>
</div>
"#
            )
        })
        .collect();
    format!("<html><body><div class=\"search-results\">{cards}</div></body></html>")
}

/// A minimal article page belonging to `journal_url`.
pub fn article_page(title: &str, journal_url: &str, pdf_id: &str) -> String {
    format!(
        r#"<html><head>
<meta name="citation_title" content="{title}">
<meta name="citation_abstract" content="Kısa özet.">
<meta name="citation_reference" content="Ref A">
<meta name="citation_pdf_url" content="/tr/download/article-file/{pdf_id}">
<meta name="DC.Source.URI" content="{journal_url}">
</head><body></body></html>"#
    )
}

/// Index listing page naming `indices`.
pub fn indexes_page(indices: &[&str]) -> String {
    let items: String = indices
        .iter()
        .map(|i| format!("<h5 class=\"j-index-listing-index-title\">{i}</h5>"))
        .collect();
    format!("<html><body>{items}</body></html>")
}

/// Behaviour of the simulated site.
#[derive(Debug, Clone)]
pub struct FakeSite {
    challenge: Option<ChallengeKind>,
    auto_pass: bool,
    response_field: bool,
    clearances: Arc<AtomicUsize>,
}

impl FakeSite {
    pub fn open() -> Self {
        Self {
            challenge: None,
            auto_pass: false,
            response_field: true,
            clearances: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn gated(kind: ChallengeKind) -> Self {
        Self {
            challenge: Some(kind),
            ..Self::open()
        }
    }

    /// The widget lets the verification form through without a token.
    pub fn auto_pass(mut self) -> Self {
        self.auto_pass = true;
        self
    }

    /// The challenge page lacks the hidden response field.
    pub fn without_response_field(mut self) -> Self {
        self.response_field = false;
        self
    }
}

#[derive(Debug, Default)]
struct PageState {
    url: String,
    return_url: Option<String>,
    cleared: bool,
    token: Option<String>,
}

/// Scriptable page context. Understands the scripts built by the solver
/// (token injection, clicks) by recognising their shape.
#[derive(Debug)]
pub struct FakePage {
    site: FakeSite,
    state: Mutex<PageState>,
    closed: Arc<AtomicUsize>,
    hang_on_close: bool,
}

impl FakePage {
    pub fn new(site: FakeSite) -> Self {
        Self::with_close_counter(site, Arc::new(AtomicUsize::new(0)), false)
    }

    fn with_close_counter(site: FakeSite, closed: Arc<AtomicUsize>, hang_on_close: bool) -> Self {
        Self {
            site,
            state: Mutex::new(PageState {
                url: "about:blank".to_string(),
                ..PageState::default()
            }),
            closed,
            hang_on_close,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PageState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl PageContext for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<(), AutomationError> {
        let mut state = self.state();
        if self.site.challenge.is_some() && !state.cleared {
            state.return_url = Some(url.to_string());
            state.url = format!(
                "{SITE_BASE}/tr/search/verification?return={}",
                urlencoding::encode(url)
            );
        } else {
            state.url = url.to_string();
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, AutomationError> {
        Ok(self.state().url.clone())
    }

    async fn content(&self) -> Result<String, AutomationError> {
        let state = self.state();
        let page = match self.site.challenge {
            Some(_) if state.cleared => PLAIN_PAGE,
            Some(ChallengeKind::TokenChallenge) => TURNSTILE_PAGE,
            Some(ChallengeKind::InteractiveChallenge) => RECAPTCHA_PAGE,
            None => PLAIN_PAGE,
        };
        Ok(page.to_string())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, AutomationError> {
        let mut state = self.state();
        let challenged = state.url.contains(CHALLENGE_MARKER);

        if script.contains("search-section-link") {
            if !state.url.contains("section=article") {
                let sep = if state.url.contains('?') { '&' } else { '?' };
                state.url = format!("{}{sep}section=article", state.url);
            }
            return Ok(serde_json::Value::Bool(true));
        }
        if script.contains(".value =") {
            let accepted = challenged && self.site.response_field;
            if accepted {
                state.token = Some(script.to_string());
            }
            return Ok(serde_json::Value::Bool(accepted));
        }
        if script.contains("click()") {
            if challenged && (state.token.is_some() || self.site.auto_pass) {
                state.cleared = true;
                state.url = state
                    .return_url
                    .take()
                    .unwrap_or_else(|| format!("{SITE_BASE}/tr"));
            }
            return Ok(serde_json::Value::Bool(challenged));
        }
        Ok(serde_json::Value::Null)
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, AutomationError> {
        let n = self.site.clearances.fetch_add(1, Ordering::SeqCst) + 1;
        let cookie = |name: &str, value: String, domain: &str| Cookie {
            name: name.to_string(),
            value,
            domain: domain.to_string(),
            path: "/".to_string(),
        };
        Ok(vec![
            cookie("cf_clearance", format!("clearance-{n}"), ".dergipark.org.tr"),
            cookie("PHPSESSID", format!("sess-{n}"), "dergipark.org.tr"),
            cookie("_ga", "GA1.1.42".to_string(), ".google.com"),
        ])
    }

    fn user_agent(&self) -> Option<String> {
        Some("FakeAgent/1.0".to_string())
    }

    async fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
    }
}

/// Launches [`FakePage`]s over one shared [`FakeSite`].
#[derive(Debug)]
pub struct FakeBackend {
    site: FakeSite,
    failure: Option<String>,
    launches: AtomicUsize,
    closed: Arc<AtomicUsize>,
    hang_on_close: bool,
}

impl FakeBackend {
    pub fn new(site: FakeSite) -> Self {
        Self {
            site,
            failure: None,
            launches: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            hang_on_close: false,
        }
    }

    pub fn open() -> Self {
        Self::new(FakeSite::open())
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::open()
        }
    }

    /// Contexts whose `close` never completes.
    pub fn with_hanging_close(mut self) -> Self {
        self.hang_on_close = true;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AutomationBackend for FakeBackend {
    async fn launch(&self) -> Result<Box<dyn PageContext>, AutomationError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(AutomationError::Browser(message.clone()));
        }
        Ok(Box::new(FakePage::with_close_counter(
            self.site.clone(),
            Arc::clone(&self.closed),
            self.hang_on_close,
        )))
    }
}

/// Token solver returning a fixed token and recording every call.
#[derive(Debug)]
pub struct CountingTokenSolver {
    answer: Result<String, CapabilityError>,
    fail_first: usize,
    first_error: Option<CapabilityError>,
    delay: Duration,
    calls: AtomicUsize,
    kinds: Mutex<Vec<ChallengeKind>>,
}

impl CountingTokenSolver {
    pub fn new(token: &str) -> Self {
        Self {
            answer: Ok(token.to_string()),
            fail_first: 0,
            first_error: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            kinds: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: CapabilityError) -> Self {
        Self {
            answer: Err(error),
            ..Self::new("")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` calls with `error`, then answer normally.
    pub fn failing_first(mut self, n: usize, error: CapabilityError) -> Self {
        self.fail_first = n;
        self.first_error = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<ChallengeKind> {
        self.kinds.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenSolver for CountingTokenSolver {
    async fn solve(
        &self,
        _site_key: &str,
        _page_url: &str,
        kind: ChallengeKind,
    ) -> Result<String, CapabilityError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.kinds.lock().unwrap().push(kind);
        tokio::time::sleep(self.delay).await;
        if n <= self.fail_first {
            if let Some(e) = &self.first_error {
                return Err(e.clone());
            }
        }
        self.answer.clone()
    }
}

/// Session cache over a fake site, with a token strategy only.
pub fn session_cache(
    site: FakeSite,
    token: Option<Arc<CountingTokenSolver>>,
    mirror_path: Option<PathBuf>,
) -> (SessionCache, SlotPool) {
    let pool = SlotPool::new(Arc::new(FakeBackend::new(site)), 3, Duration::from_secs(5));
    let strategy = TokenStrategy::new(
        token.map(|t| t as Arc<dyn TokenSolver>),
        VERIFICATION_SUBMIT,
        TokenTiming {
            timeout: Duration::from_secs(150),
            settle: Duration::from_millis(10),
            post_submit: Duration::from_millis(10),
        },
    );
    let solver = ChallengeSolver::new(CHALLENGE_MARKER).with_strategy(Arc::new(strategy));
    let policy = SessionPolicy {
        entry_url: format!("{SITE_BASE}/tr/search?q=%2A&section=article"),
        cookie_domain: "dergipark.org.tr".to_string(),
        ttl: Duration::from_secs(1800),
        pool_timeout: Duration::from_secs(1),
        navigation_timeout: Duration::from_secs(5),
        pool_retries: 2,
        backoff: Backoff::new(2, Duration::from_millis(100)),
    };
    let cache = SessionCache::new(
        pool.clone(),
        Arc::new(solver),
        mirror_path.map(SessionMirror::new),
        policy,
    );
    (cache, pool)
}

#[derive(Debug, Clone)]
enum Rejection {
    Never,
    Always,
    /// Reject sessions whose cookie header contains this value.
    OnCookie(String),
}

/// Canned answer for one URL.
#[derive(Debug, Clone)]
pub struct Reply {
    result: Result<String, TaskFailure>,
    delay: Duration,
    rejection: Rejection,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            result: Ok(body.into()),
            delay: Duration::ZERO,
            rejection: Rejection::Never,
        }
    }

    pub fn fail(failure: TaskFailure) -> Self {
        Self {
            result: Err(failure),
            ..Self::ok("")
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rejecting_all(mut self) -> Self {
        self.rejection = Rejection::Always;
        self
    }

    pub fn rejecting_on(mut self, cookie_value: &str) -> Self {
        self.rejection = Rejection::OnCookie(cookie_value.to_string());
        self
    }
}

/// Page source answering from a URL table. Unknown URLs get a 404.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<HashMap<String, usize>>,
    cookies_seen: Mutex<HashMap<String, String>>,
    total: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, url: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Cookie header sent with the latest fetch of `url`.
    pub fn cookie_for(&self, url: &str) -> Option<String> {
        self.cookies_seen.lock().unwrap().get(url).cloned()
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch(&self, task: &FetchTask) -> FetchResult {
        let url = task.target.url.clone();
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(url.clone()).or_insert(0) += 1;
        if let Some(header) = task.session.cookie_header() {
            self.cookies_seen.lock().unwrap().insert(url.clone(), header);
        }
        let reply = self.replies.lock().unwrap().get(&url).cloned();

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(reply) = &reply {
            tokio::time::sleep(reply.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let Some(reply) = reply else {
            return Err(TaskFailure::Status(404));
        };
        let rejected = match &reply.rejection {
            Rejection::Never => false,
            Rejection::Always => true,
            Rejection::OnCookie(value) => task
                .session
                .cookie_header()
                .is_some_and(|h| h.contains(value.as_str())),
        };
        if rejected {
            return Err(TaskFailure::SessionRejected);
        }
        reply.result.map(|body| FetchedPage {
            url: url.clone(),
            final_url: url,
            status: 200,
            body,
        })
    }
}

/// Artifact source serving fixed bytes.
#[derive(Debug)]
pub struct FakeArtifactSource {
    bytes: Vec<u8>,
    delay: Duration,
    downloads: AtomicUsize,
}

impl FakeArtifactSource {
    pub fn with_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            delay: Duration::ZERO,
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for FakeArtifactSource {
    async fn download(&self, _content_id: &str) -> Result<Vec<u8>, ConvertError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.bytes.clone())
    }
}

/// Extractor that returns the bytes as text, or always fails.
#[derive(Debug)]
pub struct FakeExtractor {
    failure: Option<CapabilityError>,
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn echo() -> Self {
        Self {
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: CapabilityError) -> Self {
        Self {
            failure: Some(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    fn name(&self) -> &str {
        if self.failure.is_some() { "failing" } else { "echo" }
    }

    async fn extract(&self, bytes: &[u8]) -> Result<String, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}
