//! Caller-facing facade over the session, fetch and conversion layers.
//!
//! Every call returns an [`Outcome`]: internal errors are folded into a
//! small set of distinguishable results so a caller can tell an upstream
//! defense change (`RateLimited`) from a missing dependency
//! (`Misconfigured`) or plain slowness (`Unavailable`).
//!
//! # Search pipeline
//!
//! 1. Result Cache lookup by query fingerprint (single-flight on a miss)
//! 2. Listing page, then every article page in one batch
//! 3. Index page of every distinct journal, in a second batch
//! 4. Cache the full result set, then filter and paginate per request

use crate::automation::chromium::ChromiumBackend;
use crate::cache::{SingleFlight, TtlCache};
use crate::config::{Secrets, Settings};
use crate::convert::{ArtifactConverter, HttpArtifactSource};
use crate::error::{AcquireError, ConfigError, ConvertError, ErrorKind, TaskFailure};
use crate::extract::{MistralOcr, PdfTextExtractor};
use crate::fetch::Orchestrator;
use crate::mirror::SessionMirror;
use crate::models::{
    Artifact, ArticleRecord, ArticleReferences, IndexFilter, Pagination, SearchResponse,
    SearchResultSet, Target,
};
use crate::pool::SlotPool;
use crate::retry::RetryTokenSolver;
use crate::scrapers::dergipark::{self, SearchQuery, VERIFICATION_SUBMIT};
use crate::session::SessionCache;
use crate::solver::ChallengeSolver;
use crate::solver::capsolver::CapSolverClient;
use crate::solver::interactive::{AutoPassSolver, InteractiveStrategy};
use crate::solver::token::TokenStrategy;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{info, instrument, warn};

/// Articles per API page.
pub const PAGE_SIZE: usize = 24;

/// Result of a facade call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Outcome<T> {
    Ready(T),
    NotFound,
    /// The challenge could not be beaten or the pool is saturated; back off.
    RateLimited(String),
    /// Timed out or upstream misbehaved.
    Unavailable(String),
    /// A required capability (solver key, OCR key, browser) is missing.
    Misconfigured(String),
    /// The request itself is malformed.
    Invalid(String),
}

impl<T> Outcome<T> {
    /// HTTP-style status for the outcome.
    pub fn status_code(&self) -> u16 {
        match self {
            Outcome::Ready(_) => 200,
            Outcome::NotFound => 404,
            Outcome::RateLimited(_) => 429,
            Outcome::Unavailable(_) => 503,
            Outcome::Misconfigured(_) => 500,
            Outcome::Invalid(_) => 400,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Outcome::Ready(v) => Some(v),
            _ => None,
        }
    }
}

impl<T> From<&AcquireError> for Outcome<T> {
    fn from(e: &AcquireError) -> Self {
        match e.kind() {
            ErrorKind::SolveFailed | ErrorKind::PoolTimeout => Outcome::RateLimited(e.to_string()),
            ErrorKind::ExternalCapabilityUnavailable => Outcome::Misconfigured(e.to_string()),
            _ => Outcome::Unavailable(e.to_string()),
        }
    }
}

impl<T> From<ConvertError> for Outcome<T> {
    fn from(e: ConvertError) -> Self {
        match e {
            ConvertError::InvalidId(_) => Outcome::Invalid(e.to_string()),
            ConvertError::CapabilityUnavailable(_) => Outcome::Misconfigured(e.to_string()),
            other => Outcome::Unavailable(other.to_string()),
        }
    }
}

/// One search call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: SearchQuery,
    /// 1-based page over the (filtered) result set.
    pub api_page: usize,
    pub index_filter: IndexFilter,
}

/// What the `session` command reports. Cookie values stay private.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub cookie_names: Vec<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remaining_secs: u64,
}

#[derive(Debug, Clone, Error)]
enum SearchFailure {
    #[error("no results")]
    NoResults,
    #[error(transparent)]
    Session(#[from] AcquireError),
    #[error("listing page failed: {0}")]
    Listing(TaskFailure),
    #[error("search aborted: {0}")]
    Aborted(String),
}

impl From<JoinError> for SearchFailure {
    fn from(e: JoinError) -> Self {
        SearchFailure::Aborted(e.to_string())
    }
}

fn search_outcome(e: SearchFailure) -> Outcome<SearchResponse> {
    match e {
        SearchFailure::NoResults => Outcome::NotFound,
        SearchFailure::Session(e) => Outcome::from(&e),
        SearchFailure::Listing(TaskFailure::SessionRejected) => {
            Outcome::RateLimited("listing page rejected the session".to_string())
        }
        other => Outcome::Unavailable(other.to_string()),
    }
}

/// Facade-level knobs.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    pub site_base: String,
    pub result_ttl: Duration,
    pub result_capacity: usize,
    /// Bound on one whole caller request.
    pub caller_timeout: Duration,
}

struct Inner {
    orchestrator: Orchestrator,
    index_orchestrator: Orchestrator,
    converter: ArtifactConverter,
    results: TtlCache<String, SearchResultSet>,
    searches: SingleFlight<String, SearchResultSet, SearchFailure>,
    policy: GatewayPolicy,
}

/// The process-wide entry point. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
    pool: Option<SlotPool>,
}

/// Slice the filtered result set to one API page.
pub fn paginate(set: &SearchResultSet, filter: IndexFilter, api_page: usize) -> SearchResponse {
    let filtered: Vec<&ArticleRecord> = set
        .articles
        .iter()
        .filter(|a| filter.accepts(&a.indices))
        .collect();
    let api_page = api_page.max(1);
    let total = filtered.len();
    let articles: Vec<ArticleRecord> = filtered
        .into_iter()
        .skip((api_page - 1).saturating_mul(PAGE_SIZE))
        .take(PAGE_SIZE)
        .cloned()
        .collect();
    SearchResponse {
        fingerprint: set.fingerprint.clone(),
        pagination: Pagination {
            api_page,
            page_size: PAGE_SIZE,
            total_items_on_page: total,
            total_api_pages: total.div_ceil(PAGE_SIZE),
        },
        articles,
    }
}

/// Run `fut` under the caller timeout; the error is the operator message.
async fn bounded<F: Future>(limit: Duration, what: &str, fut: F) -> Result<F::Output, String> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| format!("{what} did not finish within {limit:?}"))
}

impl Gateway {
    pub fn new(
        orchestrator: Orchestrator,
        index_orchestrator: Orchestrator,
        converter: ArtifactConverter,
        policy: GatewayPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                index_orchestrator,
                converter,
                results: TtlCache::new("results", policy.result_ttl, policy.result_capacity),
                searches: SingleFlight::new(),
                policy,
            }),
            pool: None,
        }
    }

    /// Attach the slot pool so [`shutdown`](Self::shutdown) can close it.
    pub fn with_pool(mut self, pool: SlotPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Wire the production stack: Chromium slots, CapSolver, HTTP fetches,
    /// pdf-extract and Mistral OCR.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the settings are inconsistent or the
    /// HTTP client cannot be built.
    pub fn from_settings(
        settings: &Settings,
        secrets: &Secrets,
        headless: bool,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client: {e}")))?;

        let backend = Arc::new(ChromiumBackend::new(
            headless,
            settings.pool.chromium_path.clone(),
        ));
        let pool = SlotPool::new(
            backend,
            settings.pool.capacity,
            Duration::from_secs(settings.pool.launch_timeout_secs),
        );

        let capsolver = CapSolverClient::new(http.clone(), secrets.capsolver_api_key.clone())
            .with_polling(
                Duration::from_millis(settings.solver.poll_interval_ms),
                settings.solver.max_polls,
            );
        if !capsolver.is_configured() {
            warn!("CAPSOLVER_API_KEY not set; token challenges cannot be solved");
        }
        let tokens = RetryTokenSolver::new(capsolver, settings.token_backoff());

        let mut solver = ChallengeSolver::new(settings.site.challenge_marker.clone());
        if settings.solver.interactive {
            let auto_pass = AutoPassSolver::new(
                Duration::from_secs(settings.solver.auto_pass_wait_secs),
                VERIFICATION_SUBMIT,
                Duration::from_millis(settings.solver.post_submit_ms),
            );
            solver = solver.with_strategy(Arc::new(InteractiveStrategy::new(
                Some(Arc::new(auto_pass)),
                Duration::from_secs(settings.solver.interactive_timeout_secs),
            )));
        }
        let solver = solver
            .with_strategy(Arc::new(TokenStrategy::new(
                Some(Arc::new(tokens)),
                VERIFICATION_SUBMIT,
                settings.token_timing(),
            )))
            .with_post_solve(settings.post_solve_action());
        info!(strategies = ?solver.strategy_names(), "Challenge solver configured");

        let mirror = settings.session.mirror_path.clone().map(SessionMirror::new);
        let sessions = SessionCache::new(
            pool.clone(),
            Arc::new(solver),
            mirror,
            settings.session_policy(),
        );

        let source = Arc::new(crate::upstream::HttpPageSource::new(
            http.clone(),
            settings.site.challenge_marker.clone(),
            settings.site.block_markers.clone(),
            Duration::from_secs(settings.fetch.request_timeout_secs),
        ));
        let orchestrator = Orchestrator::new(sessions.clone(), source.clone(), settings.fetch_policy());
        let index_orchestrator = Orchestrator::new(sessions, source, settings.index_fetch_policy());

        let converter = ArtifactConverter::new(
            Arc::new(HttpArtifactSource::new(
                http.clone(),
                settings.site.artifact_url_template.clone(),
                Duration::from_secs(settings.convert.download_timeout_secs),
            )),
            Arc::new(PdfTextExtractor),
            Some(Arc::new(MistralOcr::new(
                http,
                secrets.mistral_api_key.clone(),
                Duration::from_secs(settings.convert.ocr_timeout_secs),
            ))),
            settings.convert_policy(),
        );

        let policy = GatewayPolicy {
            site_base: settings.site.base_url.clone(),
            result_ttl: Duration::from_secs(settings.cache.result_ttl_secs),
            result_capacity: settings.cache.result_capacity,
            caller_timeout: settings.caller_timeout(),
        };
        Ok(Gateway::new(orchestrator, index_orchestrator, converter, policy).with_pool(pool))
    }

    pub fn sessions(&self) -> &SessionCache {
        self.inner.orchestrator.sessions()
    }

    /// Seed the session from the durable mirror, if one is fresh.
    pub async fn start(&self) {
        if self.sessions().restore_from_mirror().await {
            info!("Restored session from mirror");
        } else {
            info!("No usable session mirror; will acquire on first demand");
        }
    }

    /// Close every automation slot.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
    }

    /// Make sure a valid session exists, acquiring one if needed.
    #[instrument(level = "info", skip_all)]
    pub async fn warm_session(&self) -> Outcome<SessionStatus> {
        let limit = self.inner.policy.caller_timeout;
        match self.sessions().get_valid_within(limit).await {
            Ok(session) => Outcome::Ready(SessionStatus {
                cookie_names: session.cookies.iter().map(|c| c.name.clone()).collect(),
                acquired_at: session.acquired_at,
                expires_at: session.expires_at,
                remaining_secs: session.remaining().as_secs(),
            }),
            Err(e) => Outcome::from(&e),
        }
    }

    /// Search, serving repeats of the same fingerprint from the Result Cache.
    #[instrument(level = "info", skip_all, fields(fingerprint = %req.query.fingerprint(), api_page = req.api_page))]
    pub async fn search(&self, req: &SearchRequest) -> Outcome<SearchResponse> {
        let limit = self.inner.policy.caller_timeout;
        match bounded(limit, "search", self.result_set(&req.query)).await {
            Ok(Ok(set)) => Outcome::Ready(paginate(&set, req.index_filter, req.api_page)),
            Ok(Err(e)) => {
                warn!(error = %e, "Search failed");
                search_outcome(e)
            }
            Err(msg) => Outcome::Unavailable(msg),
        }
    }

    /// Download and extract an article PDF. Accepts a content id or a
    /// download URL.
    #[instrument(level = "info", skip_all, fields(%input))]
    pub async fn convert(&self, input: &str) -> Outcome<Artifact> {
        let content_id = if input.starts_with("http") {
            match dergipark::content_id_from_pdf_url(input) {
                Some(id) => id,
                None => return Outcome::Invalid(format!("not an article file URL: {input}")),
            }
        } else {
            input.trim().to_string()
        };
        let limit = self.inner.policy.caller_timeout;
        match bounded(limit, "conversion", self.inner.converter.convert(&content_id)).await {
            Ok(Ok(artifact)) => Outcome::Ready(artifact),
            Ok(Err(e)) => {
                warn!(error = %e, "Conversion failed");
                e.into()
            }
            Err(msg) => Outcome::Unavailable(msg),
        }
    }

    /// Reference list of one article page.
    #[instrument(level = "info", skip_all, fields(%article_url))]
    pub async fn references(&self, article_url: &str) -> Outcome<ArticleReferences> {
        if url::Url::parse(article_url).is_err() {
            return Outcome::Invalid(format!("not a URL: {article_url}"));
        }
        let limit = self.inner.policy.caller_timeout;
        let fetch = self
            .inner
            .orchestrator
            .fetch_one(Target::detail(article_url, None));
        match bounded(limit, "references", fetch).await {
            Ok(Ok(Ok(page))) => {
                Outcome::Ready(dergipark::parse_references(&page.body, article_url))
            }
            Ok(Ok(Err(TaskFailure::Status(404)))) => Outcome::NotFound,
            Ok(Ok(Err(TaskFailure::SessionRejected))) => {
                Outcome::RateLimited("article page rejected the session".to_string())
            }
            Ok(Ok(Err(e))) => Outcome::Unavailable(e.to_string()),
            Ok(Err(e)) => Outcome::from(&e),
            Err(msg) => Outcome::Unavailable(msg),
        }
    }

    async fn result_set(&self, query: &SearchQuery) -> Result<SearchResultSet, SearchFailure> {
        let fingerprint = query.fingerprint();
        if let Some(hit) = self.inner.results.get(&fingerprint) {
            info!(%fingerprint, "Result cache hit");
            return Ok(hit);
        }
        info!(%fingerprint, "Result cache miss");
        let this = self.clone();
        let query = query.clone();
        self.inner
            .searches
            .run(fingerprint, move || async move { this.fetch_result_set(&query).await })
            .await
    }

    async fn fetch_result_set(&self, query: &SearchQuery) -> Result<SearchResultSet, SearchFailure> {
        let fingerprint = query.fingerprint();
        if let Some(hit) = self.inner.results.get(&fingerprint) {
            return Ok(hit);
        }
        let t0 = Instant::now();
        let search_url = query.search_url(&self.inner.policy.site_base);

        let listing = self
            .inner
            .orchestrator
            .fetch_one(Target::listing(&search_url))
            .await?
            .map_err(SearchFailure::Listing)?;
        let page = dergipark::parse_listing(&listing.body, &listing.final_url);
        if page.links.is_empty() {
            if !page.no_results {
                warn!(%search_url, "Listing has no result cards and no empty-result notice");
            }
            return Err(SearchFailure::NoResults);
        }

        let targets = page
            .links
            .iter()
            .map(|l| Target::detail(l.url.clone(), Some(search_url.clone())))
            .collect();
        let details = self.inner.orchestrator.fetch_all(targets).await?;
        let mut complete = true;

        let parsed: Vec<_> = page
            .links
            .into_iter()
            .zip(details)
            .map(|(link, result)| {
                let article = result.map(|p| dergipark::parse_article(&p.body, &self.inner.policy.site_base));
                if article.is_err() {
                    complete = false;
                }
                (link, article)
            })
            .collect();

        let journals: Vec<String> = parsed
            .iter()
            .filter_map(|(_, a)| a.as_ref().ok()?.journal_url.clone())
            .unique()
            .collect();
        let indices = self.fetch_indices(&journals, &mut complete).await;

        let articles = parsed
            .into_iter()
            .map(|(link, article)| match article {
                Ok(a) => ArticleRecord {
                    title: link.title,
                    url: link.url,
                    error: None,
                    indices: a
                        .journal_url
                        .as_ref()
                        .and_then(|j| indices.get(j).cloned())
                        .unwrap_or_default(),
                    details: Some(a.details),
                    pdf_url: a.pdf_url,
                },
                Err(e) => ArticleRecord {
                    title: link.title,
                    url: link.url,
                    error: Some(e.to_string()),
                    details: None,
                    indices: String::new(),
                    pdf_url: None,
                },
            })
            .collect::<Vec<_>>();

        let set = SearchResultSet {
            fingerprint: fingerprint.clone(),
            search_url,
            articles,
            fetched_at: Utc::now(),
        };
        let failed = set.articles.iter().filter(|a| a.error.is_some()).count();
        if complete {
            self.inner.results.insert(fingerprint, set.clone());
        } else {
            warn!(failed, "Result set incomplete; not caching");
        }
        info!(
            articles = set.articles.len(),
            journals = journals.len(),
            failed,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Search fetched"
        );
        Ok(set)
    }

    /// Index names per journal URL. Failures leave a journal out and mark
    /// the set incomplete.
    async fn fetch_indices(&self, journals: &[String], complete: &mut bool) -> HashMap<String, String> {
        if journals.is_empty() {
            return HashMap::new();
        }
        let targets = journals
            .iter()
            .map(|j| Target::detail(dergipark::indexes_url(j), Some(j.clone())))
            .collect();
        let results = match self.inner.index_orchestrator.fetch_all(targets).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "Index pages skipped");
                *complete = false;
                return HashMap::new();
            }
        };
        journals
            .iter()
            .zip(results)
            .filter_map(|(journal, result)| match result {
                Ok(page) => Some((journal.clone(), dergipark::parse_indices(&page.body))),
                Err(e) => {
                    warn!(%journal, error = %e, "Index page failed");
                    *complete = false;
                    None
                }
            })
            .collect()
    }
}
