//! Data models shared by the session, fetch and conversion layers.
//!
//! This module defines:
//! - [`Session`]: the credential bundle proven by a solved challenge
//! - [`ChallengeDescriptor`] and [`ProofToken`]: input and output of a solve
//! - [`Target`], [`FetchTask`], [`FetchedPage`]: units of orchestrated work
//! - [`Artifact`]: extracted text of a downloaded document
//! - Site records ([`ArticleLink`], [`ArticleRecord`], [`SearchResponse`], ...)

use crate::error::TaskFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A single cookie captured from the automation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Credential bundle proving a challenge was satisfied.
///
/// Never mutated after creation. Expiry or upstream rejection replaces the
/// whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Cookies scoped to the gated site.
    pub cookies: Vec<Cookie>,
    /// Extra request headers that must accompany the cookies (user agent).
    pub headers: BTreeMap<String, String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        cookies: Vec<Cookie>,
        headers: BTreeMap<String, String>,
        acquired_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = acquired_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            cookies,
            headers,
            acquired_at,
            expires_at,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Time left before expiry, zero when already expired.
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// `Cookie` request header value, `None` when the bundle is empty.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Anti-bot widget families the solver knows how to beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeKind {
    /// Token widget (Cloudflare Turnstile): proof is a token in a hidden field.
    TokenChallenge,
    /// Interactive widget (reCAPTCHA v2): proof is the `g-recaptcha-response`.
    InteractiveChallenge,
}

impl ChallengeKind {
    /// Hidden form field the proof token is written into.
    pub fn response_field(&self) -> &'static str {
        match self {
            ChallengeKind::TokenChallenge => "cf-turnstile-response",
            ChallengeKind::InteractiveChallenge => "g-recaptcha-response",
        }
    }
}

/// A detected challenge, consumed by one strategy per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeDescriptor {
    pub kind: ChallengeKind,
    /// Public site key of the widget, when the page exposes one.
    pub site_key: Option<String>,
    /// URL of the page showing the challenge.
    pub page_url: String,
}

/// Evidence that a strategy cleared the challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProofToken {
    pub kind: ChallengeKind,
    /// Name of the strategy that produced it.
    pub strategy: String,
    /// Token value, when one left the page or came from a solving service.
    pub token: Option<String>,
}

/// Pacing class of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Search result listing pages.
    Listing,
    /// Per-item detail pages and their dependent lookups.
    Detail,
}

/// Something the orchestrator should fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    pub kind: TaskKind,
    pub referer: Option<String>,
}

impl Target {
    pub fn listing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: TaskKind::Listing,
            referer: None,
        }
    }

    pub fn detail(url: impl Into<String>, referer: Option<String>) -> Self {
        Self {
            url: url.into(),
            kind: TaskKind::Detail,
            referer,
        }
    }
}

/// One immutable unit of orchestrated work: a target bound to a session.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub target: Target,
    pub session: Arc<Session>,
}

/// A page returned by upstream with the session accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// Requested URL.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub body: String,
}

/// Result of one task inside a batch.
pub type FetchResult = Result<FetchedPage, TaskFailure>;

/// Which extraction tier produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceMethod {
    DirectExtraction,
    FallbackExtraction,
}

/// Extracted text of a downloaded document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub content_id: String,
    pub text: String,
    pub source_method: SourceMethod,
}

/// Result ordering accepted by the site search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Newest,
    Oldest,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Newest => "newest",
            SortOrder::Oldest => "oldest",
        }
    }
}

/// Post-fetch filter on the journal indexes an article is listed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IndexFilter {
    /// Keep everything.
    #[default]
    #[value(alias = "hepsi")]
    All,
    /// Keep articles whose journal is indexed by TR Dizin.
    #[value(alias = "tr_dizin_icerenler")]
    TrIndex,
    /// Keep articles whose journal lists at least one index.
    #[value(alias = "bos_olmayanlar")]
    NonEmpty,
}

impl IndexFilter {
    pub fn accepts(&self, indices: &str) -> bool {
        match self {
            IndexFilter::All => true,
            IndexFilter::TrIndex => indices.contains("TR Dizin"),
            IndexFilter::NonEmpty => !indices.trim().is_empty(),
        }
    }
}

/// A search result link scraped from a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleLink {
    pub url: String,
    pub title: String,
}

/// Citation metadata of a single article page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleDetails {
    pub citation_title: Option<String>,
    pub citation_author: Option<String>,
    pub citation_journal_title: Option<String>,
    pub citation_publication_date: Option<String>,
    pub citation_keywords: Option<String>,
    pub citation_doi: Option<String>,
    pub citation_issn: Option<String>,
    pub citation_abstract: String,
    pub stats_citation_count: String,
    pub stats_reference_count: usize,
}

/// One article in a result set, carrying either details or the reason they
/// could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub title: String,
    pub url: String,
    pub error: Option<String>,
    pub details: Option<ArticleDetails>,
    pub indices: String,
    pub pdf_url: Option<String>,
}

/// Everything fetched for one search fingerprint; the Result Cache value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultSet {
    pub fingerprint: String,
    pub search_url: String,
    pub articles: Vec<ArticleRecord>,
    pub fetched_at: DateTime<Utc>,
}

/// Pagination over one upstream listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub api_page: usize,
    pub page_size: usize,
    pub total_items_on_page: usize,
    pub total_api_pages: usize,
}

/// Caller-facing search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub fingerprint: String,
    pub pagination: Pagination,
    pub articles: Vec<ArticleRecord>,
}

/// Reference list of an article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleReferences {
    pub article_url: String,
    pub title: Option<String>,
    pub reference_count: usize,
    pub references: Vec<String>,
}
