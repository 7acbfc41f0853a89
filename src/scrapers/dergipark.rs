//! DergiPark search and article page rules.
//!
//! Pure functions only: building search URLs and fingerprints, and parsing
//! listing, article and journal-index pages. Fetching is the orchestrator's
//! job.
//!
//! # URL Pattern
//!
//! ```text
//! https://dergipark.org.tr/tr/search?q=yapay%20zeka&section=article&page=2&sortBy=newest
//! https://dergipark.org.tr/tr/pub/<journal>/article/<id>
//! https://dergipark.org.tr/tr/pub/<journal>/indexes
//! https://dergipark.org.tr/tr/download/article-file/<id>
//! ```

use crate::models::{ArticleDetails, ArticleLink, ArticleReferences, SortOrder};
use crate::utils::{collapse_whitespace, truncate_words};
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use urlencoding::encode;

pub const SITE_BASE: &str = "https://dergipark.org.tr";
pub const ARTIFACT_URL_TEMPLATE: &str = "https://dergipark.org.tr/tr/download/article-file/{id}";
/// URL fragment of the challenge page.
pub const CHALLENGE_MARKER: &str = "verification";
pub const NO_RESULTS_MARKER: &str = "sonuç bulunamadı";
pub const VERIFICATION_SUBMIT: &str = r#"form[name="search_verification"] button[type="submit"]"#;
pub const ARTICLE_SECTION_LINK: &str = r#"a.search-section-link[href*="section=article"]"#;
pub const ARTICLE_SECTION_MARKER: &str = "section=article";
/// Abstracts are cut to this many words in result sets.
pub const ABSTRACT_WORDS: usize = 100;

static CARD_LINK: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("div.card.article-card.dp-card-outline h5.card-title > a[href]")
        .expect("static selector")
});
static META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[name]").expect("static selector"));
static INDEX_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h5.j-index-listing-index-title").expect("static selector"));

/// Parameters of one upstream search page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    /// Upstream result page, 1-based.
    pub page: usize,
    pub sort: Option<SortOrder>,
    pub article_type: Option<String>,
    pub year: Option<String>,
}

/// Trim, lowercase and collapse whitespace; an empty query matches all.
pub fn normalize_query(query: &str) -> String {
    let normalized = collapse_whitespace(query).to_lowercase();
    if normalized.is_empty() {
        "*".to_string()
    } else {
        normalized
    }
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            page: 1,
            ..Self::default()
        }
    }

    fn page(&self) -> usize {
        self.page.max(1)
    }

    /// Result Cache key, e.g. `yapay zeka|page=1|sort=newest`.
    pub fn fingerprint(&self) -> String {
        let mut key = format!(
            "{}|page={}|sort={}",
            normalize_query(&self.query),
            self.page(),
            self.sort.map(|s| s.as_str()).unwrap_or("relevance")
        );
        if let Some(t) = self.article_type.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            key.push_str(&format!("|type={t}"));
        }
        if let Some(y) = self.year.as_deref().map(str::trim).filter(|y| !y.is_empty()) {
            key.push_str(&format!("|year={y}"));
        }
        key
    }

    /// Upstream search URL under `base`.
    pub fn search_url(&self, base: &str) -> String {
        let q = collapse_whitespace(&self.query);
        let q = if q.is_empty() { "*".to_string() } else { q };
        let mut url = format!(
            "{}/tr/search?q={}&section=article",
            base.trim_end_matches('/'),
            encode(&q)
        );
        if self.page() > 1 {
            url.push_str(&format!("&page={}", self.page()));
        }
        if let Some(t) = self.article_type.as_deref().filter(|t| !t.trim().is_empty()) {
            url.push_str(&format!("&{}={}", encode("filter[article_type][]"), encode(t.trim())));
        }
        if let Some(sort) = self.sort {
            url.push_str(&format!("&sortBy={}", sort.as_str()));
        }
        if let Some(y) = self.year.as_deref().filter(|y| !y.trim().is_empty()) {
            url.push_str(&format!("&{}={}", encode("filter[publication_year][]"), encode(y.trim())));
        }
        url
    }
}

/// Links found on a listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub links: Vec<ArticleLink>,
    /// The page says there are no results (as opposed to failing to render
    /// any cards).
    pub no_results: bool,
}

/// Parse search result cards, resolving links against `page_url`.
pub fn parse_listing(html: &str, page_url: &str) -> ListingPage {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let mut links = Vec::new();
    for a in document.select(&CARD_LINK) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let url = match &base {
            Some(base) => match base.join(href) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            },
            None => href.to_string(),
        };
        let title = collapse_whitespace(&a.text().collect::<String>());
        links.push(ArticleLink {
            url,
            title: if title.is_empty() { "N/A".to_string() } else { title },
        });
    }

    let no_results = links.is_empty() && html.to_lowercase().contains(NO_RESULTS_MARKER);
    debug!(count = links.len(), no_results, "Parsed listing page");
    ListingPage { links, no_results }
}

/// Everything read from an article page's meta tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticlePage {
    pub details: ArticleDetails,
    pub pdf_url: Option<String>,
    pub journal_url: Option<String>,
    pub references: Vec<String>,
}

struct Metas(Vec<(String, String)>);

impl Metas {
    fn read(document: &Html) -> Self {
        Self(
            document
                .select(&META)
                .filter_map(|m| {
                    let name = m.value().attr("name")?;
                    let content = m.value().attr("content").unwrap_or_default().trim();
                    Some((name.to_string(), content.to_string()))
                })
                .collect(),
        )
    }

    fn first(&self, name: &str) -> Option<String> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
            .filter(|c| !c.is_empty())
    }

    fn all(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(n, c)| n == name && !c.is_empty())
            .map(|(_, c)| c.clone())
            .collect()
    }
}

/// Make a site-relative PDF link absolute.
pub fn absolute_url(raw: &str, base: &str) -> String {
    if raw.starts_with('/') {
        format!("{}{}", base.trim_end_matches('/'), raw)
    } else {
        raw.to_string()
    }
}

/// Parse an article page's citation metadata.
pub fn parse_article(html: &str, site_base: &str) -> ArticlePage {
    let document = Html::parse_document(html);
    let metas = Metas::read(&document);
    let references = metas.all("citation_reference");
    let authors = metas.all("DC.Creator.PersonalName");

    let details = ArticleDetails {
        citation_title: metas.first("citation_title"),
        citation_author: (!authors.is_empty()).then(|| authors.join(", ")),
        citation_journal_title: metas.first("citation_journal_title"),
        citation_publication_date: metas.first("citation_publication_date"),
        citation_keywords: metas.first("citation_keywords"),
        citation_doi: metas.first("citation_doi"),
        citation_issn: metas.first("citation_issn"),
        citation_abstract: truncate_words(
            &metas.first("citation_abstract").unwrap_or_default(),
            ABSTRACT_WORDS,
        ),
        stats_citation_count: metas
            .first("stats_trdizin_citation_count")
            .unwrap_or_else(|| "0".to_string()),
        stats_reference_count: references.len(),
    };

    ArticlePage {
        details,
        pdf_url: metas
            .first("citation_pdf_url")
            .map(|u| absolute_url(&u, site_base)),
        journal_url: metas.first("DC.Source.URI"),
        references,
    }
}

/// Journal indexes page for a journal base URL.
pub fn indexes_url(journal_url: &str) -> String {
    format!("{}/indexes", journal_url.trim_end_matches('/'))
}

/// Index names listed on a journal's indexes page, comma separated.
pub fn parse_indices(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .select(&INDEX_TITLE)
        .map(|e| collapse_whitespace(&e.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reference list of an article page.
pub fn parse_references(html: &str, article_url: &str) -> ArticleReferences {
    let document = Html::parse_document(html);
    let metas = Metas::read(&document);
    let references = metas.all("citation_reference");
    ArticleReferences {
        article_url: article_url.to_string(),
        title: metas.first("citation_title"),
        reference_count: references.len(),
        references,
    }
}

/// Article content ids accepted by the download endpoint, taken from a PDF
/// URL such as `.../download/article-file/4152368`.
pub fn content_id_from_pdf_url(pdf_url: &str) -> Option<String> {
    let url = Url::parse(pdf_url).ok()?;
    let mut segments = url.path_segments()?;
    segments
        .by_ref()
        .find(|s| *s == "article-file")
        .and_then(|_| segments.next())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
