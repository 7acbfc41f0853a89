//! Artifact conversion with a two-tier extraction policy and a TTL cache.
//!
//! The fast extractor runs first. When it yields fewer than `min_chars`
//! characters (a scanned document, most likely) the fallback extractor is
//! invoked exactly once and its output is what gets cached. Low yield is a
//! signal, not an error.
//!
//! Concurrent conversions of the same content id share one download and one
//! extraction.

use crate::cache::{SingleFlight, TtlCache};
use crate::error::{CapabilityError, ConvertError};
use crate::extract::Extractor;
use crate::models::{Artifact, SourceMethod};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Where raw document bytes come from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn download(&self, content_id: &str) -> Result<Vec<u8>, ConvertError>;
}

/// Content ids are path segments: ASCII alphanumerics, `-` and `_` only.
pub fn validate_content_id(content_id: &str) -> Result<(), ConvertError> {
    let valid = !content_id.is_empty()
        && content_id.len() <= 64
        && content_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConvertError::InvalidId(content_id.to_string()))
    }
}

/// Downloads documents over HTTP from a URL template containing `{id}`.
#[derive(Debug, Clone)]
pub struct HttpArtifactSource {
    client: Client,
    url_template: String,
    timeout: Duration,
}

impl HttpArtifactSource {
    pub fn new(client: Client, url_template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url_template: url_template.into(),
            timeout,
        }
    }

    pub fn url_for(&self, content_id: &str) -> String {
        self.url_template.replace("{id}", content_id)
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    #[instrument(level = "info", skip_all, fields(%content_id))]
    async fn download(&self, content_id: &str) -> Result<Vec<u8>, ConvertError> {
        let url = self.url_for(content_id);
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConvertError::Timeout(self.timeout)
                } else {
                    ConvertError::Download(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ConvertError::Download(format!("{url} answered {status}")));
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.contains("pdf") {
            warn!(%url, %content_type, "Download is not labelled as PDF");
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ConvertError::Download(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ConvertError::Empty);
        }
        info!(bytes = bytes.len(), "Downloaded artifact");
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct ConvertPolicy {
    /// Fast-path yield below this many characters triggers the fallback.
    pub min_chars: usize,
    /// Bound on download plus extraction.
    pub timeout: Duration,
    pub ttl: Duration,
    pub capacity: usize,
}

struct Inner {
    source: Arc<dyn ArtifactSource>,
    fast: Arc<dyn Extractor>,
    fallback: Option<Arc<dyn Extractor>>,
    cache: TtlCache<String, Artifact>,
    flight: SingleFlight<String, Artifact, ConvertError>,
    policy: ConvertPolicy,
}

#[derive(Clone)]
pub struct ArtifactConverter {
    inner: Arc<Inner>,
}

impl ArtifactConverter {
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        fast: Arc<dyn Extractor>,
        fallback: Option<Arc<dyn Extractor>>,
        policy: ConvertPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                fast,
                fallback,
                cache: TtlCache::new("artifacts", policy.ttl, policy.capacity),
                flight: SingleFlight::new(),
                policy,
            }),
        }
    }

    pub fn cached(&self, content_id: &str) -> Option<Artifact> {
        self.inner.cache.get(&content_id.to_string())
    }

    /// Download and convert `content_id`, serving repeats from the cache.
    #[instrument(level = "info", skip_all, fields(%content_id))]
    pub async fn convert(&self, content_id: &str) -> Result<Artifact, ConvertError> {
        validate_content_id(content_id)?;
        if let Some(hit) = self.cached(content_id) {
            info!("Artifact cache hit");
            return Ok(hit);
        }

        let this = self.clone();
        let id = content_id.to_string();
        let limit = self.inner.policy.timeout;
        self.inner
            .flight
            .run(content_id.to_string(), move || async move {
                tokio::time::timeout(limit, this.download_and_convert(&id))
                    .await
                    .map_err(|_| ConvertError::Timeout(limit))?
            })
            .await
    }

    async fn download_and_convert(&self, content_id: &str) -> Result<Artifact, ConvertError> {
        if let Some(hit) = self.cached(content_id) {
            return Ok(hit);
        }
        let bytes = self.inner.source.download(content_id).await?;
        self.convert_bytes(content_id, &bytes).await
    }

    /// Convert raw bytes already at hand. Successful results are cached under
    /// `content_id`, except a low-yield fast-path result kept only because
    /// the fallback failed.
    pub async fn convert_bytes(&self, content_id: &str, bytes: &[u8]) -> Result<Artifact, ConvertError> {
        if bytes.is_empty() {
            return Err(ConvertError::Empty);
        }
        let policy = &self.inner.policy;
        let t0 = Instant::now();

        let fast_text = match self.inner.fast.extract(bytes).await {
            Ok(text) => text,
            Err(e) => {
                warn!(extractor = self.inner.fast.name(), error = %e, "Fast extraction failed");
                String::new()
            }
        };
        let fast_chars = fast_text.trim().chars().count();

        if fast_chars >= policy.min_chars {
            let artifact = Artifact {
                content_id: content_id.to_string(),
                text: fast_text,
                source_method: SourceMethod::DirectExtraction,
            };
            self.inner.cache.insert(content_id.to_string(), artifact.clone());
            info!(
                chars = fast_chars,
                elapsed_ms = t0.elapsed().as_millis() as u64,
                "Converted with direct extraction"
            );
            return Ok(artifact);
        }

        info!(chars = fast_chars, threshold = policy.min_chars, "Low text yield; trying fallback");
        let direct = |text: String| Artifact {
            content_id: content_id.to_string(),
            text,
            source_method: SourceMethod::DirectExtraction,
        };

        let Some(fallback) = &self.inner.fallback else {
            return if fast_chars > 0 {
                Ok(direct(fast_text))
            } else {
                Err(ConvertError::CapabilityUnavailable(
                    "no fallback extractor configured".to_string(),
                ))
            };
        };

        match fallback.extract(bytes).await {
            Ok(text) if !text.trim().is_empty() => {
                let artifact = Artifact {
                    content_id: content_id.to_string(),
                    text,
                    source_method: SourceMethod::FallbackExtraction,
                };
                self.inner.cache.insert(content_id.to_string(), artifact.clone());
                info!(
                    extractor = fallback.name(),
                    chars = artifact.text.chars().count(),
                    elapsed_ms = t0.elapsed().as_millis() as u64,
                    "Converted with fallback extraction"
                );
                Ok(artifact)
            }
            Ok(_) if fast_chars > 0 => Ok(direct(fast_text)),
            Ok(_) => Err(ConvertError::Extraction("no text could be extracted".to_string())),
            Err(e) if fast_chars > 0 => {
                warn!(extractor = fallback.name(), error = %e, "Fallback failed; returning low-yield text");
                Ok(direct(fast_text))
            }
            Err(CapabilityError::NotConfigured(what)) => Err(ConvertError::CapabilityUnavailable(
                format!("{what} is not configured"),
            )),
            Err(e) => Err(ConvertError::Extraction(e.to_string())),
        }
    }
}
