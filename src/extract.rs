//! Text extractors: the in-process PDF fast path and the OCR fallback.

use crate::error::CapabilityError;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Turns document bytes into text.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, bytes: &[u8]) -> Result<String, CapabilityError>;
}

/// Reads the text layer of a PDF with `pdf-extract`.
#[derive(Debug, Default, Clone)]
pub struct PdfTextExtractor;

#[async_trait]
impl Extractor for PdfTextExtractor {
    fn name(&self) -> &str {
        "pdf-text"
    }

    async fn extract(&self, bytes: &[u8]) -> Result<String, CapabilityError> {
        let owned = bytes.to_vec();
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&owned))
            .await
            .map_err(|e| CapabilityError::Transport(format!("extraction task aborted: {e}")))?
            .map_err(|e| CapabilityError::Rejected(format!("unreadable PDF: {e}")))
    }
}

pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai";
pub const MISTRAL_OCR_MODEL: &str = "mistral-ocr-latest";

#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    model: &'a str,
    document: OcrDocument,
}

#[derive(Debug, Serialize)]
struct OcrDocument {
    #[serde(rename = "type")]
    kind: &'static str,
    document_url: String,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    pages: Vec<OcrPage>,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    #[serde(default)]
    markdown: String,
}

/// Mistral OCR over HTTP. The document travels inline as a base64 data URL.
#[derive(Debug, Clone)]
pub struct MistralOcr {
    http: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl MistralOcr {
    pub fn new(http: Client, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: MISTRAL_BASE_URL.to_string(),
            model: MISTRAL_OCR_MODEL.to_string(),
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Extractor for MistralOcr {
    fn name(&self) -> &str {
        "mistral-ocr"
    }

    #[instrument(level = "info", skip_all, fields(bytes = bytes.len()))]
    async fn extract(&self, bytes: &[u8]) -> Result<String, CapabilityError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(CapabilityError::NotConfigured("MISTRAL_API_KEY".to_string()));
        };
        let t0 = Instant::now();
        let request = OcrRequest {
            model: &self.model,
            document: OcrDocument {
                kind: "document_url",
                document_url: format!("data:application/pdf;base64,{}", STANDARD.encode(bytes)),
            },
        };

        let resp = self
            .http
            .post(format!("{}/v1/ocr", self.base_url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CapabilityError::Timeout(self.timeout)
                } else {
                    CapabilityError::from(e)
                }
            })?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(CapabilityError::Transport(format!("OCR answered {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %body, "OCR request rejected");
            return Err(CapabilityError::Rejected(format!("OCR answered {status}")));
        }

        let parsed: OcrResponse = resp
            .json()
            .await
            .map_err(|e| CapabilityError::Rejected(format!("malformed OCR response: {e}")))?;
        let pages = parsed.pages.len();
        let text = parsed
            .pages
            .into_iter()
            .map(|p| p.markdown)
            .collect::<Vec<_>>()
            .join("\n\n");
        info!(
            pages,
            chars = text.chars().count(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "OCR finished"
        );
        Ok(text)
    }
}
