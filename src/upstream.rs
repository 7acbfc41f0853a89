//! HTTP page source replaying a session's cookies against the site.

use crate::error::TaskFailure;
use crate::fetch::PageSource;
use crate::models::{FetchResult, FetchTask, FetchedPage};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, REFERER};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Fetches pages with plain HTTP, classifying challenge responses as
/// session rejections.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    client: Client,
    challenge_marker: String,
    /// Lowercase body fragments that mean the request hit the gate.
    block_markers: Vec<String>,
    accept_language: String,
    request_timeout: Duration,
}

impl HttpPageSource {
    pub fn new(
        client: Client,
        challenge_marker: impl Into<String>,
        block_markers: Vec<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            challenge_marker: challenge_marker.into(),
            block_markers: block_markers.into_iter().map(|m| m.to_lowercase()).collect(),
            accept_language: "tr-TR,tr;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
            request_timeout,
        }
    }

    fn is_blocked(&self, body: &str) -> bool {
        let body = body.to_lowercase();
        self.block_markers.iter().any(|m| body.contains(m.as_str()))
    }

    fn classify(&self, e: reqwest::Error) -> TaskFailure {
        if e.is_timeout() {
            TaskFailure::Timeout(self.request_timeout)
        } else {
            TaskFailure::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    #[instrument(level = "debug", skip_all, fields(url = %task.target.url))]
    async fn fetch(&self, task: &FetchTask) -> FetchResult {
        let mut req = self
            .client
            .get(&task.target.url)
            .timeout(self.request_timeout)
            .header(ACCEPT, ACCEPT_HTML)
            .header(ACCEPT_LANGUAGE, &self.accept_language);
        if let Some(cookies) = task.session.cookie_header() {
            req = req.header(COOKIE, cookies);
        }
        for (name, value) in &task.session.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(referer) = &task.target.referer {
            req = req.header(REFERER, referer);
        }

        let resp = req.send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!(%final_url, "Upstream answered 401");
            return Err(TaskFailure::SessionRejected);
        }
        if final_url.contains(&self.challenge_marker) {
            warn!(%final_url, "Redirected to the challenge page");
            return Err(TaskFailure::SessionRejected);
        }

        let body = resp.text().await.map_err(|e| self.classify(e))?;
        if self.is_blocked(&body) {
            warn!(%final_url, status = status.as_u16(), "Response carries the challenge gate");
            return Err(TaskFailure::SessionRejected);
        }
        if !status.is_success() {
            return Err(TaskFailure::Status(status.as_u16()));
        }

        debug!(status = status.as_u16(), bytes = body.len(), "Fetched page");
        Ok(FetchedPage {
            url: task.target.url.clone(),
            final_url,
            status: status.as_u16(),
            body,
        })
    }
}
