//! CapSolver client implementing [`TokenSolver`].
//!
//! The service is asynchronous: `createTask` returns a task id, and the
//! token is collected by polling `getTaskResult`. Polling is bounded by
//! `max_polls`; exhausting it is a [`CapabilityError::Timeout`].

use super::token::TokenSolver;
use crate::error::CapabilityError;
use crate::models::ChallengeKind;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.capsolver.com";

#[derive(Debug, Serialize)]
struct CreateTaskRequest<'a> {
    #[serde(rename = "clientKey")]
    client_key: &'a str,
    task: TaskSpec<'a>,
}

#[derive(Debug, Serialize)]
struct TaskSpec<'a> {
    #[serde(rename = "type")]
    task_type: &'static str,
    #[serde(rename = "websiteURL")]
    website_url: &'a str,
    #[serde(rename = "websiteKey")]
    website_key: &'a str,
}

#[derive(Debug, Serialize)]
struct TaskResultRequest<'a> {
    #[serde(rename = "clientKey")]
    client_key: &'a str,
    #[serde(rename = "taskId")]
    task_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(rename = "errorId", default)]
    error_id: i64,
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorDescription", default)]
    error_description: Option<String>,
    #[serde(rename = "taskId", default)]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<Solution>,
}

#[derive(Debug, Default, Deserialize)]
struct Solution {
    #[serde(default)]
    token: Option<String>,
    #[serde(rename = "gRecaptchaResponse", default)]
    g_recaptcha_response: Option<String>,
}

impl Solution {
    fn into_token(self) -> Option<String> {
        self.token
            .or(self.g_recaptcha_response)
            .filter(|t| !t.is_empty())
    }
}

impl ApiResponse {
    fn error(&self) -> Option<String> {
        if self.error_id != 0 || self.status.as_deref() == Some("failed") {
            Some(
                self.error_description
                    .clone()
                    .or_else(|| self.error_code.clone())
                    .unwrap_or_else(|| format!("errorId {}", self.error_id)),
            )
        } else {
            None
        }
    }
}

/// Task type requested for each widget family.
pub fn task_type(kind: ChallengeKind) -> &'static str {
    match kind {
        ChallengeKind::TokenChallenge => "AntiTurnstileTaskProxyLess",
        ChallengeKind::InteractiveChallenge => "ReCaptchaV2TaskProxyLess",
    }
}

#[derive(Debug, Clone)]
pub struct CapSolverClient {
    http: Client,
    api_key: Option<String>,
    base_url: String,
    poll_interval: Duration,
    max_polls: usize,
}

impl CapSolverClient {
    pub fn new(http: Client, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(2),
            max_polls: 60,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: usize) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<ApiResponse, CapabilityError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let resp = self.http.post(&url).json(body).send().await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(CapabilityError::Transport(format!("{endpoint} answered {status}")));
        }
        let parsed: ApiResponse = resp
            .json()
            .await
            .map_err(|e| CapabilityError::Rejected(format!("{endpoint} returned malformed JSON: {e}")))?;
        if let Some(reason) = parsed.error() {
            return Err(CapabilityError::Rejected(reason));
        }
        if !status.is_success() {
            return Err(CapabilityError::Rejected(format!("{endpoint} answered {status}")));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl TokenSolver for CapSolverClient {
    #[instrument(level = "info", skip_all, fields(kind = ?kind, %page_url))]
    async fn solve(
        &self,
        site_key: &str,
        page_url: &str,
        kind: ChallengeKind,
    ) -> Result<String, CapabilityError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(CapabilityError::NotConfigured("CAPSOLVER_API_KEY".to_string()));
        };

        let created = self
            .post(
                "createTask",
                &CreateTaskRequest {
                    client_key: api_key,
                    task: TaskSpec {
                        task_type: task_type(kind),
                        website_url: page_url,
                        website_key: site_key,
                    },
                },
            )
            .await?;

        if created.status.as_deref() == Some("ready") {
            if let Some(token) = created.solution.and_then(Solution::into_token) {
                info!("CapSolver answered synchronously");
                return Ok(token);
            }
            return Err(CapabilityError::Rejected("ready task without a token".to_string()));
        }
        let Some(task_id) = created.task_id else {
            return Err(CapabilityError::Rejected("createTask returned no taskId".to_string()));
        };
        info!(%task_id, "CapSolver task created");

        for poll in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            let result = self
                .post(
                    "getTaskResult",
                    &TaskResultRequest {
                        client_key: api_key,
                        task_id: &task_id,
                    },
                )
                .await;
            let result = match result {
                Ok(r) => r,
                Err(e) if e.is_transient() => {
                    warn!(poll, error = %e, "CapSolver poll failed; polling again");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match result.status.as_deref() {
                Some("ready") => {
                    return result
                        .solution
                        .and_then(Solution::into_token)
                        .inspect(|_| info!(poll, "CapSolver task ready"))
                        .ok_or_else(|| CapabilityError::Rejected("ready task without a token".to_string()));
                }
                other => debug!(poll, status = ?other, "CapSolver task pending"),
            }
        }

        Err(CapabilityError::Timeout(
            self.poll_interval.saturating_mul(self.max_polls as u32),
        ))
    }
}
