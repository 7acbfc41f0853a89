//! Token strategy: obtain a proof token from an external solving service,
//! write it into the widget's response field and submit.

use super::{SolvingStrategy, inject_token_script, submit_script};
use crate::automation::PageContext;
use crate::error::{CapabilityError, StrategyError};
use crate::models::{ChallengeDescriptor, ChallengeKind, ProofToken};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// External token-solving capability.
#[async_trait]
pub trait TokenSolver: Send + Sync {
    async fn solve(
        &self,
        site_key: &str,
        page_url: &str,
        kind: ChallengeKind,
    ) -> Result<String, CapabilityError>;
}

/// Timing knobs of the token strategy.
#[derive(Debug, Clone)]
pub struct TokenTiming {
    /// Bound on a whole attempt, solving service included.
    pub timeout: Duration,
    /// Wait after injecting, before submitting.
    pub settle: Duration,
    /// Wait after submitting, before the page is re-checked.
    pub post_submit: Duration,
}

pub struct TokenStrategy {
    solver: Option<Arc<dyn TokenSolver>>,
    submit_selector: String,
    timing: TokenTiming,
}

impl TokenStrategy {
    pub fn new(
        solver: Option<Arc<dyn TokenSolver>>,
        submit_selector: impl Into<String>,
        timing: TokenTiming,
    ) -> Self {
        Self {
            solver,
            submit_selector: submit_selector.into(),
            timing,
        }
    }
}

#[async_trait]
impl SolvingStrategy for TokenStrategy {
    fn name(&self) -> &str {
        "token"
    }

    fn timeout(&self) -> Duration {
        self.timing.timeout
    }

    #[instrument(level = "info", skip_all, fields(kind = ?challenge.kind))]
    async fn attempt(
        &self,
        page: &dyn PageContext,
        challenge: &ChallengeDescriptor,
    ) -> Result<ProofToken, StrategyError> {
        let Some(solver) = &self.solver else {
            return Err(StrategyError::NotConfigured("token solver".to_string()));
        };
        let Some(site_key) = challenge.site_key.as_deref() else {
            return Err(StrategyError::Failed(
                "challenge page exposes no site key".to_string(),
            ));
        };

        let token = solver
            .solve(site_key, &challenge.page_url, challenge.kind)
            .await
            .map_err(|e| match e {
                CapabilityError::NotConfigured(what) => StrategyError::NotConfigured(what),
                other => StrategyError::Failed(other.to_string()),
            })?;
        debug!(token = %truncate_for_log(&token, 24), "Received proof token");

        let injected = page
            .evaluate(&inject_token_script(challenge.kind, &token))
            .await?;
        if injected != serde_json::Value::Bool(true) {
            return Err(StrategyError::Failed(format!(
                "response field {} not found",
                challenge.kind.response_field()
            )));
        }

        tokio::time::sleep(self.timing.settle).await;

        match page.evaluate(&submit_script(&self.submit_selector)).await? {
            serde_json::Value::Bool(true) => info!("Submitted verification form"),
            _ => warn!(selector = %self.submit_selector, "Submit button not found; relying on widget callback"),
        }
        tokio::time::sleep(self.timing.post_submit).await;

        Ok(ProofToken {
            kind: challenge.kind,
            strategy: self.name().to_string(),
            token: Some(token),
        })
    }
}
