//! Interactive strategy: let something drive the page itself until the
//! widget lets it through.

use super::{SolvingStrategy, submit_script};
use crate::automation::PageContext;
use crate::error::StrategyError;
use crate::models::{ChallengeDescriptor, ProofToken};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Capability that can satisfy a challenge by interacting with the page.
#[async_trait]
pub trait InteractiveSolver: Send + Sync {
    async fn interact(
        &self,
        page: &dyn PageContext,
        challenge: &ChallengeDescriptor,
    ) -> Result<(), StrategyError>;
}

/// Tried first when configured; reports `NotConfigured` otherwise.
pub struct InteractiveStrategy {
    solver: Option<Arc<dyn InteractiveSolver>>,
    timeout: Duration,
}

impl InteractiveStrategy {
    pub fn new(solver: Option<Arc<dyn InteractiveSolver>>, timeout: Duration) -> Self {
        Self { solver, timeout }
    }
}

#[async_trait]
impl SolvingStrategy for InteractiveStrategy {
    fn name(&self) -> &str {
        "interactive"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(level = "info", skip_all, fields(kind = ?challenge.kind))]
    async fn attempt(
        &self,
        page: &dyn PageContext,
        challenge: &ChallengeDescriptor,
    ) -> Result<ProofToken, StrategyError> {
        let Some(solver) = &self.solver else {
            return Err(StrategyError::NotConfigured("interactive solver".to_string()));
        };
        solver.interact(page, challenge).await?;
        Ok(ProofToken {
            kind: challenge.kind,
            strategy: self.name().to_string(),
            token: None,
        })
    }
}

/// Waits for a managed widget to pass on its own, then submits the
/// verification form.
#[derive(Debug, Clone)]
pub struct AutoPassSolver {
    wait: Duration,
    submit_selector: String,
    post_submit: Duration,
}

impl AutoPassSolver {
    pub fn new(wait: Duration, submit_selector: impl Into<String>, post_submit: Duration) -> Self {
        Self {
            wait,
            submit_selector: submit_selector.into(),
            post_submit,
        }
    }
}

#[async_trait]
impl InteractiveSolver for AutoPassSolver {
    async fn interact(
        &self,
        page: &dyn PageContext,
        _challenge: &ChallengeDescriptor,
    ) -> Result<(), StrategyError> {
        debug!(wait_ms = self.wait.as_millis() as u64, "Waiting for widget to self-clear");
        tokio::time::sleep(self.wait).await;
        match page.evaluate(&submit_script(&self.submit_selector)).await? {
            serde_json::Value::Bool(true) => {
                tokio::time::sleep(self.post_submit).await;
                Ok(())
            }
            _ => Err(StrategyError::Failed(format!(
                "submit control {} not found",
                self.submit_selector
            ))),
        }
    }
}
