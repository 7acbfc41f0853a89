//! Browser automation abstraction.
//!
//! The solver and the slot pool only ever see these two traits, so the
//! Chromium adapter in [`chromium`] can be swapped for an in-process fake in
//! tests.

pub mod chromium;

use crate::error::AutomationError;
use crate::models::Cookie;
use async_trait::async_trait;
use std::time::Duration;

/// Something that can create fresh automation contexts.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    /// Launch a new context. Called lazily by the pool.
    async fn launch(&self) -> Result<Box<dyn PageContext>, AutomationError>;
}

/// One live automation context (a browser tab with its own cookie jar).
#[async_trait]
pub trait PageContext: Send + Sync {
    /// Navigate and wait for the load, bounded by `timeout`.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), AutomationError>;

    async fn current_url(&self) -> Result<String, AutomationError>;

    /// Serialized DOM of the current document.
    async fn content(&self) -> Result<String, AutomationError>;

    /// Run a script and return its JSON result (`Null` for `undefined`).
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, AutomationError>;

    async fn cookies(&self) -> Result<Vec<Cookie>, AutomationError>;

    /// User agent the context presents; sessions must replay it.
    fn user_agent(&self) -> Option<String>;

    async fn close(self: Box<Self>);
}
