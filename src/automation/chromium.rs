//! Chromium automation backend on `chromiumoxide`.
//!
//! Every slot gets its own browser process so cookie jars never leak between
//! slots and tearing down an unhealthy slot really frees its resources.

use super::{AutomationBackend, PageContext};
use crate::error::AutomationError;
use crate::models::Cookie;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::rng;
use rand::seq::IndexedRandom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36 Edg/122.0.0.0",
];

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Launches headless (or headed) Chromium instances.
#[derive(Debug, Clone)]
pub struct ChromiumBackend {
    headless: bool,
    executable: Option<PathBuf>,
    language: String,
}

impl ChromiumBackend {
    pub fn new(headless: bool, executable: Option<PathBuf>) -> Self {
        Self {
            headless,
            executable,
            language: "tr-TR".to_string(),
        }
    }

    fn config(&self, user_agent: &str) -> Result<BrowserConfig, AutomationError> {
        let mut builder = BrowserConfig::builder()
            .arg(format!("--user-agent={user_agent}"))
            .arg(format!("--lang={}", self.language))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");
        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        builder.build().map_err(AutomationError::Browser)
    }
}

#[async_trait]
impl AutomationBackend for ChromiumBackend {
    #[instrument(level = "info", skip_all, fields(headless = self.headless))]
    async fn launch(&self) -> Result<Box<dyn PageContext>, AutomationError> {
        let user_agent = USER_AGENTS
            .choose(&mut rng())
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string();
        let config = self.config(&user_agent)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AutomationError::Browser(e.to_string()))?;

        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "Browser handler event error");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                events.abort();
                return Err(AutomationError::Browser(e.to_string()));
            }
        };

        info!("Launched Chromium context");
        Ok(Box::new(ChromiumContext {
            browser: Mutex::new(browser),
            page,
            events,
            user_agent,
        }))
    }
}

/// One Chromium process with a single tab.
pub struct ChromiumContext {
    browser: Mutex<Browser>,
    page: Page,
    events: JoinHandle<()>,
    user_agent: String,
}

#[async_trait]
impl PageContext for ChromiumContext {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), AutomationError> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(AutomationError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(AutomationError::Timeout(timeout)),
        }
    }

    async fn current_url(&self) -> Result<String, AutomationError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| AutomationError::Browser(e.to_string()))?;
        Ok(url.unwrap_or_default())
    }

    async fn content(&self) -> Result<String, AutomationError> {
        self.page
            .content()
            .await
            .map_err(|e| AutomationError::Browser(e.to_string()))
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, AutomationError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| AutomationError::Script(e.to_string()))?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, AutomationError> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|e| AutomationError::Browser(e.to_string()))?;
        Ok(cookies
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
            })
            .collect())
    }

    fn user_agent(&self) -> Option<String> {
        Some(self.user_agent.clone())
    }

    async fn close(self: Box<Self>) {
        let ChromiumContext {
            browser,
            page,
            events,
            ..
        } = *self;
        let mut browser = browser.into_inner();
        let shutdown = async {
            if let Err(e) = page.close().await {
                debug!(error = %e, "Page close failed");
            }
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Browser close failed");
            }
            let _ = browser.wait().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            // Dropping the handle kills the child process.
            warn!(timeout = ?CLOSE_TIMEOUT, "Chromium did not exit in time; dropping it");
        }
        events.abort();
        debug!("Closed Chromium context");
    }
}
