//! Runtime settings.
//!
//! Every field has a default, so an absent or partial `config.yaml` is fine.
//! Durations are plain integers with the unit in the key name, which keeps
//! the YAML readable:
//!
//! ```yaml
//! pool:
//!   capacity: 3
//! fetch:
//!   parallelism: 2
//!   detail_pacing_ms: { min: 1000, max: 2500 }
//! session:
//!   mirror_path: /var/lib/dergipark/cookies_persistent.json
//! ```
//!
//! Secrets never live here; they come from flags or the environment
//! (see [`Secrets`]).

use crate::convert::ConvertPolicy;
use crate::error::ConfigError;
use crate::fetch::{FetchPolicy, Pacing};
use crate::retry::Backoff;
use crate::scrapers::dergipark::{
    ARTIFACT_URL_TEMPLATE, ARTICLE_SECTION_LINK, ARTICLE_SECTION_MARKER, CHALLENGE_MARKER,
    SITE_BASE,
};
use crate::session::SessionPolicy;
use crate::solver::{PostSolveAction, submit_script};
use crate::solver::token::TokenTiming;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

/// API keys for the external capabilities.
#[derive(Clone, Default)]
pub struct Secrets {
    pub capsolver_api_key: Option<String>,
    pub mistral_api_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("capsolver_api_key", &self.capsolver_api_key.as_ref().map(|_| "<set>"))
            .field("mistral_api_key", &self.mistral_api_key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PacingMs {
    pub min: u64,
    pub max: u64,
}

impl From<PacingMs> for Pacing {
    fn from(p: PacingMs) -> Self {
        Pacing::new(Duration::from_millis(p.min), Duration::from_millis(p.max))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    pub base_url: String,
    /// Page loaded to trigger and pass the challenge.
    pub entry_url: String,
    pub cookie_domain: String,
    pub challenge_marker: String,
    /// Body fragments (case-insensitive) meaning a fetch hit the gate.
    pub block_markers: Vec<String>,
    pub artifact_url_template: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            base_url: SITE_BASE.to_string(),
            entry_url: format!("{SITE_BASE}/tr/search?q=%2A&section=article"),
            cookie_domain: "dergipark.org.tr".to_string(),
            challenge_marker: CHALLENGE_MARKER.to_string(),
            block_markers: vec![
                "cf-turnstile".to_string(),
                "g-recaptcha".to_string(),
                "search_verification".to_string(),
                "erişim engellendi".to_string(),
            ],
            artifact_url_template: ARTIFACT_URL_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub ttl_secs: u64,
    /// `None` disables the durable mirror.
    pub mirror_path: Option<PathBuf>,
    /// Extra slot-lease attempts after a pool timeout.
    pub acquire_retries: usize,
    pub navigation_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 1800,
            mirror_path: Some(PathBuf::from("cookies_persistent.json")),
            acquire_retries: 2,
            navigation_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub capacity: usize,
    pub acquire_timeout_secs: u64,
    pub launch_timeout_secs: u64,
    /// Path to a Chromium binary; autodetected when unset.
    pub chromium_path: Option<PathBuf>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            acquire_timeout_secs: 60,
            launch_timeout_secs: 30,
            chromium_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Try the self-passing widget flow before paying for a token.
    pub interactive: bool,
    pub interactive_timeout_secs: u64,
    pub auto_pass_wait_secs: u64,
    pub token_timeout_secs: u64,
    pub settle_ms: u64,
    pub post_submit_ms: u64,
    pub poll_interval_ms: u64,
    pub max_polls: usize,
    /// Retries of transient token-service failures.
    pub token_retries: usize,
    pub post_solve_settle_ms: u64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            interactive: true,
            interactive_timeout_secs: 20,
            auto_pass_wait_secs: 5,
            token_timeout_secs: 150,
            settle_ms: 2000,
            post_submit_ms: 3000,
            poll_interval_ms: 2000,
            max_polls: 60,
            token_retries: 2,
            post_solve_settle_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub parallelism: usize,
    pub detail_pacing_ms: PacingMs,
    pub listing_pacing_ms: PacingMs,
    pub request_timeout_secs: u64,
    pub index_timeout_secs: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            parallelism: 3,
            detail_pacing_ms: PacingMs { min: 800, max: 1800 },
            listing_pacing_ms: PacingMs { min: 1500, max: 3000 },
            request_timeout_secs: 30,
            index_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub result_ttl_secs: u64,
    pub result_capacity: usize,
    pub artifact_ttl_secs: u64,
    pub artifact_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            result_ttl_secs: 600,
            result_capacity: 100,
            artifact_ttl_secs: 86_400,
            artifact_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvertSettings {
    /// Fast-path yield below this many characters triggers OCR.
    pub min_chars: usize,
    pub timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub ocr_timeout_secs: u64,
}

impl Default for ConvertSettings {
    fn default() -> Self {
        Self {
            min_chars: 100,
            timeout_secs: 180,
            download_timeout_secs: 60,
            ocr_timeout_secs: 120,
        }
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub site: SiteSettings,
    pub session: SessionSettings,
    pub pool: PoolSettings,
    pub solver: SolverSettings,
    pub fetch: FetchSettings,
    pub cache: CacheSettings,
    pub convert: ConvertSettings,
    /// Bound on one whole caller request.
    pub caller_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            site: SiteSettings::default(),
            session: SessionSettings::default(),
            pool: PoolSettings::default(),
            solver: SolverSettings::default(),
            fetch: FetchSettings::default(),
            cache: CacheSettings::default(),
            convert: ConvertSettings::default(),
            caller_timeout_secs: 300,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// the resulting settings are inconsistent.
    #[instrument(level = "info", skip_all, fields(path = ?path))]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            None => Settings::default(),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
        };
        settings.validate()?;
        info!(
            pool = settings.pool.capacity,
            parallelism = settings.fetch.parallelism,
            mirror = ?settings.session.mirror_path,
            "Loaded configuration"
        );
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.pool.capacity == 0 {
            return invalid("pool.capacity must be at least 1");
        }
        if self.fetch.parallelism == 0 {
            return invalid("fetch.parallelism must be at least 1");
        }
        for (name, p) in [
            ("fetch.detail_pacing_ms", self.fetch.detail_pacing_ms),
            ("fetch.listing_pacing_ms", self.fetch.listing_pacing_ms),
        ] {
            if p.min > p.max {
                return Err(ConfigError::Invalid(format!("{name}: min exceeds max")));
            }
        }
        if self.session.ttl_secs == 0 {
            return invalid("session.ttl_secs must be positive");
        }
        if self.cache.result_capacity == 0 || self.cache.artifact_capacity == 0 {
            return invalid("cache capacities must be at least 1");
        }
        if !self.site.artifact_url_template.contains("{id}") {
            return invalid("site.artifact_url_template must contain {id}");
        }
        if self.site.challenge_marker.trim().is_empty() {
            return invalid("site.challenge_marker must not be empty");
        }
        Ok(())
    }

    pub fn caller_timeout(&self) -> Duration {
        Duration::from_secs(self.caller_timeout_secs)
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.acquire_timeout_secs)
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            entry_url: self.site.entry_url.clone(),
            cookie_domain: self.site.cookie_domain.clone(),
            ttl: Duration::from_secs(self.session.ttl_secs),
            pool_timeout: self.pool_acquire_timeout(),
            navigation_timeout: Duration::from_secs(self.session.navigation_timeout_secs),
            pool_retries: self.session.acquire_retries,
            backoff: Backoff::default(),
        }
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            parallelism: self.fetch.parallelism,
            detail_pacing: self.fetch.detail_pacing_ms.into(),
            listing_pacing: self.fetch.listing_pacing_ms.into(),
            task_timeout: Duration::from_secs(self.fetch.request_timeout_secs),
        }
    }

    /// Journal index pages get their own, shorter bound.
    pub fn index_fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            task_timeout: Duration::from_secs(self.fetch.index_timeout_secs),
            ..self.fetch_policy()
        }
    }

    pub fn convert_policy(&self) -> ConvertPolicy {
        ConvertPolicy {
            min_chars: self.convert.min_chars,
            timeout: Duration::from_secs(self.convert.timeout_secs),
            ttl: Duration::from_secs(self.cache.artifact_ttl_secs),
            capacity: self.cache.artifact_capacity,
        }
    }

    pub fn token_timing(&self) -> TokenTiming {
        TokenTiming {
            timeout: Duration::from_secs(self.solver.token_timeout_secs),
            settle: Duration::from_millis(self.solver.settle_ms),
            post_submit: Duration::from_millis(self.solver.post_submit_ms),
        }
    }

    pub fn token_backoff(&self) -> Backoff {
        Backoff {
            max_retries: self.solver.token_retries,
            ..Backoff::default()
        }
    }

    /// Activate the article tab of the search page after solving.
    pub fn post_solve_action(&self) -> PostSolveAction {
        PostSolveAction {
            url_marker: ARTICLE_SECTION_MARKER.to_string(),
            script: submit_script(ARTICLE_SECTION_LINK),
            settle: Duration::from_millis(self.solver.post_solve_settle_ms),
        }
    }
}
