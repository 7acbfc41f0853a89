//! Error types for every layer of the gate.
//!
//! Each component owns a small `thiserror` enum. Errors that cross a
//! single-flight boundary are `Clone` so one failed acquisition or
//! conversion can be handed to every waiter. [`ErrorKind`] folds all of
//! them into the coarse taxonomy operators see in logs and outcomes.

use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

/// Coarse classification shared by every error in the crate.
///
/// Two different kinds must never be collapsed into one outcome: an
/// upstream defense change (`SolveFailed`) and a missing dependency
/// (`ExternalCapabilityUnavailable`) call for different operator actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No automation slot became free in time. Retryable.
    PoolTimeout,
    /// Every solving strategy failed. Terminal for the request.
    SolveFailed,
    /// Upstream refused the session (401 or redirect back to the challenge).
    SessionRejectedUpstream,
    /// A single fetch failed for page-specific reasons.
    TaskFailed,
    /// A solver, OCR engine or browser is missing or misconfigured.
    ExternalCapabilityUnavailable,
    /// A bounded wait elapsed.
    Timeout,
}

/// Failures of the automation slot pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("no automation slot became free within {0:?}")]
    Timeout(Duration),
    #[error("automation slot could not be created: {0}")]
    Launch(String),
    #[error("automation slot pool is closed")]
    Closed,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Timeout(_) => ErrorKind::PoolTimeout,
            PoolError::Launch(_) | PoolError::Closed => ErrorKind::ExternalCapabilityUnavailable,
        }
    }
}

/// Failures reported by a browser automation context.
#[derive(Debug, Clone, Error)]
pub enum AutomationError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("page script failed: {0}")]
    Script(String),
    #[error("page operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("browser unavailable: {0}")]
    Browser(String),
}

/// Failures of an external capability (token solver, OCR engine).
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("capability rejected the request: {0}")]
    Rejected(String),
    #[error("capability transport error: {0}")]
    Transport(String),
    #[error("capability did not answer within {0:?}")]
    Timeout(Duration),
}

impl CapabilityError {
    /// Transport hiccups and timeouts are worth another try; a rejection or
    /// a missing key is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transport(_) | CapabilityError::Timeout(_))
    }
}

impl From<reqwest::Error> for CapabilityError {
    fn from(e: reqwest::Error) -> Self {
        CapabilityError::Transport(e.to_string())
    }
}

/// Outcome of a single solving strategy attempt.
#[derive(Debug, Clone, Error)]
pub enum StrategyError {
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("strategy timed out after {0:?}")]
    Timeout(Duration),
    #[error("strategy failed: {0}")]
    Failed(String),
    #[error("page still shows the challenge after the attempt")]
    StillChallenged,
}

impl From<AutomationError> for StrategyError {
    fn from(e: AutomationError) -> Self {
        StrategyError::Failed(e.to_string())
    }
}

/// Failures of the challenge solver as a whole.
#[derive(Debug, Clone, Error)]
pub enum SolveError {
    #[error("every solving strategy failed: {}", .attempts.join("; "))]
    Exhausted { attempts: Vec<String> },
    #[error("no solving capability is available: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Automation(#[from] AutomationError),
}

/// Failures of the session acquisition path. Handed to every waiter of the
/// in-flight acquisition.
#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    #[error("challenge could not be solved: {0}")]
    SolveFailed(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("browser failed during acquisition: {0}")]
    Automation(AutomationError),
    #[error("solving capability unavailable: {0}")]
    CapabilityUnavailable(String),
    #[error("timed out waiting for a session after {0:?}")]
    Timeout(Duration),
    #[error("session acquisition aborted: {0}")]
    Aborted(String),
}

impl AcquireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcquireError::SolveFailed(_) => ErrorKind::SolveFailed,
            AcquireError::Pool(e) => e.kind(),
            AcquireError::Automation(_) | AcquireError::Timeout(_) | AcquireError::Aborted(_) => {
                ErrorKind::Timeout
            }
            AcquireError::CapabilityUnavailable(_) => ErrorKind::ExternalCapabilityUnavailable,
        }
    }
}

impl From<SolveError> for AcquireError {
    fn from(e: SolveError) -> Self {
        match e {
            SolveError::Exhausted { .. } => AcquireError::SolveFailed(e.to_string()),
            SolveError::Unavailable(reason) => AcquireError::CapabilityUnavailable(reason),
            SolveError::Automation(inner) => AcquireError::Automation(inner),
        }
    }
}

impl From<AutomationError> for AcquireError {
    fn from(e: AutomationError) -> Self {
        AcquireError::Automation(e)
    }
}

impl From<JoinError> for AcquireError {
    fn from(e: JoinError) -> Self {
        AcquireError::Aborted(e.to_string())
    }
}

/// Per-task failure inside a fetch batch. Never aborts the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskFailure {
    #[error("upstream rejected the session")]
    SessionRejected,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream answered HTTP {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("page is missing expected content: {0}")]
    ParseMiss(String),
    #[error("no valid session: {0}")]
    SessionUnavailable(String),
}

impl TaskFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskFailure::SessionRejected => ErrorKind::SessionRejectedUpstream,
            TaskFailure::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::TaskFailed,
        }
    }
}

/// Failures of the artifact conversion path.
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    #[error("invalid content id {0:?}")]
    InvalidId(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("conversion timed out after {0:?}")]
    Timeout(Duration),
    #[error("downloaded content is empty")]
    Empty,
    #[error("text extraction failed: {0}")]
    Extraction(String),
    #[error("extraction capability unavailable: {0}")]
    CapabilityUnavailable(String),
    #[error("conversion aborted: {0}")]
    Aborted(String),
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::CapabilityUnavailable(_) => ErrorKind::ExternalCapabilityUnavailable,
            ConvertError::Timeout(_) | ConvertError::Aborted(_) => ErrorKind::Timeout,
            _ => ErrorKind::TaskFailed,
        }
    }
}

impl From<JoinError> for ConvertError {
    fn from(e: JoinError) -> Self {
        ConvertError::Aborted(e.to_string())
    }
}

/// Failures while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
