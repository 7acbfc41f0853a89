//! Durable session mirror.
//!
//! A single JSON record `{session, acquired_at, expires_at}` written after
//! every successful acquisition and read once at startup. Missing, corrupt
//! or stale files are never fatal: they are discarded and the session is
//! re-acquired on first demand.
//!
//! Writes go to a sibling temp file that is then renamed over the target,
//! so a crash mid-write leaves either the old record or the new one.

use crate::models::Session;
use crate::utils::ensure_parent_dir;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Serialized form of the mirror file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub session: Session,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MirrorRecord {
    pub fn new(session: &Session) -> Self {
        Self {
            session: session.clone(),
            acquired_at: session.acquired_at,
            expires_at: session.expires_at,
        }
    }

    /// A record is usable iff it is younger than `ttl` and not past its own
    /// expiry.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return now < self.expires_at;
        };
        now < self.expires_at && now - self.acquired_at < ttl
    }
}

#[derive(Debug, Clone)]
pub struct SessionMirror {
    path: PathBuf,
}

impl SessionMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the mirrored session if it is still fresh; otherwise delete the
    /// file and return `None`.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display()))]
    pub async fn load(&self, ttl: Duration) -> Option<Session> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No session mirror on disk");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Session mirror unreadable");
                return None;
            }
        };

        let record: MirrorRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Session mirror corrupt; discarding");
                self.remove().await;
                return None;
            }
        };

        let now = Utc::now();
        if !record.is_fresh_at(now, ttl) {
            info!(
                acquired_at = %record.acquired_at,
                expires_at = %record.expires_at,
                "Session mirror stale; discarding"
            );
            self.remove().await;
            return None;
        }

        info!(expires_at = %record.expires_at, "Restored session from mirror");
        Some(Session {
            acquired_at: record.acquired_at,
            expires_at: record.expires_at,
            ..record.session
        })
    }

    /// Persist `session`. Failures are returned so the caller can log them;
    /// the in-memory session stays authoritative either way.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display()))]
    pub async fn store(&self, session: &Session) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(&MirrorRecord::new(session))?;
        ensure_parent_dir(&self.path).await?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        info!(expires_at = %session.expires_at, "Wrote session mirror");
        Ok(())
    }

    pub async fn remove(&self) {
        match fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed session mirror"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove session mirror"),
        }
    }
}
