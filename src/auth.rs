//! Session tokens that gate authenticated replay.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::write_atomic;
use crate::time::now_ms;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry in epoch milliseconds. `None` means the server did not say.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Session {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        !self.access_token.trim().is_empty() && self.expires_at.map_or(true, |at| at > now_ms)
    }
}

#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_tokens(&self) -> AppResult<Option<Session>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AppError::from(err).with_context("path", self.display())),
        };
        let session = serde_json::from_slice(&bytes).map_err(|err| {
            AppError::new("AUTH/CORRUPT_SESSION", "Stored session could not be read")
                .with_context("path", self.display())
                .with_cause(err)
        })?;
        Ok(Some(session))
    }

    pub fn save_tokens(&self, session: &Session) -> AppResult<()> {
        let json = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.path, &json)?;
        tracing::info!(target: "fieldsync", event = "session_saved");
        Ok(())
    }

    /// Returns `true` if a session file was removed.
    pub fn clear_tokens(&self) -> AppResult<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(target: "fieldsync", event = "session_cleared");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(AppError::from(err).with_context("path", self.display())),
        }
    }

    /// A session exists and has not expired. Unreadable session files count
    /// as no session.
    pub fn has_valid_session(&self) -> bool {
        match self.load_tokens() {
            Ok(Some(session)) => session.is_valid_at(now_ms()),
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(target: "fieldsync", event = "session_unreadable", error = %err);
                false
            }
        }
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }
}
