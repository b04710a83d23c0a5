//! Session preflight via `tsh status --format=json`.
//!
//! The tunnels only work with an authenticated session, so `run` and
//! `status` check for one up front. A missing session is surfaced as a
//! warning, never a crash - the supervisors degrade on their own.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::error::SessionError;

/// Output of `tsh status`.
#[derive(Debug, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub active: Option<Profile>,
}

/// The active profile of the session.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub profile_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

/// Run the status command and return the active profile, or `None` when the
/// command succeeds but no profile is active.
pub async fn active_profile(binary: &str) -> Result<Option<Profile>, SessionError> {
    let output = Command::new(binary)
        .args(["status", "--format=json"])
        .output()
        .await
        .map_err(|err| SessionError::CommandFailed {
            reason: err.to_string(),
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(classify_stderr(&stderr));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        if stderr.to_lowercase().contains("not logged in") {
            return Err(SessionError::NotLoggedIn);
        }
        tracing::debug!(stderr = %stderr.trim(), "Session status command yielded error");
        return Err(SessionError::EmptyOutput);
    }

    parse_status(stdout.trim())
}

fn parse_status(json: &str) -> Result<Option<Profile>, SessionError> {
    let status: Status =
        serde_json::from_str(json).map_err(|source| SessionError::ParseFailed { source })?;
    match status.active {
        Some(profile) if !profile.profile_url.is_empty() => Ok(Some(profile)),
        _ => Ok(None),
    }
}

/// Map the stderr markers the tool is known to emit onto typed errors.
fn classify_stderr(stderr: &str) -> SessionError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("not logged in") {
        SessionError::NotLoggedIn
    } else if lowered.contains("profile expired") {
        SessionError::ProfileExpired
    } else if lowered.contains("private and public keys do not form a valid keypair") {
        SessionError::NoValidKeyPair
    } else {
        SessionError::CommandFailed {
            reason: stderr.trim().to_string(),
        }
    }
}
