//! Typed errors for the tunnel supervision pipeline.
//!
//! Each component seam gets its own error enum so callers can match on the
//! failure mode instead of string-scraping:
//!
//! - [`InventoryError`] - backend node enumeration failures
//! - [`TunnelError`] - tunnel process launch/teardown failures
//! - [`SupervisorError`] - per-installation supervisor construction failures
//! - [`SessionError`] - `tsh status` preflight failures

use std::fmt;
use std::io;

/// Errors from the node inventory lookup for one installation.
#[derive(Debug)]
pub enum InventoryError {
    /// The listing succeeded but produced zero nodes.
    NoNodesFound { installation: String },
    /// The listing itself failed: process error, non-zero exit, or
    /// unreadable output.
    Unavailable {
        installation: String,
        reason: String,
    },
}

impl fmt::Display for InventoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoNodesFound { installation } => {
                write!(f, "no nodes found for installation {installation}")
            }
            Self::Unavailable {
                installation,
                reason,
            } => {
                write!(f, "nodes could not be listed for {installation}: {reason}")
            }
        }
    }
}

impl std::error::Error for InventoryError {}

/// Errors from the external tunnel process.
#[derive(Debug)]
pub enum TunnelError {
    /// The tunnel process could not be created.
    LaunchFailed {
        node: String,
        port: u16,
        source: io::Error,
    },
    /// Killing the tunnel process failed. The handle is cleared by the
    /// caller regardless, so this never leaks a half-stopped state.
    StopFailed { source: io::Error },
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaunchFailed { node, port, source } => {
                write!(f, "failed to start tunnel to {node} on port {port}: {source}")
            }
            Self::StopFailed { source } => write!(f, "failed to stop tunnel: {source}"),
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::LaunchFailed { source, .. } => Some(source),
            Self::StopFailed { source } => Some(source),
        }
    }
}

/// Errors surfaced by [`crate::supervisor::Supervisor::new`].
#[derive(Debug)]
pub enum SupervisorError {
    /// The installation entry is unusable (empty name or domain, or an
    /// unbuildable health-check client).
    InvalidConfiguration { reason: String },
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for SupervisorError {}

/// Errors from the `tsh status` session preflight.
#[derive(Debug)]
pub enum SessionError {
    /// The user has no active session.
    NotLoggedIn,
    /// The active profile exists but has expired.
    ProfileExpired,
    /// The cached key material is inconsistent.
    NoValidKeyPair,
    /// The command exited successfully but printed nothing.
    EmptyOutput,
    /// The command could not be run or exited with an unclassified error.
    CommandFailed { reason: String },
    /// The status JSON could not be parsed.
    ParseFailed { source: serde_json::Error },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLoggedIn => write!(f, "user not logged in"),
            Self::ProfileExpired => write!(f, "active profile expired"),
            Self::NoValidKeyPair => {
                write!(f, "private and public keys do not form a valid keypair")
            }
            Self::EmptyOutput => write!(f, "session status command yielded no output"),
            Self::CommandFailed { reason } => {
                write!(f, "session status command failed: {reason}")
            }
            Self::ParseFailed { source } => {
                write!(f, "failed to parse session status output: {source}")
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ParseFailed { source } => Some(source),
            _ => None,
        }
    }
}
